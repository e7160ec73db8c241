//! Deterministic batch planning plus optional LLM refinement (§4.6).
//!
//! Grounded in `original_source/refactor_bot/planner.py` for the risk
//! function thresholds and the four-stage naive ordering; `PlannerError`
//! follows the error.rs convention of one `thiserror` enum per component.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::config::{Config, VerifierLevel};
use crate::indexer::{DependencyGraph, SymbolExtractor};
use crate::ledger::BatchStatus;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("failed to read plan at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write plan at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed plan json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The thirteen refactoring operations a batch may be scoped to, per spec's
/// planner stage ordering (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Format,
    RemoveUnusedImports,
    RemoveDeadCode,
    Rename,
    ExtractFunction,
    ExtractClass,
    MoveModule,
    SplitModule,
    AddTypes,
    AddTests,
    RefactorInternal,
    AsyncConversion,
    Architecture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub goal: String,
    pub scope_globs: Vec<String>,
    pub allowed_operations: Vec<BatchOperation>,
    pub diff_budget_loc: u32,
    pub risk_score: u32,
    pub verifier_level: VerifierLevel,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "BatchStatus::pending")]
    pub status: BatchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorPlan {
    pub batches: Vec<Batch>,
    #[serde(default)]
    pub total_estimated_loc: u32,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub repo_path: String,
}

impl RefactorPlan {
    pub fn save(&self, path: &Path) -> Result<(), PlannerError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| PlannerError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, PlannerError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PlannerError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn lang_extension(lang: &str) -> &'static str {
    match lang {
        "python" => "py",
        "javascript" => "js",
        "typescript" => "ts",
        "rust" => "rs",
        "go" => "go",
        "java" => "java",
        "gdscript" => "gd",
        "c" => "c",
        "cpp" => "cpp",
        "csharp" => "cs",
        "ruby" => "rb",
        "php" => "php",
        "lua" => "lua",
        _ => "*",
    }
}

const FORMATTABLE_LANGS: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "rust",
    "go",
    "java",
    "gdscript",
    "c",
    "cpp",
    "csharp",
    "ruby",
    "php",
    "lua",
];

/// Produces naive deterministic plans and, optionally, LLM-refined ones.
pub struct Planner<'a> {
    repo_path: &'a Path,
    config: &'a Config,
    symbols: Option<&'a SymbolExtractor>,
    deps: Option<&'a DependencyGraph>,
    batch_counter: u32,
}

impl<'a> Planner<'a> {
    pub fn new(
        repo_path: &'a Path,
        config: &'a Config,
        symbols: Option<&'a SymbolExtractor>,
        deps: Option<&'a DependencyGraph>,
    ) -> Self {
        Self { repo_path, config, symbols, deps, batch_counter: 0 }
    }

    fn next_batch_id(&mut self) -> String {
        self.batch_counter += 1;
        format!("batch-{:03}", self.batch_counter)
    }

    /// Risk function per spec §4.6: total fan-in of the touched files maps
    /// to a 0-100 risk score in three bands.
    fn estimate_risk(&self, files: &[String]) -> u32 {
        let Some(deps) = self.deps else {
            return 50;
        };
        let total_fan_in: usize = files.iter().filter_map(|f| deps.node(f)).map(|n| n.fan_in).sum();
        if total_fan_in <= 5 {
            20
        } else if total_fan_in <= 20 {
            50
        } else {
            (50 + total_fan_in as u32).min(80)
        }
    }

    fn files_by_language(&self) -> HashMap<String, Vec<String>> {
        let Some(symbols) = self.symbols else {
            return HashMap::new();
        };
        let mut by_lang: HashMap<String, Vec<String>> = HashMap::new();
        for (rel_path, info) in symbols.files() {
            let lang = info.language.clone().unwrap_or_else(|| "unknown".to_string());
            by_lang.entry(lang).or_default().push(rel_path.clone());
        }
        by_lang
    }

    /// Build the four-stage naive plan: formatting, import/dead-code
    /// cleanup, hotspot review, and leaf-module refactors — sorted by
    /// ascending risk and truncated to `max_batches`.
    pub fn generate_naive_plan(&mut self) -> RefactorPlan {
        let mut batches = Vec::new();
        let files_by_lang = self.files_by_language();

        if self.config.allow_formatting_only {
            let mut langs: Vec<&String> = files_by_lang.keys().collect();
            langs.sort();
            for lang in langs {
                let files = &files_by_lang[lang];
                if !files.is_empty() && FORMATTABLE_LANGS.contains(&lang.as_str()) {
                    batches.push(Batch {
                        id: self.next_batch_id(),
                        goal: format!("Format all {lang} files"),
                        scope_globs: vec![format!("**/*.{}", lang_extension(lang))],
                        allowed_operations: vec![BatchOperation::Format],
                        diff_budget_loc: 100,
                        risk_score: 5,
                        verifier_level: VerifierLevel::Fast,
                        notes: "Formatting only - no logic changes".to_string(),
                        dependencies: Vec::new(),
                        status: BatchStatus::pending(),
                    });
                }
            }
        }

        let mut cleanup_langs: Vec<&String> = files_by_lang.keys().collect();
        cleanup_langs.sort();
        for lang in cleanup_langs {
            let files = &files_by_lang[lang];
            if !files.is_empty() && matches!(lang.as_str(), "python" | "javascript" | "typescript") {
                batches.push(Batch {
                    id: self.next_batch_id(),
                    goal: format!("Remove unused imports in {lang} files"),
                    scope_globs: vec![format!("**/*.{}", lang_extension(lang))],
                    allowed_operations: vec![BatchOperation::RemoveUnusedImports, BatchOperation::RemoveDeadCode],
                    diff_budget_loc: 150,
                    risk_score: 15,
                    verifier_level: VerifierLevel::Fast,
                    notes: "Safe removal of clearly unused code".to_string(),
                    dependencies: Vec::new(),
                    status: BatchStatus::pending(),
                });
            }
        }

        if let Some(deps) = self.deps {
            for node in deps.hotspots(3).into_iter().take(5) {
                let risk = self.estimate_risk(std::slice::from_ref(&node.path));
                batches.push(Batch {
                    id: self.next_batch_id(),
                    goal: format!("Review and potentially refactor high-impact file: {}", node.path),
                    scope_globs: vec![node.path.clone()],
                    allowed_operations: vec![BatchOperation::Rename, BatchOperation::ExtractFunction, BatchOperation::AddTypes],
                    diff_budget_loc: self.config.diff_budget_loc,
                    risk_score: risk,
                    verifier_level: VerifierLevel::Full,
                    notes: format!("High fan-in ({}): many files depend on this", node.fan_in),
                    dependencies: Vec::new(),
                    status: BatchStatus::pending(),
                });
            }

            let leaves = deps.leaves();
            if !leaves.is_empty() {
                let leaf_paths: Vec<String> = leaves.into_iter().take(10).map(|n| n.path).collect();
                batches.push(Batch {
                    id: self.next_batch_id(),
                    goal: "Refactor leaf modules (no dependents)".to_string(),
                    scope_globs: leaf_paths,
                    allowed_operations: vec![BatchOperation::Rename, BatchOperation::ExtractFunction, BatchOperation::RefactorInternal],
                    diff_budget_loc: self.config.diff_budget_loc,
                    risk_score: 20,
                    verifier_level: VerifierLevel::Fast,
                    notes: "Safe to modify - no other files depend on these".to_string(),
                    dependencies: Vec::new(),
                    status: BatchStatus::pending(),
                });
            }
        }

        batches.sort_by_key(|b| b.risk_score);
        batches.truncate(self.config.max_batches as usize);

        let total_loc = batches.iter().map(|b| b.diff_budget_loc).sum();

        RefactorPlan {
            batches,
            total_estimated_loc: total_loc,
            created_at: Utc::now().to_rfc3339(),
            repo_path: self.repo_path.display().to_string(),
        }
    }

    /// Replace a naive plan's batches with an LLM-refined set, clamping
    /// batch count and per-batch LOC budget to the configured ceilings.
    /// Falls back to the naive plan untouched on any malformed input.
    pub fn apply_refinement(&self, naive: RefactorPlan, refined_batches: Vec<Batch>) -> RefactorPlan {
        let mut refined = refined_batches;
        refined.truncate(self.config.max_batches as usize);
        for batch in &mut refined {
            if batch.diff_budget_loc > self.config.diff_budget_loc {
                batch.diff_budget_loc = self.config.diff_budget_loc;
            }
        }
        let total_loc = refined.iter().map(|b| b.diff_budget_loc).sum();
        RefactorPlan {
            batches: refined,
            total_estimated_loc: total_loc,
            created_at: naive.created_at,
            repo_path: naive.repo_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn naive_plan_orders_formatting_before_hotspots() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def a():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "import a\n").unwrap();
        std::fs::write(dir.path().join("c.py"), "import a\n").unwrap();
        std::fs::write(dir.path().join("d.py"), "import a\n").unwrap();

        let config = Config::default();
        let mut symbols = SymbolExtractor::new(dir.path(), &[]).unwrap();
        symbols.index_files().unwrap();
        let deps = crate::indexer::DependencyAnalyzer::new(dir.path(), &[]).unwrap().analyze().unwrap();

        let mut planner = Planner::new(dir.path(), &config, Some(&symbols), Some(&deps));
        let plan = planner.generate_naive_plan();

        assert!(!plan.batches.is_empty());
        assert_eq!(plan.batches[0].risk_score, 5);
        assert!(plan.batches.windows(2).all(|w| w[0].risk_score <= w[1].risk_score));
    }

    #[test]
    fn risk_estimate_without_deps_defaults_to_moderate() {
        let config = Config::default();
        let planner = Planner::new(Path::new("."), &config, None, None);
        assert_eq!(planner.estimate_risk(&["x.py".to_string()]), 50);
    }

    #[test]
    fn refinement_clamps_budget_and_count() {
        let mut config = Config::default();
        config.max_batches = 1;
        config.diff_budget_loc = 50;
        let planner = Planner::new(Path::new("."), &config, None, None);

        let naive = RefactorPlan {
            batches: Vec::new(),
            total_estimated_loc: 0,
            created_at: "now".to_string(),
            repo_path: "/repo".to_string(),
        };
        let refined_batches = vec![
            Batch {
                id: "batch-001".to_string(),
                goal: "g1".to_string(),
                scope_globs: vec![],
                allowed_operations: vec![BatchOperation::Format],
                diff_budget_loc: 9000,
                risk_score: 10,
                verifier_level: VerifierLevel::Fast,
                notes: String::new(),
                dependencies: vec![],
                status: BatchStatus::pending(),
            },
            Batch {
                id: "batch-002".to_string(),
                goal: "g2".to_string(),
                scope_globs: vec![],
                allowed_operations: vec![BatchOperation::Format],
                diff_budget_loc: 10,
                risk_score: 20,
                verifier_level: VerifierLevel::Fast,
                notes: String::new(),
                dependencies: vec![],
                status: BatchStatus::pending(),
            },
        ];

        let result = planner.apply_refinement(naive, refined_batches);
        assert_eq!(result.batches.len(), 1);
        assert_eq!(result.batches[0].diff_budget_loc, 50);
    }

    #[test]
    fn plan_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let plan = RefactorPlan {
            batches: vec![Batch {
                id: "batch-001".to_string(),
                goal: "format".to_string(),
                scope_globs: vec!["**/*.py".to_string()],
                allowed_operations: vec![BatchOperation::Format],
                diff_budget_loc: 100,
                risk_score: 5,
                verifier_level: VerifierLevel::Fast,
                notes: String::new(),
                dependencies: vec![],
                status: BatchStatus::pending(),
            }],
            total_estimated_loc: 100,
            created_at: "now".to_string(),
            repo_path: "/repo".to_string(),
        };
        let path = dir.path().join("plan.json");
        plan.save(&path).unwrap();
        let loaded = RefactorPlan::load(&path).unwrap();
        assert_eq!(loaded.batches[0].id, "batch-001");
    }
}

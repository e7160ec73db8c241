//! The per-batch state machine driving every other component (§4.12, C13).
//!
//! Grounded in `coordination/src/harness/mod.rs` for the overall
//! validate-then-drive-then-report shape of a top-level orchestrator, and in
//! `original_source/refactor_bot/cli.py`'s `run` command (the original has no
//! standalone executor module — the whole pre-run sequence and per-batch loop
//! live inline in its CLI) for the exact pre-run sequence and per-batch
//! `context → agent → patch → verify` transitions. Errors are folded into
//! [`crate::error::RefactorError`] rather than a separate `ExecutorError`,
//! since that is already the "single place" the error taxonomy doc comment in
//! `error.rs` describes.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::agent::AgentDriver;
use crate::backup::BackupManager;
use crate::config::{Config, HomeDirs};
use crate::context_packer::ContextPackBuilder;
use crate::error::{RefactorError, RefactorResult};
use crate::indexer::{DependencyAnalyzer, DependencyGraph, SymbolExtractor};
use crate::ledger::TaskLedger;
use crate::patch::apply_patch;
use crate::planner::{Batch, Planner, RefactorPlan};
use crate::security::{SecurityReviewResult, SecurityReviewer};
use crate::util::generate_run_id;
use crate::verifier::Verifier;
use crate::workspace::WorkspaceManager;

/// Options controlling one `run` invocation, matching the CLI's `run` flags.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_backup: bool,
    pub dry_run: bool,
    pub max_batches: Option<u32>,
    pub skip_security: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub noop: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeTotals {
    pub lines_added: u32,
    pub lines_removed: u32,
    pub files_touched: Vec<String>,
}

/// The end-of-run JSON report, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub repo_path: String,
    pub repo_name: String,
    pub started_at: String,
    pub completed_at: String,
    pub duration_s: f64,
    pub batches: BatchCounts,
    pub changes: ChangeTotals,
    pub backup_path: Option<String>,
    pub worktree_path: String,
    pub final_commit: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityReviewResult>,
}

/// Everything the CLI needs after a run completes: the report, and (unless
/// the workspace was already cleaned up) the manager the caller can use to
/// explicitly merge back or inspect further.
pub struct ExecutionOutcome {
    pub report: ExecutionReport,
    pub workspace: Option<WorkspaceManager>,
}

/// Drives one end-to-end refactoring run against a repository.
pub struct Executor {
    config: Config,
    home: HomeDirs,
}

impl Executor {
    pub fn new(config: Config, home: HomeDirs) -> Self {
        Self { config, home }
    }

    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub async fn run(&self, repo_path: &Path, options: RunOptions) -> RefactorResult<ExecutionOutcome> {
        let started_at = Utc::now();
        let start_instant = tokio::time::Instant::now();

        if !repo_path.is_dir() {
            return Err(RefactorError::repo_invalid(format!("{} is not a directory", repo_path.display())));
        }
        self.config.validate()?;

        let run_id = generate_run_id();
        let repo_name = repo_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "repo".to_string());
        info!(run_id = %run_id, repo = %repo_path.display(), "starting run");

        self.home.ensure_directories()?;

        let prompts_dir = self.home.home.join("prompts");
        let schemas_dir = self.home.home.join("schemas");
        let preflight_driver = AgentDriver::new(self.config.agent.clone(), &prompts_dir, &schemas_dir, repo_path);
        let agent_version = preflight_driver.check_ready().await?;
        info!(agent_version = %agent_version, "agent binary ready");

        let backup_path = if options.skip_backup {
            None
        } else {
            let manager = BackupManager::new(&self.home.backups, repo_path, &run_id);
            let info = manager.create_backup()?;
            Some(info.backup_path.display().to_string())
        };

        let workspace = WorkspaceManager::create(repo_path, &run_id, &self.home.worktrees)?;
        let workspace_dir = workspace.workspace_dir().to_path_buf();

        let verifier = Verifier::new(&workspace_dir, &self.config);
        let baseline = verifier.run_baseline().await?;
        if !baseline.passed() {
            warn!(failed = baseline.failed_commands().len(), "baseline verification is red, aborting before any batch");
            return Err(RefactorError::BaselineRed(baseline.failed_commands().len()));
        }

        let refactor_bot_dir = workspace_dir.join(".refactor-bot");
        std::fs::create_dir_all(&refactor_bot_dir)?;

        let excludes = &self.config.scope_excludes;
        let mut symbols = SymbolExtractor::new(workspace_dir.as_path(), excludes)?;
        symbols.index_files()?;
        symbols.save_registry(&refactor_bot_dir)?;

        let deps = DependencyAnalyzer::new(workspace_dir.as_path(), excludes)?.analyze()?;
        self.save_dependency_graph(&refactor_bot_dir, &deps)?;

        let mut effective_config = self.config.clone();
        if let Some(max_batches) = options.max_batches {
            effective_config.max_batches = max_batches;
        }

        let driver = AgentDriver::new(effective_config.agent.clone(), prompts_dir, schemas_dir, workspace_dir.clone());

        let mut planner = Planner::new(&workspace_dir, &effective_config, Some(&symbols), Some(&deps));
        let naive_plan = planner.generate_naive_plan();
        let plan = if effective_config.use_llm_planner {
            self.refine_plan(&driver, &workspace_dir, &naive_plan, &symbols, &deps).await.unwrap_or(naive_plan)
        } else {
            naive_plan
        };
        plan.save(&refactor_bot_dir.join("plan.json"))?;

        let ledger_path = refactor_bot_dir.join("TASK_LEDGER.jsonl");
        let mut ledger = TaskLedger::open(&ledger_path)?;

        let mut counts = BatchCounts { total: plan.batches.len(), ..Default::default() };
        let mut changes = ChangeTotals::default();

        if options.dry_run {
            for batch in &plan.batches {
                ledger.record_skipped(&batch.id, &batch.goal, "dry run")?;
                counts.skipped += 1;
            }
        } else {
            let mut recent_completed: Vec<Batch> = Vec::new();
            for batch in &plan.batches {
                let completed = self
                    .run_batch(&driver, &workspace, &verifier, &mut ledger, &symbols, &deps, batch, &recent_completed, &effective_config, &mut counts, &mut changes)
                    .await;
                if completed {
                    recent_completed.push(batch.clone());
                    if recent_completed.len() > 3 {
                        recent_completed.remove(0);
                    }
                }
            }
        }

        let security = if options.dry_run || options.skip_security {
            None
        } else {
            Some(self.review_security(&driver, &workspace_dir, &changes).await)
        };

        let completed_at = Utc::now();
        let final_commit = ledger
            .get_last_checkpoint()
            .map(str::to_string)
            .or_else(|| (!options.dry_run).then(|| workspace.baseline_commit().to_string()));

        let report = ExecutionReport {
            run_id,
            repo_path: repo_path.display().to_string(),
            repo_name,
            started_at: started_at.to_rfc3339(),
            completed_at: completed_at.to_rfc3339(),
            duration_s: start_instant.elapsed().as_secs_f64(),
            batches: counts,
            changes,
            backup_path,
            worktree_path: workspace_dir.display().to_string(),
            final_commit,
            success: true,
            error: None,
            security,
        };
        let report_json = serde_json::to_string_pretty(&report)?;
        std::fs::write(refactor_bot_dir.join("report.json"), report_json)?;

        info!(run_id = %report.run_id, completed = report.batches.completed, failed = report.batches.failed, "run finished");
        Ok(ExecutionOutcome { report, workspace: Some(workspace) })
    }

    async fn refine_plan(
        &self,
        driver: &AgentDriver,
        workspace_dir: &Path,
        naive_plan: &RefactorPlan,
        symbols: &SymbolExtractor,
        deps: &DependencyGraph,
    ) -> Option<RefactorPlan> {
        let architecture_snapshot = self.architecture_snapshot(symbols, deps);
        let packer = ContextPackBuilder::new(workspace_dir, &self.config, Some(symbols), Some(deps), None);
        let context = packer.build_planner_context(naive_plan, &architecture_snapshot);

        let response = driver.call_planner(&context, None).await.ok()?;
        if !response.success {
            return None;
        }
        let output = response.structured_output?;
        let refined_batches: Vec<Batch> = serde_json::from_value(output.get("batches")?.clone()).ok()?;
        Some(Planner::new(workspace_dir, &self.config, Some(symbols), Some(deps)).apply_refinement(naive_plan.clone(), refined_batches))
    }

    fn architecture_snapshot(&self, symbols: &SymbolExtractor, deps: &DependencyGraph) -> String {
        let hotspots = deps.hotspots(3);
        let hotspot_names: Vec<&str> = hotspots.iter().take(5).map(|n| n.path.as_str()).collect();
        format!(
            "files={}, symbols={}, dependency_nodes={}, imports={}, top_hotspots={:?}",
            symbols.files().len(),
            symbols.symbols().len(),
            deps.node_count(),
            deps.import_count(),
            hotspot_names,
        )
    }

    fn save_dependency_graph(&self, refactor_bot_dir: &Path, deps: &DependencyGraph) -> RefactorResult<()> {
        let nodes = deps.nodes();
        let json = serde_json::to_string_pretty(&nodes)?;
        std::fs::write(refactor_bot_dir.join("DEPENDENCY_GRAPH.json"), json)?;
        Ok(())
    }

    /// Drives one batch through its retry loop. Returns whether the batch
    /// ended `completed`, so the caller can track recent successes for the
    /// next batch's context pack.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(batch_id = %batch.id))]
    async fn run_batch(
        &self,
        driver: &AgentDriver,
        workspace: &WorkspaceManager,
        verifier: &Verifier<'_>,
        ledger: &mut TaskLedger,
        symbols: &SymbolExtractor,
        deps: &DependencyGraph,
        batch: &Batch,
        previous_batches: &[Batch],
        config: &Config,
        counts: &mut BatchCounts,
        changes: &mut ChangeTotals,
    ) -> bool {
        let start = tokio::time::Instant::now();
        let _ = ledger.record_start(&batch.id, &batch.goal);

        let mut retry_count = 0;
        loop {
            let packer = ContextPackBuilder::new(workspace.workspace_dir(), config, Some(symbols), Some(deps), Some(&*ledger));
            let context = packer.build_patcher_context(batch, previous_batches);

            let outcome = self.drive_one_attempt(driver, workspace, verifier, batch, &context).await;
            let duration = start.elapsed().as_secs_f64();

            match outcome {
                BatchAttempt::Noop(reason) => {
                    let _ = ledger.record_noop(&batch.id, &batch.goal, &reason);
                    counts.noop += 1;
                    info!(reason = %reason, "batch is a no-op");
                    return false;
                }
                BatchAttempt::Blocked(reason) => {
                    let _ = ledger.record_skipped(&batch.id, &batch.goal, &reason);
                    counts.skipped += 1;
                    info!(reason = %reason, "batch blocked by agent");
                    return false;
                }
                BatchAttempt::Completed { stats, checkpoint_id } => {
                    let _ = ledger.record_success(
                        &batch.id,
                        &batch.goal,
                        stats.files_touched.clone(),
                        stats.lines_added,
                        stats.lines_removed,
                        &checkpoint_id,
                        duration,
                    );
                    counts.completed += 1;
                    changes.lines_added += stats.lines_added;
                    changes.lines_removed += stats.lines_removed;
                    for file in stats.files_touched {
                        if !changes.files_touched.contains(&file) {
                            changes.files_touched.push(file);
                        }
                    }
                    info!(checkpoint = %checkpoint_id, "batch completed");
                    return true;
                }
                BatchAttempt::Failed(reason) => {
                    if retry_count < config.retry_per_batch {
                        retry_count += 1;
                        warn!(retry_count, reason = %reason, "batch failed, retrying");
                        continue;
                    }
                    let _ = ledger.record_failure(&batch.id, &batch.goal, &reason, duration, retry_count);
                    counts.failed += 1;
                    warn!(reason = %reason, "batch failed, retries exhausted");
                    return false;
                }
                BatchAttempt::Cancelled => {
                    let _ = ledger.record_cancelled(&batch.id, &batch.goal, duration);
                    counts.failed += 1;
                    warn!("batch cancelled");
                    return false;
                }
            }
        }
    }

    async fn drive_one_attempt(
        &self,
        driver: &AgentDriver,
        workspace: &WorkspaceManager,
        verifier: &Verifier<'_>,
        batch: &Batch,
        context: &str,
    ) -> BatchAttempt {
        let response = match driver.call_patcher(context, None).await {
            Ok(response) => response,
            Err(e) => return BatchAttempt::Failed(e.to_string()),
        };

        if response.cancelled {
            return BatchAttempt::Cancelled;
        }
        if !response.success {
            return BatchAttempt::Failed(response.error_message.unwrap_or_else(|| "agent call failed".to_string()));
        }

        let Some(output) = response.structured_output else {
            return BatchAttempt::Failed("agent returned no structured output".to_string());
        };

        // Default to `blocked` rather than `ok` when the field is missing: an
        // agent response with no recognizable status should never fall
        // through to a patch application.
        let status = output.get("status").and_then(|v| v.as_str()).unwrap_or("blocked");
        match status {
            "noop" => return BatchAttempt::Noop(output.get("rationale").and_then(|v| v.as_str()).unwrap_or("agent reported no change needed").to_string()),
            "blocked" => return BatchAttempt::Blocked(output.get("rationale").and_then(|v| v.as_str()).unwrap_or("agent declined the batch").to_string()),
            _ => {}
        }

        let diff = output.get("patch_unified_diff").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if diff.trim().is_empty() {
            return BatchAttempt::Noop("empty diff".to_string());
        }

        let applied = apply_patch(workspace.workspace_dir(), &diff, batch, false);
        if !applied.success {
            return BatchAttempt::Failed(applied.error_message.unwrap_or_else(|| "patch application failed".to_string()));
        }
        let Some(stats) = applied.stats else {
            return BatchAttempt::Failed("patch applied but produced no stats".to_string());
        };

        let verification = verifier.run_level(batch.verifier_level).await;
        if !verification.passed() {
            if let Err(e) = workspace.revert_to_baseline() {
                warn!(error = %e, "failed to revert workspace after a failing verification");
            }
            return BatchAttempt::Failed(format!(
                "verification failed: {} command(s) did not pass",
                verification.failed_commands().len()
            ));
        }

        let checkpoint_id = match workspace.checkpoint(&batch.id, &batch.goal) {
            Ok(id) => id,
            Err(e) => return BatchAttempt::Failed(e.to_string()),
        };

        BatchAttempt::Completed { stats, checkpoint_id }
    }

    async fn review_security(&self, driver: &AgentDriver, workspace_dir: &Path, changes: &ChangeTotals) -> SecurityReviewResult {
        let reviewer = SecurityReviewer::new(driver, workspace_dir);
        let summary = format!("{} file(s) touched, +{} -{} lines across the run", changes.files_touched.len(), changes.lines_added, changes.lines_removed);
        match reviewer.review_changes(&changes.files_touched, Some(&summary)).await {
            Ok(result) => result,
            Err(e) => SecurityReviewResult::from_error(e.to_string()),
        }
    }
}

enum BatchAttempt {
    Noop(String),
    Blocked(String),
    Completed { stats: crate::patch::PatchStats, checkpoint_id: String },
    Failed(String),
    Cancelled,
}

/// Merge a run's safety branch back into the source branch. Spec §4.12:
/// "Merging the safety branch into the source branch is a separate,
/// explicitly-acknowledged step" — never performed automatically by `run`.
/// The CLI calls this only after the operator explicitly confirms, the same
/// interactive acceptance prompt the original always shows before merging;
/// when the security review found blocking issues, the CLI defaults that
/// prompt to "no" instead of "yes" rather than skipping it outright.
pub fn accept_run(mut workspace: WorkspaceManager) -> RefactorResult<PathBuf> {
    workspace.merge_back()?;
    let dir = workspace.workspace_dir().to_path_buf();
    workspace.cleanup()?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_default_to_zero() {
        let counts = BatchCounts::default();
        assert_eq!(counts.total, 0);
        assert_eq!(counts.completed, 0);
    }

    #[test]
    fn change_totals_accumulate_unique_files() {
        let mut changes = ChangeTotals::default();
        changes.files_touched.push("a.py".to_string());
        if !changes.files_touched.contains(&"a.py".to_string()) {
            changes.files_touched.push("a.py".to_string());
        }
        assert_eq!(changes.files_touched.len(), 1);
    }
}

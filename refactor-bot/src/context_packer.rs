//! Budgeted prompt assembly for each agent role (§4.7 / C8).
//!
//! Grounded in `original_source/refactor_bot/context_pack.py` for the
//! section ordering and crowd-out behavior. Unlike the original, which
//! declares `used_ledger_entries` on [`ContextBudget`] but never increments
//! it, this port tracks all three budget dimensions for real.

use globset::Glob;

use crate::config::Config;
use crate::indexer::{DependencyGraph, SymbolExtractor};
use crate::ledger::TaskLedger;
use crate::planner::{Batch, RefactorPlan};

/// A shared character/line/ledger-entry budget, crowded out section by
/// section as a context pack is assembled.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_chars: usize,
    pub max_file_lines: usize,
    pub max_ledger_entries: usize,
    pub used_chars: usize,
    pub used_file_lines: usize,
    pub used_ledger_entries: usize,
}

impl ContextBudget {
    pub fn new(max_chars: usize, max_file_lines: usize, max_ledger_entries: usize) -> Self {
        Self { max_chars, max_file_lines, max_ledger_entries, used_chars: 0, used_file_lines: 0, used_ledger_entries: 0 }
    }

    pub fn remaining_chars(&self) -> usize {
        self.max_chars.saturating_sub(self.used_chars)
    }

    pub fn remaining_file_lines(&self) -> usize {
        self.max_file_lines.saturating_sub(self.used_file_lines)
    }

    pub fn can_add_chars(&self, count: usize) -> bool {
        self.used_chars + count <= self.max_chars
    }

    pub fn can_add_lines(&self, count: usize) -> bool {
        self.used_file_lines + count <= self.max_file_lines
    }

    pub fn can_add_ledger_entries(&self, count: usize) -> bool {
        self.used_ledger_entries + count <= self.max_ledger_entries
    }

    pub fn add_chars(&mut self, count: usize) -> bool {
        if !self.can_add_chars(count) {
            return false;
        }
        self.used_chars += count;
        true
    }

    pub fn add_lines(&mut self, count: usize) -> bool {
        if !self.can_add_lines(count) {
            return false;
        }
        self.used_file_lines += count;
        true
    }

    pub fn add_ledger_entries(&mut self, count: usize) -> bool {
        if !self.can_add_ledger_entries(count) {
            return false;
        }
        self.used_ledger_entries += count;
        true
    }
}

/// Assembles role-specific prompt payloads from the indexed repository, the
/// naive/refined plan, and the ledger tail, all under a shared budget.
pub struct ContextPackBuilder<'a> {
    repo_path: &'a std::path::Path,
    config: &'a Config,
    symbols: Option<&'a SymbolExtractor>,
    deps: Option<&'a DependencyGraph>,
    ledger: Option<&'a TaskLedger>,
}

impl<'a> ContextPackBuilder<'a> {
    pub fn new(
        repo_path: &'a std::path::Path,
        config: &'a Config,
        symbols: Option<&'a SymbolExtractor>,
        deps: Option<&'a DependencyGraph>,
        ledger: Option<&'a TaskLedger>,
    ) -> Self {
        Self { repo_path, config, symbols, deps, ledger }
    }

    fn budget(&self) -> ContextBudget {
        ContextBudget::new(
            self.config.max_prompt_chars as usize,
            self.config.max_file_excerpt_lines as usize,
            self.config.max_ledger_entries as usize,
        )
    }

    /// Accepts both literal file paths and glob patterns (`**` treated as
    /// `*`, per spec §4.7).
    fn scope_files(&self, scope_globs: &[String]) -> Vec<String> {
        let mut matching = Vec::new();
        let Some(symbols) = self.symbols else {
            return matching;
        };

        for pattern in scope_globs {
            let full_path = self.repo_path.join(pattern);
            if full_path.is_file() {
                if !matching.contains(pattern) {
                    matching.push(pattern.clone());
                }
                continue;
            }

            let single_star = pattern.replace("**", "*");
            let globs: Vec<globset::GlobMatcher> =
                [pattern.as_str(), single_star.as_str()].iter().filter_map(|p| Glob::new(p).ok()).map(|g| g.compile_matcher()).collect();

            for file_path in symbols.files().keys() {
                if globs.iter().any(|g| g.is_match(file_path)) && !matching.contains(file_path) {
                    matching.push(file_path.clone());
                }
            }
        }
        matching
    }

    fn read_full_file(&self, file_path: &str, budget: &mut ContextBudget) -> Option<String> {
        let full_path = self.repo_path.join(file_path);
        let content = std::fs::read_to_string(&full_path).ok()?;

        let block = format!("### {file_path}\n```\n{content}\n```");
        if budget.can_add_chars(block.len()) {
            budget.add_chars(block.len());
            budget.add_lines(content.matches('\n').count() + 1);
            return Some(block);
        }

        let available = budget.remaining_chars().saturating_sub(100);
        if available > 500 {
            let truncated: String = content.chars().take(available).collect();
            let block = format!("### {file_path} (truncated)\n```\n{truncated}\n[...truncated...]\n```");
            budget.add_chars(block.len());
            return Some(block);
        }
        None
    }

    fn recent_ledger_entries(&self, budget: &mut ContextBudget) -> String {
        let Some(ledger) = self.ledger else {
            return String::new();
        };
        let entries = ledger.get_recent(self.config.max_ledger_entries as usize);
        if entries.is_empty() {
            return String::new();
        }

        let mut lines = vec!["Recent refactoring activity:".to_string()];
        for entry in entries {
            let summary = format!("  - [{}] {:?}: {}", entry.batch_id, entry.status, entry.goal);
            if budget.can_add_chars(summary.len()) && budget.can_add_ledger_entries(1) {
                budget.add_chars(summary.len());
                budget.add_ledger_entries(1);
                lines.push(summary);
            } else {
                break;
            }
        }
        lines.join("\n")
    }

    /// Intro + constraints, architecture snapshot, codebase stats, top
    /// hotspots, and the serialized naive plan.
    pub fn build_planner_context(&self, naive_plan: &RefactorPlan, architecture_snapshot: &str) -> String {
        let mut budget = self.budget();
        let mut sections = Vec::new();

        let intro = format!(
            "You are refining a refactoring plan for a codebase. Review the naive plan below and improve it by:\n\
             - Reordering batches for safety (lowest risk first)\n\
             - Combining or splitting batches as appropriate\n\
             - Ensuring each batch is atomic and verifiable\n\
             - Adding any missed opportunities for improvement\n\n\
             Constraints:\n\
             - Maximum batches: {}\n\
             - Maximum LOC per batch: {}\n\
             - Public API changes allowed: {}\n",
            self.config.max_batches, self.config.diff_budget_loc, self.config.allow_public_api_changes
        );
        budget.add_chars(intro.len());
        sections.push(intro);

        if !architecture_snapshot.is_empty() && budget.can_add_chars(architecture_snapshot.len()) {
            let section = format!("## Architecture Overview\n{architecture_snapshot}");
            budget.add_chars(section.len());
            sections.push(section);
        }

        if let Some(symbols) = self.symbols {
            let stats = format!(
                "## Codebase Statistics\n- Files indexed: {}\n- Symbols found: {}\n",
                symbols.files().len(),
                symbols.symbols().len()
            );
            budget.add_chars(stats.len());
            sections.push(stats);
        }

        if let Some(deps) = self.deps {
            let hotspots = deps.hotspots(3);
            if !hotspots.is_empty() {
                let mut lines = vec!["## High-Impact Files (many dependents)".to_string()];
                for node in hotspots.iter().take(10) {
                    lines.push(format!("- {} (fan-in: {})", node.path, node.fan_in));
                }
                let text = lines.join("\n");
                budget.add_chars(text.len());
                sections.push(text);
            }
        }

        if let Ok(plan_json) = serde_json::to_string_pretty(naive_plan) {
            if budget.can_add_chars(plan_json.len()) {
                budget.add_chars(plan_json.len());
                sections.push(format!("## Naive Plan\n```json\n{plan_json}\n```"));
            }
        }

        sections.join("\n\n")
    }

    /// Batch record, full content of every in-scope file (falling back to a
    /// truncation note), the ledger tail, and a summary of the last ≤3
    /// completed batches.
    pub fn build_patcher_context(&self, batch: &Batch, previous_batches: &[Batch]) -> String {
        let mut budget = self.budget();
        let mut sections = Vec::new();

        let operations: Vec<String> = batch.allowed_operations.iter().map(|op| format!("{op:?}")).collect();
        let batch_info = format!(
            "## Current Batch: {}\nGoal: {}\nScope: {}\nAllowed operations: {}\nDiff budget: {} lines\nNotes: {}\n\n\
             Generate a unified diff patch that accomplishes this goal. If uncertain or if changes would exceed scope, return status='noop'.",
            batch.id,
            batch.goal,
            batch.scope_globs.join(", "),
            operations.join(", "),
            batch.diff_budget_loc,
            batch.notes
        );
        budget.add_chars(batch_info.len());
        sections.push(batch_info);

        let scope_files = self.scope_files(&batch.scope_globs);
        sections.push(format!("## Files in Scope ({} files)", scope_files.len()));

        for file_path in &scope_files {
            match self.read_full_file(file_path, &mut budget) {
                Some(block) => sections.push(block),
                None => sections.push(format!("[File {file_path} truncated due to context limits]")),
            }
        }

        let ledger_info = self.recent_ledger_entries(&mut budget);
        if !ledger_info.is_empty() {
            sections.push(ledger_info);
        }

        if !previous_batches.is_empty() {
            let mut lines = vec!["## Previous Batches".to_string()];
            for prev in previous_batches.iter().rev().take(3).collect::<Vec<_>>().into_iter().rev() {
                lines.push(format!("- [{}] {:?}: {}", prev.id, prev.status, prev.goal));
            }
            let text = lines.join("\n");
            if budget.can_add_chars(text.len()) {
                budget.add_chars(text.len());
                sections.push(text);
            }
        }

        sections.join("\n\n")
    }

    /// Five-decision instructions, batch record, and the candidate diff.
    pub fn build_critic_context(&self, batch: &Batch, patch_diff: &str) -> String {
        let mut budget = self.budget();
        let mut sections = Vec::new();

        let instructions = "## Patch Review\n\
             Review the following patch and determine if it should be applied.\n\n\
             Decide:\n\
             - 'accept': Patch is good, apply it\n\
             - 'reject': Patch is bad, do not apply\n\
             - 'shrink_scope': Patch is too broad, needs smaller scope\n\
             - 'shrink_diff': Patch touches too many lines, needs reduction\n\
             - 'noop': No changes needed, skip this batch\n"
            .to_string();
        budget.add_chars(instructions.len());
        sections.push(instructions);

        let operations: Vec<String> = batch.allowed_operations.iter().map(|op| format!("{op:?}")).collect();
        let batch_info = format!(
            "## Batch: {}\nGoal: {}\nAllowed operations: {}\nDiff budget: {} lines\n",
            batch.id,
            batch.goal,
            operations.join(", "),
            batch.diff_budget_loc
        );
        budget.add_chars(batch_info.len());
        sections.push(batch_info);

        if budget.can_add_chars(patch_diff.len()) {
            budget.add_chars(patch_diff.len());
            sections.push(format!("## Proposed Patch\n```diff\n{patch_diff}\n```"));
        }

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_crowds_out_once_exhausted() {
        let mut budget = ContextBudget::new(10, 5, 2);
        assert!(budget.add_chars(8));
        assert!(!budget.add_chars(5));
        assert!(budget.add_chars(2));
        assert!(budget.add_lines(5));
        assert!(!budget.add_lines(1));
    }

    #[test]
    fn ledger_entry_budget_is_tracked() {
        let mut budget = ContextBudget::new(1000, 1000, 1);
        assert!(budget.add_ledger_entries(1));
        assert!(!budget.can_add_ledger_entries(1));
    }

    #[test]
    fn planner_context_includes_constraints_and_plan() {
        let config = Config::default();
        let builder = ContextPackBuilder::new(std::path::Path::new("."), &config, None, None, None);
        let plan = RefactorPlan { batches: Vec::new(), total_estimated_loc: 0, created_at: String::new(), repo_path: String::new() };
        let context = builder.build_planner_context(&plan, "");
        assert!(context.contains("Maximum batches"));
        assert!(context.contains("Naive Plan"));
    }
}

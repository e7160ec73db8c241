//! Unified diff validation and application (§4.9 / C10).
//!
//! Grounded in `original_source/refactor_bot/patch_apply.py` for the five
//! validation checks and the exact bottom-up fallback hunk algorithm; the
//! `thiserror`/`*Error::code()` shape follows `error.rs`'s convention, and the
//! primary application path shells to `git apply` the way
//! `workspace.rs::run_git` does rather than reimplementing hunk matching
//! (`harness::patch.rs`'s fuzzy matcher solves a different problem — finding
//! where hunks belong in drifted content — and isn't needed here because
//! every patch here is applied against the exact tree it was generated from).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::planner::Batch;
use crate::util::parse_unified_diff_stats;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("patch is empty")]
    Empty,

    #[error("patch changes {total} lines, exceeding the batch budget of {budget}")]
    OverBudget { total: usize, budget: u32 },

    #[error("patch touches {file:?}, which is outside the batch scope {globs:?}")]
    OutOfScope { file: String, globs: Vec<String> },

    #[error("patch contains a binary diff, which is disallowed for this batch")]
    BinaryDisallowed,

    #[error("patch does not apply cleanly: {0}")]
    DoesNotApply(String),

    #[error("patch application failed: {0}")]
    ApplyFailed(String),

    #[error("io error during patch handling: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    /// Machine-readable code, surfaced through [`crate::error::RefactorError::to_structured`].
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "PATCH_EMPTY",
            Self::OverBudget { .. } => "PATCH_OVER_BUDGET",
            Self::OutOfScope { .. } => "PATCH_OUT_OF_SCOPE",
            Self::BinaryDisallowed => "PATCH_BINARY_DISALLOWED",
            Self::DoesNotApply(_) => "PATCH_DOES_NOT_APPLY",
            Self::ApplyFailed(_) => "PATCH_APPLY_FAILED",
            Self::Io(_) => "PATCH_IO_ERROR",
        }
    }
}

/// Line/file stats derived from a diff, per spec §4.9's return shape.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PatchStats {
    pub files_touched: Vec<String>,
    pub lines_added: u32,
    pub lines_removed: u32,
}

impl PatchStats {
    pub fn total_changed(&self) -> u32 {
        self.lines_added + self.lines_removed
    }
}

/// Outcome of one `apply_patch` call, the tuple the executor branches on.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub success: bool,
    pub stats: Option<PatchStats>,
    pub error_message: Option<String>,
}

fn looks_binary(diff: &str) -> bool {
    diff.contains("Binary files ") || diff.contains("GIT binary patch")
}

/// Checks the five constraints of spec §4.9 in order, short-circuiting on the
/// first violation. The dry-run "applies cleanly" check is last because it is
/// the most expensive (it shells out).
pub struct PatchValidator;

impl PatchValidator {
    pub fn validate(
        workspace_dir: &Path,
        diff: &str,
        batch: &Batch,
        allow_binary: bool,
    ) -> Result<PatchStats, PatchError> {
        if diff.trim().is_empty() {
            return Err(PatchError::Empty);
        }

        let (added, removed, files) = parse_unified_diff_stats(diff);
        let total = added + removed;
        if total > batch.diff_budget_loc as usize {
            return Err(PatchError::OverBudget { total, budget: batch.diff_budget_loc });
        }

        if !batch.scope_globs.is_empty() {
            let globset = crate::config::build_globset(&batch.scope_globs).unwrap_or_default();
            for file in &files {
                if !globset.is_match(file) {
                    return Err(PatchError::OutOfScope { file: file.clone(), globs: batch.scope_globs.clone() });
                }
            }
        }

        if !allow_binary && looks_binary(diff) {
            return Err(PatchError::BinaryDisallowed);
        }

        PatchApplicator::new(workspace_dir).check_applies(diff)?;

        Ok(PatchStats { files_touched: files, lines_added: added as u32, lines_removed: removed as u32 })
    }
}

/// One parsed `@@ -os,oc +ns,nc @@` hunk, reduced to what the fallback
/// applicator needs: where it starts in the old file, how many old lines it
/// consumes, and the lines (context + additions) that replace them.
struct Hunk {
    old_start: usize,
    old_count: usize,
    new_lines: Vec<String>,
}

fn parse_fallback_hunks(diff: &str) -> Vec<(String, bool, Vec<Hunk>)> {
    let header_re = regex::Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap();
    let mut files: Vec<(String, bool, Vec<Hunk>)> = Vec::new();
    let mut current_file: Option<String> = None;
    let mut current_is_new = false;
    let mut lines = diff.lines().peekable();

    while let Some(line) = lines.next() {
        if let Some(path) = line.strip_prefix("--- ") {
            current_is_new = path.trim() == "/dev/null";
            continue;
        }
        if let Some(path) = line.strip_prefix("+++ b/") {
            current_file = Some(path.to_string());
            if !files.iter().any(|(f, _, _)| f == current_file.as_ref().unwrap()) {
                files.push((current_file.clone().unwrap(), current_is_new, Vec::new()));
            }
            continue;
        }
        if let Some(caps) = header_re.captures(line) {
            let old_start: usize = caps.get(1).unwrap().as_str().parse().unwrap_or(1);
            let old_count: usize = caps.get(2).map(|m| m.as_str().parse().unwrap_or(1)).unwrap_or(1);
            let mut new_lines = Vec::new();
            while let Some(next) = lines.peek() {
                if next.starts_with("@@") || next.starts_with("diff ") || next.starts_with("--- ") {
                    break;
                }
                let body = lines.next().unwrap();
                if let Some(rest) = body.strip_prefix(' ') {
                    new_lines.push(rest.to_string());
                } else if let Some(rest) = body.strip_prefix('+') {
                    new_lines.push(rest.to_string());
                } else if body.starts_with('-') || body.starts_with('\\') {
                    // removed line or "\ No newline at end of file" marker; contributes nothing to new content
                } else if body.is_empty() {
                    new_lines.push(String::new());
                }
            }
            if let Some((_, _, hunks)) = current_file.as_ref().and_then(|f| files.iter_mut().find(|(name, _, _)| name == f)) {
                hunks.push(Hunk { old_start, old_count, new_lines });
            }
        }
    }
    files
}

/// Applies and reverts unified diffs against a workspace directory, primarily
/// by shelling to `git apply` with a hand-rolled fallback for the rare case
/// where the working tree has drifted enough that `git apply` itself refuses.
pub struct PatchApplicator {
    workspace_dir: PathBuf,
}

impl PatchApplicator {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self { workspace_dir: workspace_dir.into() }
    }

    fn run_git_apply(&self, diff: &str, args: &[&str]) -> Result<(), String> {
        let mut tmp = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
        tmp.write_all(diff.as_bytes()).map_err(|e| e.to_string())?;
        tmp.flush().map_err(|e| e.to_string())?;

        let output = std::process::Command::new("git")
            .arg("apply")
            .args(args)
            .arg(tmp.path())
            .current_dir(&self.workspace_dir)
            .output()
            .map_err(|e| e.to_string())?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    /// Dry-run validation via `git apply --check`.
    pub fn check_applies(&self, diff: &str) -> Result<(), PatchError> {
        self.run_git_apply(diff, &["--check"]).map_err(PatchError::DoesNotApply)
    }

    /// Apply via `git apply`, no fallback.
    pub fn apply(&self, diff: &str) -> Result<(), PatchError> {
        self.run_git_apply(diff, &[]).map_err(PatchError::ApplyFailed)
    }

    /// Reverse-apply a previously applied patch.
    pub fn revert(&self, diff: &str) -> Result<(), PatchError> {
        self.run_git_apply(diff, &["--reverse"]).map_err(PatchError::ApplyFailed)
    }

    /// Try `git apply` first; fall back to the hand-rolled hunk applicator if
    /// it refuses. Returns the list of files touched.
    pub fn apply_with_fallback(&self, diff: &str) -> Result<Vec<String>, PatchError> {
        match self.apply(diff) {
            Ok(()) => Ok(parse_unified_diff_stats(diff).2),
            Err(_) => self.apply_fallback(diff),
        }
    }

    /// Parses `@@ -os[,oc] +ns[,nc] @@` hunks and mutates files directly.
    /// Hunks for one file are applied bottom-up (descending `old_start`) so
    /// earlier line numbers stay valid as later hunks are spliced in.
    fn apply_fallback(&self, diff: &str) -> Result<Vec<String>, PatchError> {
        let files = parse_fallback_hunks(diff);
        let mut touched = Vec::new();

        for (file, is_new, mut hunks) in files {
            let full_path = self.workspace_dir.join(&file);

            if is_new || !full_path.exists() {
                let content: String =
                    hunks.iter().flat_map(|h| h.new_lines.iter()).cloned().collect::<Vec<_>>().join("\n");
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full_path, format!("{content}\n"))?;
                touched.push(file);
                continue;
            }

            let original = std::fs::read_to_string(&full_path)?;
            let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

            hunks.sort_by(|a, b| b.old_start.cmp(&a.old_start));
            for hunk in &hunks {
                let start = hunk.old_start.saturating_sub(1).min(lines.len());
                let end = (start + hunk.old_count).min(lines.len());
                lines.splice(start..end, hunk.new_lines.iter().cloned());
            }

            std::fs::write(&full_path, format!("{}\n", lines.join("\n")))?;
            touched.push(file);
        }

        if touched.is_empty() {
            return Err(PatchError::ApplyFailed("fallback applicator found no hunks to apply".to_string()));
        }
        Ok(touched)
    }
}

/// Validate then apply a patch against `workspace_dir`, the single entry
/// point the executor calls for one batch's candidate diff.
pub fn apply_patch(workspace_dir: &Path, diff: &str, batch: &Batch, allow_binary: bool) -> PatchOutcome {
    let stats = match PatchValidator::validate(workspace_dir, diff, batch, allow_binary) {
        Ok(stats) => stats,
        Err(e) => return PatchOutcome { success: false, stats: None, error_message: Some(e.to_string()) },
    };

    let applicator = PatchApplicator::new(workspace_dir);
    match applicator.apply_with_fallback(diff) {
        Ok(_) => PatchOutcome { success: true, stats: Some(stats), error_message: None },
        Err(e) => PatchOutcome { success: false, stats: None, error_message: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierLevel;
    use crate::ledger::BatchStatus;
    use crate::planner::BatchOperation;
    use tempfile::tempdir;

    fn test_batch(scope_globs: Vec<String>, diff_budget_loc: u32) -> Batch {
        Batch {
            id: "batch-001".to_string(),
            goal: "test".to_string(),
            scope_globs,
            allowed_operations: vec![BatchOperation::RemoveUnusedImports],
            diff_budget_loc,
            risk_score: 10,
            verifier_level: VerifierLevel::Fast,
            notes: String::new(),
            dependencies: Vec::new(),
            status: BatchStatus::pending(),
        }
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            std::process::Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
    }

    fn commit_all(dir: &Path, message: &str) {
        std::process::Command::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        std::process::Command::new("git").args(["commit", "-m", message]).current_dir(dir).output().unwrap();
    }

    #[test]
    fn empty_diff_is_rejected() {
        let dir = tempdir().unwrap();
        let batch = test_batch(vec![], 100);
        let err = PatchValidator::validate(dir.path(), "", &batch, false).unwrap_err();
        assert_eq!(err.code(), "PATCH_EMPTY");
    }

    #[test]
    fn over_budget_diff_is_rejected() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.py"), "import os\nimport sys\nprint(sys.argv)\n").unwrap();
        commit_all(dir.path(), "init");

        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,1 @@\n-import os\n-import sys\n-print(sys.argv)\n+print(1)\n";
        let batch = test_batch(vec!["a.py".to_string()], 2);
        let err = PatchValidator::validate(dir.path(), diff, &batch, false).unwrap_err();
        assert_eq!(err.code(), "PATCH_OVER_BUDGET");
    }

    #[test]
    fn out_of_scope_diff_is_rejected() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.md"), "hello\n").unwrap();
        commit_all(dir.path(), "init");

        let diff = "--- a/docs/readme.md\n+++ b/docs/readme.md\n@@ -1 +1 @@\n-hello\n+hi\n";
        let batch = test_batch(vec!["src/**".to_string()], 100);
        let err = PatchValidator::validate(dir.path(), diff, &batch, false).unwrap_err();
        assert_eq!(err.code(), "PATCH_OUT_OF_SCOPE");
    }

    #[test]
    fn clean_patch_applies_via_git() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.py"), "import os\nimport sys\nprint(sys.argv)\n").unwrap();
        commit_all(dir.path(), "init");

        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";
        let batch = test_batch(vec!["a.py".to_string()], 10);
        let outcome = apply_patch(dir.path(), diff, &batch, false);

        assert!(outcome.success);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.lines_removed, 1);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, "import sys\nprint(sys.argv)\n");
    }

    #[test]
    fn fallback_applies_hunk_when_git_apply_refuses() {
        let dir = tempdir().unwrap();
        // No git repo at all: `git apply` has nothing to check against cleanly
        // once the working tree doesn't match context exactly, but our
        // fallback works directly off file content.
        std::fs::write(dir.path().join("a.py"), "import os\nimport sys\nprint(sys.argv)\n").unwrap();

        let applicator = PatchApplicator::new(dir.path());
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";
        let touched = applicator.apply_fallback(diff).unwrap();
        assert_eq!(touched, vec!["a.py".to_string()]);
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, "import sys\nprint(sys.argv)\n");
    }

    #[test]
    fn fallback_creates_new_file_from_additions_only() {
        let dir = tempdir().unwrap();
        let diff = "--- /dev/null\n+++ b/new.py\n@@ -0,0 +1,2 @@\n+print(1)\n+print(2)\n";
        let applicator = PatchApplicator::new(dir.path());
        let touched = applicator.apply_fallback(diff).unwrap();
        assert_eq!(touched, vec!["new.py".to_string()]);
        let content = std::fs::read_to_string(dir.path().join("new.py")).unwrap();
        assert_eq!(content, "print(1)\nprint(2)\n");
    }

    #[test]
    fn revert_restores_pre_apply_content() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.py"), "import os\nimport sys\nprint(sys.argv)\n").unwrap();
        commit_all(dir.path(), "init");

        let applicator = PatchApplicator::new(dir.path());
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";
        applicator.apply(diff).unwrap();
        applicator.revert(diff).unwrap();

        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, "import os\nimport sys\nprint(sys.argv)\n");
    }
}

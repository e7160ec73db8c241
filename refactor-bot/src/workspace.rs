//! Isolated workspace management: safety branches, checkpoints, reverts, and
//! merge-back into the source repository.
//!
//! Grounded in `harness::git_manager::GitManager` for the retry-wrapped
//! subprocess-driving shape, extended per spec §4.2 with worktree-per-run
//! isolation and `merge_back`, the latter in the spirit of
//! `other_examples/0e049903_ZhiHanZ-forge__src-runner.rs.rs::merge_worktree`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;
const CHECKPOINT_PREFIX: &str = "checkpoint:";

const HYGIENE_DIR_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".venv",
    "__pycache__",
    "target",
];

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("source path {0} does not exist or is not a directory")]
    InvalidSource(String),

    #[error("nothing to checkpoint: working copy has no changes")]
    NothingToCheckpoint,

    #[error("merge_back called before any checkpoint exists")]
    NoCheckpointYet,
}

impl WorkspaceError {
    fn git(args: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Git {
            args: args.into(),
            stderr: stderr.into(),
        }
    }

    /// Transient failures (lock contention, network hiccups on fetch) are
    /// worth a retry; everything else (bad refs, merge conflicts) is not.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Git { stderr, .. } => {
                let s = stderr.to_lowercase();
                s.contains("lock") || s.contains("index.lock") || s.contains("unable to create")
            }
            _ => false,
        }
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorkspaceError::git(args.join(" "), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(WorkspaceError::git(args.join(" "), stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_git_with_retry(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let mut last_error = None;
    for attempt in 0..=DEFAULT_MAX_RETRIES {
        match run_git(dir, args) {
            Ok(output) => return Ok(output),
            Err(e) => {
                if e.is_retryable() && attempt < DEFAULT_MAX_RETRIES {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                } else {
                    return Err(e);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| WorkspaceError::git("retry", "max retries exceeded")))
}

fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map(|n| !HYGIENE_DIR_NAMES.contains(&n))
            .unwrap_or(true)
    }) {
        let entry = entry.map_err(|e| WorkspaceError::Io {
            path: src.display().to_string(),
            source: std::io::Error::other(e),
        })?;
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| WorkspaceError::Io {
                path: target.display().to_string(),
                source,
            })?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            std::fs::copy(entry.path(), &target).map_err(|source| WorkspaceError::Io {
                path: target.display().to_string(),
                source,
            })?;
        }
    }
    Ok(())
}

/// An isolated working copy of the repository being refactored, keyed by run
/// id. Every mutation happens here; the source tree is touched only by
/// `merge_back`.
pub struct WorkspaceManager {
    source_path: PathBuf,
    workspace_dir: PathBuf,
    run_id: String,
    safety_branch: String,
    source_is_git: bool,
    original_branch: Option<String>,
    baseline_commit: String,
    merged: bool,
}

impl WorkspaceManager {
    /// Create an isolated workspace for `run_id` under `worktrees_dir`. For a
    /// git source this is a linked worktree on a fresh `refactor-bot/<run_id>`
    /// branch; otherwise a plain deep copy with its own throwaway git history
    /// so checkpointing still works.
    pub fn create(
        source_path: &Path,
        run_id: &str,
        worktrees_dir: &Path,
    ) -> Result<Self, WorkspaceError> {
        if !source_path.is_dir() {
            return Err(WorkspaceError::InvalidSource(source_path.display().to_string()));
        }
        std::fs::create_dir_all(worktrees_dir).map_err(|source| WorkspaceError::Io {
            path: worktrees_dir.display().to_string(),
            source,
        })?;
        let workspace_dir = worktrees_dir.join(run_id);
        let safety_branch = format!("refactor-bot/{run_id}");
        let source_is_git = is_git_repo(source_path);

        if source_is_git {
            let original_branch = run_git(source_path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
            run_git_with_retry(
                source_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &safety_branch,
                    workspace_dir.to_str().unwrap_or_default(),
                    &original_branch,
                ],
            )?;
            let baseline_commit = run_git(&workspace_dir, &["rev-parse", "HEAD"])?;
            Ok(Self {
                source_path: source_path.to_path_buf(),
                workspace_dir,
                run_id: run_id.to_string(),
                safety_branch,
                source_is_git: true,
                original_branch: Some(original_branch),
                baseline_commit,
                merged: false,
            })
        } else {
            std::fs::create_dir_all(&workspace_dir).map_err(|source| WorkspaceError::Io {
                path: workspace_dir.display().to_string(),
                source,
            })?;
            copy_tree(source_path, &workspace_dir)?;
            run_git(&workspace_dir, &["init"])?;
            run_git(&workspace_dir, &["config", "user.email", "refactor-bot@local"])?;
            run_git(&workspace_dir, &["config", "user.name", "refactor-bot"])?;
            run_git(&workspace_dir, &["add", "-A"])?;
            run_git(&workspace_dir, &["commit", "-m", "baseline snapshot", "--allow-empty"])?;
            let baseline_commit = run_git(&workspace_dir, &["rev-parse", "HEAD"])?;
            Ok(Self {
                source_path: source_path.to_path_buf(),
                workspace_dir,
                run_id: run_id.to_string(),
                safety_branch,
                source_is_git: false,
                original_branch: None,
                baseline_commit,
                merged: false,
            })
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn baseline_commit(&self) -> &str {
        &self.baseline_commit
    }

    /// Stage everything and commit a checkpoint, returning the new commit
    /// hash. The message always begins with `checkpoint:` so
    /// `recent_commits`-style scans can distinguish these from other commits.
    pub fn checkpoint(&self, batch_id: &str, goal: &str) -> Result<String, WorkspaceError> {
        run_git_with_retry(&self.workspace_dir, &["add", "-A"])?;
        let status = run_git(&self.workspace_dir, &["status", "--porcelain"])?;
        if status.is_empty() {
            return Err(WorkspaceError::NothingToCheckpoint);
        }
        let message = format!("{CHECKPOINT_PREFIX} {batch_id}: {goal}");
        run_git_with_retry(&self.workspace_dir, &["commit", "-m", &message])?;
        run_git(&self.workspace_dir, &["rev-parse", "HEAD"])
    }

    /// Hard-reset the workspace to its baseline commit and discard any
    /// untracked files, leaving no partial state on disk.
    pub fn revert_to_baseline(&self) -> Result<(), WorkspaceError> {
        self.revert_to(&self.baseline_commit)
    }

    pub fn revert_to(&self, checkpoint_id: &str) -> Result<(), WorkspaceError> {
        run_git(&self.workspace_dir, &["cat-file", "-t", checkpoint_id])?;
        run_git_with_retry(&self.workspace_dir, &["reset", "--hard", checkpoint_id])?;
        run_git_with_retry(&self.workspace_dir, &["clean", "-fd"])?;
        Ok(())
    }

    /// Unified diff covering every change made since the workspace was
    /// created, including anything still unstaged.
    pub fn diff_from_baseline(&self) -> Result<String, WorkspaceError> {
        run_git(&self.workspace_dir, &["add", "-A", "-N"])?;
        run_git(&self.workspace_dir, &["diff", &self.baseline_commit])
    }

    /// Merge the safety branch back into the branch it was cut from, in the
    /// original source repository. A no-op (but success) if already merged.
    /// Non-git sources have nothing to merge back into and this is a no-op.
    pub fn merge_back(&mut self) -> Result<(), WorkspaceError> {
        if self.merged || !self.source_is_git {
            self.merged = true;
            return Ok(());
        }
        let original_branch = self
            .original_branch
            .as_deref()
            .ok_or(WorkspaceError::NoCheckpointYet)?;

        run_git(&self.source_path, &["checkout", original_branch])?;
        let merge_message = format!("Merge {} via refactor-bot", self.safety_branch);
        run_git_with_retry(
            &self.source_path,
            &["merge", "--no-ff", "-m", &merge_message, &self.safety_branch],
        )?;
        self.merged = true;
        Ok(())
    }

    /// Remove the workspace directory (and, for a git source, unregister the
    /// linked worktree so the source repo's `git worktree list` stays clean).
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        if self.source_is_git {
            let _ = run_git(
                &self.source_path,
                &["worktree", "remove", "--force", self.workspace_dir.to_str().unwrap_or_default()],
            );
        }
        if self.workspace_dir.exists() {
            std::fs::remove_dir_all(&self.workspace_dir).map_err(|source| WorkspaceError::Io {
                path: self.workspace_dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_source_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        run_git(dir.path(), &["init"]).unwrap();
        run_git(dir.path(), &["config", "user.email", "t@t.com"]).unwrap();
        run_git(dir.path(), &["config", "user.name", "T"]).unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        run_git(dir.path(), &["add", "-A"]).unwrap();
        run_git(dir.path(), &["commit", "-m", "initial"]).unwrap();
        dir
    }

    #[test]
    fn create_from_git_source_makes_linked_worktree() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(source.path(), "run1", worktrees.path()).unwrap();
        assert!(ws.workspace_dir().join("a.txt").exists());
        assert!(ws.source_is_git);
    }

    #[test]
    fn checkpoint_and_revert_round_trip() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(source.path(), "run2", worktrees.path()).unwrap();

        std::fs::write(ws.workspace_dir().join("a.txt"), "changed").unwrap();
        let checkpoint = ws.checkpoint("batch-1", "rename thing").unwrap();
        assert!(!checkpoint.is_empty());

        ws.revert_to_baseline().unwrap();
        let content = std::fs::read_to_string(ws.workspace_dir().join("a.txt")).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn checkpoint_with_no_changes_errors() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(source.path(), "run3", worktrees.path()).unwrap();
        assert!(matches!(
            ws.checkpoint("batch-1", "noop"),
            Err(WorkspaceError::NothingToCheckpoint)
        ));
    }

    #[test]
    fn diff_from_baseline_reflects_changes() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(source.path(), "run4", worktrees.path()).unwrap();
        std::fs::write(ws.workspace_dir().join("a.txt"), "changed content").unwrap();
        let diff = ws.diff_from_baseline().unwrap();
        assert!(diff.contains("changed content"));
    }

    #[test]
    fn merge_back_is_idempotent() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let mut ws = WorkspaceManager::create(source.path(), "run5", worktrees.path()).unwrap();
        std::fs::write(ws.workspace_dir().join("b.txt"), "new file").unwrap();
        ws.checkpoint("batch-1", "add file").unwrap();

        ws.merge_back().unwrap();
        assert!(source.path().join("b.txt").exists());
        ws.merge_back().unwrap();
    }

    #[test]
    fn non_git_source_falls_back_to_deep_copy() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("plain.txt"), "plain content").unwrap();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(dir.path(), "run6", worktrees.path()).unwrap();
        assert!(!ws.source_is_git);
        assert!(ws.workspace_dir().join("plain.txt").exists());
        assert!(ws.workspace_dir().join(".git").is_dir());
    }

    #[test]
    fn cleanup_removes_workspace_directory() {
        let source = init_source_repo();
        let worktrees = tempdir().unwrap();
        let ws = WorkspaceManager::create(source.path(), "run7", worktrees.path()).unwrap();
        let dir = ws.workspace_dir().to_path_buf();
        ws.cleanup().unwrap();
        assert!(!dir.exists());
    }
}

//! Run-scoped repository snapshots: a git bundle (when the source is a git
//! repository) plus an always-present compressed tree archive.
//!
//! Grounded in `original_source/refactor_bot/backup.py` for the on-disk
//! layout, exclusion list, and pre-restore displacement semantics; expressed
//! in the struct/thiserror idiom carried from `harness/error.rs`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const EXCLUDED_DIR_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    "dist",
    "build",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
];

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create git bundle: {0}")]
    Bundle(String),

    #[error("failed to build archive: {0}")]
    Archive(String),

    #[error("no backup found with run_id {0}")]
    NotFound(String),

    #[error("backup {0} has neither a bundle nor an archive")]
    NoRestorableArtifact(String),

    #[error("metadata at {0} is malformed")]
    BadMetadata(PathBuf),
}

/// Metadata descriptor written alongside every backup, per spec §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub run_id: String,
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub has_bundle: bool,
    pub has_archive: bool,
}

/// A discovered or freshly-created backup.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub run_id: String,
    pub repo_name: String,
    pub backup_path: PathBuf,
    pub bundle_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl std::fmt::Display for BackupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Backup {}\n  Repository: {}\n  Path: {}\n  Size: {}\n  Created: {}",
            self.run_id,
            self.repo_name,
            self.backup_path.display(),
            crate::util::format_size(self.size_bytes),
            self.created_at.to_rfc3339(),
        )
    }
}

/// Creates and restores run-scoped backups for one repository.
pub struct BackupManager {
    repo_path: PathBuf,
    run_id: String,
    repo_name: String,
    backup_path: PathBuf,
}

fn repo_name_of(repo_path: &Path) -> String {
    repo_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string())
}

fn is_git_repo(path: &Path) -> bool {
    std::process::Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn dir_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

impl BackupManager {
    pub fn new(backups_dir: &Path, repo_path: &Path, run_id: &str) -> Self {
        let repo_name = repo_name_of(repo_path);
        let backup_path = backups_dir.join(&repo_name).join(run_id);
        Self {
            repo_path: repo_path.to_path_buf(),
            run_id: run_id.to_string(),
            repo_name,
            backup_path,
        }
    }

    /// Create a full backup: a git bundle when possible, always a tree
    /// archive, and a metadata descriptor tying them together.
    pub fn create_backup(&self) -> Result<BackupInfo, BackupError> {
        std::fs::create_dir_all(&self.backup_path).map_err(|source| BackupError::Io {
            path: self.backup_path.display().to_string(),
            source,
        })?;

        let bundle_path = if is_git_repo(&self.repo_path) {
            Some(self.create_git_bundle()?)
        } else {
            None
        };
        let archive_path = Some(self.create_archive()?);

        let mut total_size = 0u64;
        if let Some(p) = &bundle_path {
            total_size += dir_size(p);
        }
        if let Some(p) = &archive_path {
            total_size += dir_size(p);
        }

        let created_at = Utc::now();
        self.save_metadata(bundle_path.is_some(), archive_path.is_some(), created_at)?;

        Ok(BackupInfo {
            run_id: self.run_id.clone(),
            repo_name: self.repo_name.clone(),
            backup_path: self.backup_path.clone(),
            bundle_path,
            archive_path,
            created_at,
            size_bytes: total_size,
        })
    }

    fn create_git_bundle(&self) -> Result<PathBuf, BackupError> {
        let bundle_path = self.backup_path.join("backup.bundle");
        let output = std::process::Command::new("git")
            .args(["bundle", "create", bundle_path.to_str().unwrap_or_default(), "--all"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| BackupError::Bundle(e.to_string()))?;
        if !output.status.success() {
            return Err(BackupError::Bundle(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(bundle_path)
    }

    fn create_archive(&self) -> Result<PathBuf, BackupError> {
        let archive_path = self.backup_path.join("backup.tar.gz");
        let file = std::fs::File::create(&archive_path).map_err(|source| BackupError::Io {
            path: archive_path.display().to_string(),
            source,
        })?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in walkdir::WalkDir::new(&self.repo_path).into_iter().filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|n| !EXCLUDED_DIR_NAMES.contains(&n))
                .unwrap_or(true)
        }) {
            let entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.repo_path)
                .unwrap_or(entry.path());
            let arcname = Path::new(&self.repo_name).join(rel);
            builder
                .append_path_with_name(entry.path(), arcname)
                .map_err(|e| BackupError::Archive(e.to_string()))?;
        }

        builder
            .into_inner()
            .map_err(|e| BackupError::Archive(e.to_string()))?
            .finish()
            .map_err(|e| BackupError::Archive(e.to_string()))?;

        Ok(archive_path)
    }

    fn save_metadata(
        &self,
        has_bundle: bool,
        has_archive: bool,
        created_at: DateTime<Utc>,
    ) -> Result<(), BackupError> {
        let metadata = BackupMetadata {
            run_id: self.run_id.clone(),
            repo_name: self.repo_name.clone(),
            repo_path: self.repo_path.clone(),
            created_at,
            has_bundle,
            has_archive,
        };
        let path = self.backup_path.join("metadata.json");
        let json = serde_json::to_string_pretty(&metadata).map_err(|e| BackupError::Archive(e.to_string()))?;
        std::fs::write(&path, json).map_err(|source| BackupError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Move `target` aside as `<name>.pre-restore` (replacing any prior
    /// displaced copy), returning the displacement path if one was made.
    fn displace_existing(target: &Path) -> Result<Option<PathBuf>, BackupError> {
        if !target.exists() {
            return Ok(None);
        }
        let displaced = target.with_file_name(format!(
            "{}.pre-restore",
            target.file_name().unwrap_or_default().to_string_lossy()
        ));
        if displaced.exists() {
            std::fs::remove_dir_all(&displaced).map_err(|source| BackupError::Io {
                path: displaced.display().to_string(),
                source,
            })?;
        }
        std::fs::rename(target, &displaced).map_err(|source| BackupError::Io {
            path: target.display().to_string(),
            source,
        })?;
        Ok(Some(displaced))
    }

    fn restore_displacement_on_failure(displaced: Option<PathBuf>, target: &Path) {
        if let Some(displaced) = displaced {
            let _ = std::fs::rename(&displaced, target);
        }
    }

    /// Restore the repository from its bundle by cloning it back into
    /// `target` (defaulting to the original repo path), displacing any
    /// existing tree first and restoring it if the clone fails.
    pub fn restore_from_bundle(&self, target: Option<&Path>) -> Result<PathBuf, BackupError> {
        let bundle_path = self.backup_path.join("backup.bundle");
        if !bundle_path.exists() {
            return Err(BackupError::NoRestorableArtifact(self.run_id.clone()));
        }
        let target = target.unwrap_or(&self.repo_path).to_path_buf();
        let displaced = Self::displace_existing(&target)?;

        let output = std::process::Command::new("git")
            .args(["clone", bundle_path.to_str().unwrap_or_default(), target.to_str().unwrap_or_default()])
            .output();

        match output {
            Ok(o) if o.status.success() => Ok(target),
            Ok(o) => {
                Self::restore_displacement_on_failure(displaced, &target);
                Err(BackupError::Bundle(String::from_utf8_lossy(&o.stderr).to_string()))
            }
            Err(e) => {
                Self::restore_displacement_on_failure(displaced, &target);
                Err(BackupError::Bundle(e.to_string()))
            }
        }
    }

    /// Restore the repository from its tree archive into `target`'s parent
    /// directory (defaulting to the original repo's parent).
    pub fn restore_from_archive(&self, target_parent: Option<&Path>) -> Result<PathBuf, BackupError> {
        let archive_path = self.backup_path.join("backup.tar.gz");
        if !archive_path.exists() {
            return Err(BackupError::NoRestorableArtifact(self.run_id.clone()));
        }
        let parent = target_parent
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.repo_path.parent().unwrap_or(Path::new(".")).to_path_buf());

        let displaced = Self::displace_existing(&self.repo_path)?;

        let extract = (|| -> Result<(), BackupError> {
            let file = std::fs::File::open(&archive_path).map_err(|source| BackupError::Io {
                path: archive_path.display().to_string(),
                source,
            })?;
            let decoder = flate2::read::GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            archive
                .unpack(&parent)
                .map_err(|e| BackupError::Archive(e.to_string()))
        })();

        match extract {
            Ok(()) => Ok(parent.join(&self.repo_name)),
            Err(e) => {
                Self::restore_displacement_on_failure(displaced, &self.repo_path);
                Err(e)
            }
        }
    }

    /// Delete every artifact for this backup.
    pub fn cleanup(&self) -> Result<(), BackupError> {
        if self.backup_path.exists() {
            std::fs::remove_dir_all(&self.backup_path).map_err(|source| BackupError::Io {
                path: self.backup_path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// List all known backups, optionally scoped to one repo name, newest
    /// first.
    pub fn list_backups(backups_dir: &Path, repo_name: Option<&str>) -> Vec<BackupInfo> {
        let mut backups = Vec::new();
        let repo_dirs: Vec<PathBuf> = if let Some(name) = repo_name {
            let p = backups_dir.join(name);
            if p.is_dir() {
                vec![p]
            } else {
                Vec::new()
            }
        } else {
            std::fs::read_dir(backups_dir)
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_dir())
                        .collect()
                })
                .unwrap_or_default()
        };

        for repo_dir in repo_dirs {
            let Ok(entries) = std::fs::read_dir(&repo_dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let backup_dir = entry.path();
                if !backup_dir.is_dir() {
                    continue;
                }
                let metadata_path = backup_dir.join("metadata.json");
                let Ok(raw) = std::fs::read_to_string(&metadata_path) else {
                    continue;
                };
                let Ok(metadata) = serde_json::from_str::<BackupMetadata>(&raw) else {
                    continue;
                };
                let bundle_path = backup_dir.join("backup.bundle");
                let archive_path = backup_dir.join("backup.tar.gz");
                let size = dir_size(&bundle_path) + dir_size(&archive_path);
                backups.push(BackupInfo {
                    run_id: metadata.run_id,
                    repo_name: metadata.repo_name,
                    backup_path: backup_dir,
                    bundle_path: bundle_path.exists().then_some(bundle_path),
                    archive_path: archive_path.exists().then_some(archive_path),
                    created_at: metadata.created_at,
                    size_bytes: size,
                });
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    pub fn find_backup(backups_dir: &Path, run_id: &str) -> Option<BackupInfo> {
        Self::list_backups(backups_dir, None)
            .into_iter()
            .find(|b| b.run_id == run_id)
    }
}

/// Restore the backup identified by `run_id`, preferring the bundle unless
/// `prefer_bundle` is false or no bundle exists.
pub fn rollback(backups_dir: &Path, run_id: &str, prefer_bundle: bool) -> Result<PathBuf, BackupError> {
    let info =
        BackupManager::find_backup(backups_dir, run_id).ok_or_else(|| BackupError::NotFound(run_id.to_string()))?;
    let manager = BackupManager::new(backups_dir, &info.repo_path(), run_id);

    if prefer_bundle && info.bundle_path.is_some() {
        manager.restore_from_bundle(None)
    } else if info.archive_path.is_some() {
        manager.restore_from_archive(None)
    } else if info.bundle_path.is_some() {
        manager.restore_from_bundle(None)
    } else {
        Err(BackupError::NoRestorableArtifact(run_id.to_string()))
    }
}

impl BackupInfo {
    /// The original repository path, recovered from this backup's metadata.
    fn repo_path(&self) -> PathBuf {
        let metadata_path = self.backup_path.join("metadata.json");
        std::fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<BackupMetadata>(&raw).ok())
            .map(|m| m.repo_path)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_git_repo(dir: &Path) {
        std::process::Command::new("git").args(["init"]).current_dir(dir).output().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "t@t.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "T"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::fs::write(dir.join("a.txt"), "hello").unwrap();
        std::process::Command::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn backup_of_git_repo_creates_bundle_and_archive() {
        let repo = tempdir().unwrap();
        init_git_repo(repo.path());
        let backups = tempdir().unwrap();

        let manager = BackupManager::new(backups.path(), repo.path(), "run1");
        let info = manager.create_backup().unwrap();
        assert!(info.bundle_path.is_some());
        assert!(info.archive_path.is_some());
        assert!(info.size_bytes > 0);
    }

    #[test]
    fn backup_of_non_git_repo_has_no_bundle() {
        let repo = tempdir().unwrap();
        std::fs::write(repo.path().join("plain.txt"), "data").unwrap();
        let backups = tempdir().unwrap();

        let manager = BackupManager::new(backups.path(), repo.path(), "run2");
        let info = manager.create_backup().unwrap();
        assert!(info.bundle_path.is_none());
        assert!(info.archive_path.is_some());
    }

    #[test]
    fn list_backups_sorted_newest_first() {
        let repo = tempdir().unwrap();
        std::fs::write(repo.path().join("x.txt"), "x").unwrap();
        let backups = tempdir().unwrap();

        BackupManager::new(backups.path(), repo.path(), "run-a").create_backup().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        BackupManager::new(backups.path(), repo.path(), "run-b").create_backup().unwrap();

        let listed = BackupManager::list_backups(backups.path(), None);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, "run-b");
    }

    #[test]
    fn restore_from_archive_displaces_existing_tree() {
        let repo = tempdir().unwrap();
        std::fs::write(repo.path().join("x.txt"), "original").unwrap();
        let backups = tempdir().unwrap();
        let manager = BackupManager::new(backups.path(), repo.path(), "run3");
        manager.create_backup().unwrap();

        std::fs::write(repo.path().join("x.txt"), "mutated").unwrap();
        let restored = manager.restore_from_archive(Some(repo.path().parent().unwrap())).unwrap();
        let restored_file = restored.join("x.txt");
        assert!(restored_file.exists());
        assert_eq!(std::fs::read_to_string(restored_file).unwrap(), "original");

        let displaced = repo.path().with_file_name(format!(
            "{}.pre-restore",
            repo.path().file_name().unwrap().to_string_lossy()
        ));
        assert!(displaced.exists());
    }

    #[test]
    fn archive_excludes_hygiene_directories() {
        let repo = tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("node_modules/left-pad")).unwrap();
        std::fs::write(repo.path().join("node_modules/left-pad/index.js"), "x").unwrap();
        std::fs::write(repo.path().join("keep.txt"), "keep").unwrap();
        let backups = tempdir().unwrap();

        let manager = BackupManager::new(backups.path(), repo.path(), "run4");
        let info = manager.create_backup().unwrap();
        let archive_path = info.archive_path.unwrap();

        let file = std::fs::File::open(archive_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("keep.txt")));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
    }
}

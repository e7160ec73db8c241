//! Utility kernel: run/session ids, content hashing, duration formatting,
//! unified-diff stat scanning.
//!
//! Grounded in `original_source/refactor_bot/util.py` for exact semantics
//! (run id format, duration thresholds, diff-stat scanning rules).

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Generate a run id of the form `YYYYMMDD_HHMMSS_<8hex>`.
pub fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &short[..8])
}

/// Generate a fresh session id for one agent call (UUID with dashes).
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// SHA-256 hash of a file's contents, read in fixed-size chunks so large
/// files don't need to be loaded whole.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A hash representing the state of a directory: every file's relative path
/// and content hash, folded together in sorted order so the result is
/// independent of filesystem iteration order.
pub fn dir_hash(root: &Path, excludes: &[String]) -> std::io::Result<String> {
    let matcher = crate::config::build_globset(excludes).unwrap_or_default();
    let mut entries: Vec<(String, std::path::PathBuf)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?.to_path_buf();
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if matcher.is_match(&rel_str) {
                None
            } else {
                Some((rel_str, e.path().to_path_buf()))
            }
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, abs) in entries {
        hasher.update(rel.as_bytes());
        if let Ok(h) = file_hash(&abs) {
            hasher.update(h.as_bytes());
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Human-readable byte size (`B`, `KB`, `MB`, `GB`, `TB`).
pub fn format_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

/// Human-readable duration: `Ns`, `Nm Ss`, or `Nh Nm`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let mins = (seconds / 60.0) as u64;
        let secs = (seconds % 60.0) as u64;
        format!("{}m {}s", mins, secs)
    } else {
        let hours = (seconds / 3600.0) as u64;
        let mins = ((seconds % 3600.0) / 60.0) as u64;
        format!("{}h {}m", hours, mins)
    }
}

/// Truncate a string to at most `max_length` characters, appending `suffix`.
pub fn truncate_string(s: &str, max_length: usize, suffix: &str) -> String {
    if s.chars().count() <= max_length {
        return s.to_string();
    }
    let keep = max_length.saturating_sub(suffix.len());
    let truncated: String = s.chars().take(keep).collect();
    format!("{truncated}{suffix}")
}

/// Count the lines in a string the way a text editor would: a trailing
/// newline does not add a phantom empty line, but content without one still
/// counts its last partial line.
pub fn count_lines(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    let newlines = content.matches('\n').count();
    if content.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}

/// Scan a unified diff for `(lines_added, lines_removed, files_touched)`
/// without attempting to parse hunks — used for budget/scope validation
/// before any application is attempted.
pub fn parse_unified_diff_stats(diff: &str) -> (usize, usize, Vec<String>) {
    let mut added = 0usize;
    let mut removed = 0usize;
    let mut files = std::collections::BTreeSet::new();

    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ b/") {
            files.insert(path.to_string());
        } else if let Some(path) = line.strip_prefix("--- a/") {
            files.insert(path.to_string());
        } else if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }

    (added, removed, files.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_expected_shape() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn session_id_is_a_dashed_uuid() {
        let id = generate_session_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
    }

    #[test]
    fn duration_formatting_thresholds() {
        assert_eq!(format_duration(5.4), "5.4s");
        assert_eq!(format_duration(65.0), "1m 5s");
        assert_eq!(format_duration(3665.0), "1h 1m");
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(500), "500.0 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_string("short", 80, "..."), "short");
        let long = "x".repeat(100);
        let truncated = truncate_string(&long, 10, "...");
        assert_eq!(truncated.chars().count(), 10);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn line_counting_matches_editor_semantics() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("a\nb\n"), 2);
        assert_eq!(count_lines("a\nb"), 2);
        assert_eq!(count_lines("a"), 1);
    }

    #[test]
    fn diff_stats_scan_adds_removes_and_files() {
        let diff = "--- a/a.py\n+++ b/a.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";
        let (added, removed, files) = parse_unified_diff_stats(diff);
        assert_eq!(added, 0);
        assert_eq!(removed, 1);
        assert_eq!(files, vec!["a.py".to_string()]);
    }

    #[test]
    fn diff_stats_ignore_header_lines() {
        let diff = "--- a/x\n+++ b/x\n+new line\n";
        let (added, removed, _) = parse_unified_diff_stats(diff);
        assert_eq!(added, 1);
        assert_eq!(removed, 0);
    }
}

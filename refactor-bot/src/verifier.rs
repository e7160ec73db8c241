//! Running the configured test/lint/typecheck commands at a given depth
//! (§4.10 / C11).
//!
//! Grounded in `original_source/refactor_bot/verifier.py` for the result
//! shapes and the fast-fail-vs-collect-all level semantics; the per-command
//! timeout and whole-process-group kill follow the idiomatic shape of
//! `harness::verifier::pipeline::Verifier::run_with_timeout`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{Config, VerifierLevel};
use crate::util::format_duration;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("failed to write verification result at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize verification result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one command, matching `VerificationStatus` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

/// Result of running a single verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub status: CommandStatus,
    pub exit_code: i32,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
    pub duration_seconds: f64,
}

impl CommandOutcome {
    pub fn passed(&self) -> bool {
        self.status == CommandStatus::Passed
    }

    pub fn summary(&self) -> String {
        let icon = match self.status {
            CommandStatus::Passed => "PASS",
            CommandStatus::Failed => "FAIL",
            CommandStatus::Skipped => "SKIP",
            CommandStatus::Error => "ERR ",
        };
        format!("{icon} {} ({})", self.command, format_duration(self.duration_seconds))
    }
}

/// Result of running a full verification suite at one level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub level: VerifierLevel,
    pub commands: Vec<CommandOutcome>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.commands.iter().all(CommandOutcome::passed)
    }

    pub fn failed_commands(&self) -> Vec<&CommandOutcome> {
        self.commands.iter().filter(|c| !c.passed()).collect()
    }

    pub fn total_duration(&self) -> f64 {
        self.commands.iter().map(|c| c.duration_seconds).sum()
    }

    pub fn summary(&self) -> String {
        let passed = self.commands.iter().filter(|c| c.passed()).count();
        let total = self.commands.len();
        let status = if self.passed() { "PASSED" } else { "FAILED" };
        format!("Verification {status}: {passed}/{total} commands passed ({})", format_duration(self.total_duration()))
    }
}

/// Runs configured verification commands against a workspace.
pub struct Verifier<'a> {
    repo_path: &'a Path,
    config: &'a Config,
    results_dir: PathBuf,
}

impl<'a> Verifier<'a> {
    pub fn new(repo_path: &'a Path, config: &'a Config) -> Self {
        Self { repo_path, config, results_dir: repo_path.join(".refactor-bot").join("verification") }
    }

    /// Run one command through a shell, under a wall-clock timeout. On unix
    /// the command runs in its own process group so a timeout kills the
    /// whole subtree, not just the shell.
    pub async fn run_command(&self, command: &str, timeout_secs: u64) -> CommandOutcome {
        let start = tokio::time::Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(self.repo_path).kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let result = timeout(Duration::from_secs(timeout_secs), cmd.output()).await;
        let duration_seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let status = if output.status.success() { CommandStatus::Passed } else { CommandStatus::Failed };
                CommandOutcome {
                    command: command.to_string(),
                    status,
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration_seconds,
                }
            }
            Ok(Err(io_err)) => CommandOutcome {
                command: command.to_string(),
                status: CommandStatus::Error,
                exit_code: -1,
                stdout: String::new(),
                stderr: io_err.to_string(),
                duration_seconds,
            },
            Err(_) => CommandOutcome {
                command: command.to_string(),
                status: CommandStatus::Error,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {timeout_secs} seconds"),
                duration_seconds,
            },
        }
    }

    /// Fast-fail: stop at the first command that doesn't pass.
    pub async fn run_fast(&self) -> VerificationResult {
        let mut commands = Vec::new();
        for command in &self.config.fast_verifier {
            let outcome = self.run_command(command, DEFAULT_COMMAND_TIMEOUT_SECS).await;
            let passed = outcome.passed();
            commands.push(outcome);
            if !passed {
                break;
            }
        }
        VerificationResult { level: VerifierLevel::Fast, commands }
    }

    /// Collect-all: every command runs regardless of earlier failures.
    pub async fn run_full(&self) -> VerificationResult {
        let mut commands = Vec::new();
        for command in &self.config.full_verifier {
            commands.push(self.run_command(command, DEFAULT_COMMAND_TIMEOUT_SECS).await);
        }
        VerificationResult { level: VerifierLevel::Full, commands }
    }

    pub async fn run_level(&self, level: VerifierLevel) -> VerificationResult {
        match level {
            VerifierLevel::Fast => self.run_fast().await,
            VerifierLevel::Full => self.run_full().await,
        }
    }

    /// Run full verification and persist it as the run's baseline.
    pub async fn run_baseline(&self) -> Result<VerificationResult, VerifierError> {
        let result = self.run_full().await;
        self.save_result(&result, "baseline")?;
        Ok(result)
    }

    pub fn save_result(&self, result: &VerificationResult, name: &str) -> Result<PathBuf, VerifierError> {
        std::fs::create_dir_all(&self.results_dir).map_err(|source| VerifierError::Write {
            path: self.results_dir.display().to_string(),
            source,
        })?;
        let path = self.results_dir.join(format!("{name}.json"));
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, json).map_err(|source| VerifierError::Write { path: path.display().to_string(), source })?;
        Ok(path)
    }

    /// Auto-detect `{fast, full}` command suggestions from project markers.
    ///
    /// Deliberately first-detected-language-wins (`if fast.is_empty() { ... }`),
    /// matching `verifier.py::detect_commands` exactly. This differs from
    /// [`Config::detect_verifiers`], which overwrites on every later marker it
    /// finds; that method seeds a fresh config file from scratch, while this
    /// one is a query the CLI exposes for operators comparing suggestions
    /// against whatever they already configured, so it keeps the original's
    /// first-match behavior rather than being reconciled with it.
    pub fn detect_commands(repo_path: &Path) -> (Vec<String>, Vec<String>) {
        let mut fast = Vec::new();
        let mut full = Vec::new();

        if let Ok(raw) = std::fs::read_to_string(repo_path.join("package.json")) {
            if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) {
                let scripts = pkg.get("scripts").cloned().unwrap_or(serde_json::json!({}));
                let has = |name: &str| scripts.get(name).is_some();
                if has("test") {
                    fast.push("npm test".to_string());
                    full.push("npm test".to_string());
                }
                if has("lint") {
                    full.push("npm run lint".to_string());
                }
                if has("typecheck") {
                    full.push("npm run typecheck".to_string());
                } else if has("type-check") {
                    full.push("npm run type-check".to_string());
                }
            }
        }

        if repo_path.join("pyproject.toml").exists() || repo_path.join("setup.py").exists() {
            if fast.is_empty() {
                fast.push("pytest".to_string());
            }
            if full.is_empty() {
                full.extend(["pytest".to_string(), "ruff check .".to_string(), "mypy .".to_string()]);
            }
        }

        if repo_path.join("Cargo.toml").exists() {
            if fast.is_empty() {
                fast.push("cargo test".to_string());
            }
            if full.is_empty() {
                full.extend(["cargo test".to_string(), "cargo clippy -- -D warnings".to_string()]);
            }
        }

        if repo_path.join("go.mod").exists() {
            if fast.is_empty() {
                fast.push("go test ./...".to_string());
            }
            if full.is_empty() {
                full.extend(["go test ./...".to_string(), "go vet ./...".to_string()]);
            }
        }

        if fast.is_empty() {
            if let Ok(content) = std::fs::read_to_string(repo_path.join("Makefile")) {
                if content.contains("test:") {
                    fast.push("make test".to_string());
                    full.push("make test".to_string());
                }
                if content.contains("lint:") {
                    full.push("make lint".to_string());
                }
            }
        }

        if fast.is_empty() {
            fast.push("echo 'No test command detected'".to_string());
        }
        if full.is_empty() {
            full = fast.clone();
        }

        (fast, full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn passing_command_is_recorded_as_passed() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let verifier = Verifier::new(dir.path(), &config);
        let outcome = verifier.run_command("exit 0", 5).await;
        assert_eq!(outcome.status, CommandStatus::Passed);
    }

    #[tokio::test]
    async fn failing_command_is_recorded_as_failed() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let verifier = Verifier::new(dir.path(), &config);
        let outcome = verifier.run_command("exit 1", 5).await;
        assert_eq!(outcome.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn timed_out_command_is_an_error_not_a_failure() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let verifier = Verifier::new(dir.path(), &config);
        let outcome = verifier.run_command("sleep 5", 1).await;
        assert_eq!(outcome.status, CommandStatus::Error);
    }

    #[tokio::test]
    async fn fast_verification_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.fast_verifier = vec!["exit 1".to_string(), "exit 0".to_string()];
        let verifier = Verifier::new(dir.path(), &config);
        let result = verifier.run_fast().await;
        assert_eq!(result.commands.len(), 1);
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn full_verification_runs_every_command() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.full_verifier = vec!["exit 1".to_string(), "exit 0".to_string()];
        let verifier = Verifier::new(dir.path(), &config);
        let result = verifier.run_full().await;
        assert_eq!(result.commands.len(), 2);
        assert!(!result.passed());
    }

    #[test]
    fn detect_commands_picks_up_cargo_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"\n").unwrap();
        let (fast, full) = Verifier::detect_commands(dir.path());
        assert_eq!(fast, vec!["cargo test".to_string()]);
        assert!(full.contains(&"cargo clippy -- -D warnings".to_string()));
    }

    #[test]
    fn detect_commands_falls_back_when_nothing_detected() {
        let dir = tempdir().unwrap();
        let (fast, full) = Verifier::detect_commands(dir.path());
        assert_eq!(fast, vec!["echo 'No test command detected'".to_string()]);
        assert_eq!(full, fast);
    }
}

//! Typed configuration loaded from `.refactor-bot.config.json` in the target
//! repository, with range validation and marker-based verifier detection.
//!
//! Grounded in `original_source/refactor_bot/config.py` for field set,
//! defaults, and the `detect_verifiers` heuristics.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = ".refactor-bot.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("{field} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        actual: i64,
    },

    #[error("fast_verifier must not be empty")]
    EmptyFastVerifier,
}

/// Configuration for the external agent CLI integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default = "default_tools")]
    pub allowed_tools: String,
    #[serde(default = "default_tools")]
    pub tools: String,
    #[serde(default = "default_max_turns")]
    pub max_turns_patcher: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns_planner: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            allowed_tools: default_tools(),
            tools: default_tools(),
            max_turns_patcher: default_max_turns(),
            max_turns_planner: default_max_turns(),
        }
    }
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_tools() -> String {
    "Read,Edit,Bash,Grep,Glob".to_string()
}

fn default_max_turns() -> u32 {
    50
}

fn default_diff_budget_loc() -> u32 {
    300
}

fn default_max_batches() -> u32 {
    200
}

fn default_max_files_per_batch() -> u32 {
    5
}

fn default_retry_per_batch() -> u32 {
    2
}

fn default_run_full_verifier_every() -> u32 {
    5
}

fn default_fast_verifier() -> Vec<String> {
    vec!["npm test".to_string()]
}

fn default_full_verifier() -> Vec<String> {
    vec!["npm test".to_string(), "npm run typecheck".to_string()]
}

fn default_scope_excludes() -> Vec<String> {
    [
        "**/dist/**",
        "**/build/**",
        "**/.venv/**",
        "**/node_modules/**",
        "**/__pycache__/**",
        "**/.git/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_prompt_chars() -> u32 {
    150_000
}

fn default_max_file_excerpt_lines() -> u32 {
    3000
}

fn default_max_ledger_entries() -> u32 {
    10
}

/// Main configuration for a refactor-bot run, one value per knob in spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_diff_budget_loc")]
    pub diff_budget_loc: u32,
    #[serde(default = "default_max_batches")]
    pub max_batches: u32,
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: u32,
    #[serde(default = "default_retry_per_batch")]
    pub retry_per_batch: u32,
    #[serde(default = "default_run_full_verifier_every")]
    pub run_full_verifier_every: u32,

    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default = "default_fast_verifier")]
    pub fast_verifier: Vec<String>,
    #[serde(default = "default_full_verifier")]
    pub full_verifier: Vec<String>,
    #[serde(default)]
    pub lint_command: Option<String>,
    #[serde(default)]
    pub typecheck_command: Option<String>,

    #[serde(default = "default_scope_excludes")]
    pub scope_excludes: Vec<String>,
    #[serde(default)]
    pub scope_includes: Vec<String>,

    #[serde(default)]
    pub allow_public_api_changes: bool,
    #[serde(default)]
    pub allow_lockfile_changes: bool,
    #[serde(default = "default_true")]
    pub allow_formatting_only: bool,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default = "default_true")]
    pub use_llm_planner: bool,

    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: u32,
    #[serde(default = "default_max_file_excerpt_lines")]
    pub max_file_excerpt_lines: u32,
    #[serde(default = "default_max_ledger_entries")]
    pub max_ledger_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diff_budget_loc: default_diff_budget_loc(),
            max_batches: default_max_batches(),
            max_files_per_batch: default_max_files_per_batch(),
            retry_per_batch: default_retry_per_batch(),
            run_full_verifier_every: default_run_full_verifier_every(),
            build_command: None,
            fast_verifier: default_fast_verifier(),
            full_verifier: default_full_verifier(),
            lint_command: None,
            typecheck_command: None,
            scope_excludes: default_scope_excludes(),
            scope_includes: Vec::new(),
            allow_public_api_changes: false,
            allow_lockfile_changes: false,
            allow_formatting_only: true,
            agent: AgentConfig::default(),
            use_llm_planner: true,
            max_prompt_chars: default_max_prompt_chars(),
            max_file_excerpt_lines: default_max_file_excerpt_lines(),
            max_ledger_entries: default_max_ledger_entries(),
        }
    }
}

macro_rules! check_range {
    ($errors:ident, $field:expr, $value:expr, $min:expr, $max:expr) => {
        if ($value as i64) < $min || ($value as i64) > $max {
            $errors.push(ConfigError::OutOfRange {
                field: $field,
                min: $min,
                max: $max,
                actual: $value as i64,
            });
        }
    };
}

impl Config {
    /// Validate every range-constrained field, matching the pydantic
    /// `Field(ge=..., le=...)` bounds of the original config model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        check_range!(errors, "diff_budget_loc", self.diff_budget_loc, 10, 1000);
        check_range!(errors, "max_batches", self.max_batches, 1, 500);
        check_range!(errors, "max_files_per_batch", self.max_files_per_batch, 1, 100);
        check_range!(errors, "retry_per_batch", self.retry_per_batch, 0, 5);
        check_range!(errors, "run_full_verifier_every", self.run_full_verifier_every, 1, 20);
        check_range!(errors, "max_prompt_chars", self.max_prompt_chars, 10_000, 500_000);
        check_range!(errors, "max_file_excerpt_lines", self.max_file_excerpt_lines, 100, 10_000);
        check_range!(errors, "max_ledger_entries", self.max_ledger_entries, 1, 50);
        check_range!(errors, "max_turns_patcher", self.agent.max_turns_patcher, 1, 100);
        check_range!(errors, "max_turns_planner", self.agent.max_turns_planner, 1, 100);

        if self.fast_verifier.is_empty() {
            errors.push(ConfigError::EmptyFastVerifier);
        }

        // Validate every scope glob compiles; collect the first failure.
        for pattern in self.scope_excludes.iter().chain(self.scope_includes.iter()) {
            if let Err(source) = Glob::new(pattern) {
                errors.push(ConfigError::Glob {
                    pattern: pattern.clone(),
                    source,
                });
            }
        }

        errors.into_iter().next().map(Err).unwrap_or(Ok(()))
    }

    fn config_path(repo_path: &Path) -> std::path::PathBuf {
        repo_path.join(CONFIG_FILE_NAME)
    }

    /// Load configuration from the repo's config file, or fall back to
    /// defaults if it doesn't exist yet.
    pub fn load(repo_path: &Path) -> Result<Self, ConfigError> {
        let path = Self::config_path(repo_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Load configuration, writing the default to disk the first time.
    pub fn load_or_create(repo_path: &Path) -> Result<Self, ConfigError> {
        let path = Self::config_path(repo_path);
        if path.exists() {
            return Self::load(repo_path);
        }
        let config = Self::default();
        config.save(repo_path)?;
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON to the repo's config file,
    /// atomically: the JSON is written to a sibling `.tmp` file first and
    /// renamed into place, so a crash or a concurrent reader never observes a
    /// truncated or half-written config (§4.1).
    pub fn save(&self, repo_path: &Path) -> Result<std::path::PathBuf, ConfigError> {
        let path = Self::config_path(repo_path);
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|source| ConfigError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    /// Auto-detect verification commands from project marker files, mutating
    /// `self` in place and returning it for chaining.
    pub fn detect_verifiers(mut self, repo_path: &Path) -> Self {
        if repo_path.join("package.json").exists() {
            if let Ok(raw) = std::fs::read_to_string(repo_path.join("package.json")) {
                if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) {
                    let scripts = pkg.get("scripts").cloned().unwrap_or(serde_json::json!({}));
                    let has = |name: &str| scripts.get(name).is_some();
                    if has("test") {
                        self.fast_verifier = vec!["npm test".to_string()];
                    }
                    if has("lint") {
                        self.lint_command = Some("npm run lint".to_string());
                    }
                    if has("typecheck") || has("type-check") {
                        self.typecheck_command = Some("npm run typecheck".to_string());
                    }
                    if has("build") {
                        self.build_command = Some("npm run build".to_string());
                    }
                    let mut full = Vec::new();
                    if has("test") {
                        full.push("npm test".to_string());
                    }
                    if has("lint") {
                        full.push("npm run lint".to_string());
                    }
                    if has("typecheck") {
                        full.push("npm run typecheck".to_string());
                    }
                    self.full_verifier = full;
                }
            }
        }

        if repo_path.join("pyproject.toml").exists() || repo_path.join("setup.py").exists() {
            self.fast_verifier = vec!["pytest".to_string()];
            self.full_verifier = vec!["pytest".to_string(), "mypy .".to_string()];
            if let Ok(raw) = std::fs::read_to_string(repo_path.join("pyproject.toml")) {
                if let Ok(toml) = raw.parse::<toml::Value>() {
                    if let Some(tool) = toml.get("tool").and_then(|t| t.as_table()) {
                        if tool.contains_key("ruff") {
                            self.lint_command = Some("ruff check .".to_string());
                        }
                        if tool.contains_key("black") {
                            self.lint_command = Some("black --check .".to_string());
                        }
                        if tool.contains_key("mypy") {
                            self.typecheck_command = Some("mypy .".to_string());
                        }
                    }
                }
            }
        }

        if let Ok(content) = std::fs::read_to_string(repo_path.join("Makefile")) {
            if content.contains("test:") {
                self.fast_verifier = vec!["make test".to_string()];
            }
            if content.contains("lint:") {
                self.lint_command = Some("make lint".to_string());
            }
            if content.contains("build:") {
                self.build_command = Some("make build".to_string());
            }
        }

        if repo_path.join("Cargo.toml").exists() {
            self.fast_verifier = vec!["cargo test".to_string()];
            self.full_verifier = vec!["cargo test".to_string(), "cargo clippy".to_string()];
            self.build_command = Some("cargo build".to_string());
        }

        if repo_path.join("go.mod").exists() {
            self.fast_verifier = vec!["go test ./...".to_string()];
            self.full_verifier = vec!["go test ./...".to_string(), "go vet ./...".to_string()];
            self.build_command = Some("go build ./...".to_string());
        }

        self
    }
}

/// The two verification depths named in spec §3's batch data model, shared
/// by the planner (assigns a level per batch) and the verifier (dispatches
/// on it) so the two don't each carry their own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierLevel {
    Fast,
    Full,
}

/// Compile a list of glob patterns into a matcher. An empty pattern list
/// matches nothing, not everything.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ConfigError::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ConfigError::Glob {
        pattern: patterns.join(","),
        source,
    })
}

/// `~/.refactor-bot` and its subdirectories, matching the original's layout.
pub struct HomeDirs {
    pub home: std::path::PathBuf,
    pub backups: std::path::PathBuf,
    pub worktrees: std::path::PathBuf,
    pub logs: std::path::PathBuf,
}

impl HomeDirs {
    pub fn discover() -> Self {
        let home = dirs_home().join(".refactor-bot");
        Self {
            backups: home.join("backups"),
            worktrees: home.join("worktrees"),
            logs: home.join("logs"),
            home,
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [&self.home, &self.backups, &self.worktrees, &self.logs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn dirs_home() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_original_values() {
        let config = Config::default();
        assert_eq!(config.diff_budget_loc, 300);
        assert_eq!(config.max_batches, 200);
        assert_eq!(config.max_files_per_batch, 5);
        assert_eq!(config.fast_verifier, vec!["npm test".to_string()]);
        assert!(config.allow_formatting_only);
        assert!(!config.allow_public_api_changes);
        assert_eq!(config.agent.max_turns_patcher, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_diff_budget_is_rejected() {
        let mut config = Config::default();
        config.diff_budget_loc = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "diff_budget_loc", .. })
        ));
    }

    #[test]
    fn empty_fast_verifier_is_rejected() {
        let mut config = Config::default();
        config.fast_verifier.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyFastVerifier)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.diff_budget_loc = 123;
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.diff_budget_loc, 123);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn load_or_create_persists_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn detect_verifiers_picks_up_cargo_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"\n").unwrap();
        let config = Config::default().detect_verifiers(dir.path());
        assert_eq!(config.fast_verifier, vec!["cargo test".to_string()]);
        assert_eq!(config.build_command.as_deref(), Some("cargo build"));
    }

    #[test]
    fn detect_verifiers_picks_up_npm_scripts() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest", "lint": "eslint ."}}"#,
        )
        .unwrap();
        let config = Config::default().detect_verifiers(dir.path());
        assert_eq!(config.fast_verifier, vec!["npm test".to_string()]);
        assert_eq!(config.lint_command.as_deref(), Some("npm run lint"));
    }

    #[test]
    fn globset_excludes_match_nested_paths() {
        let globs = build_globset(&["**/node_modules/**".to_string()]).unwrap();
        assert!(globs.is_match("packages/a/node_modules/left-pad/index.js"));
        assert!(!globs.is_match("src/lib.rs"));
    }
}

//! Shared error taxonomy for refactor-bot.
//!
//! Every component returns its own narrow error type; the executor is the
//! single place that folds them into [`RefactorError`], decides retry vs.
//! advance vs. abort, and (for agent-family errors) asks for a machine-readable
//! [`StructuredError`] envelope to put in the ledger and report.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::agent::AgentError;
use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::indexer::IndexError;
use crate::ledger::LedgerError;
use crate::patch::PatchError;
use crate::planner::PlannerError;
use crate::verifier::VerifierError;
use crate::workspace::WorkspaceError;

/// Result type alias for executor-level operations.
pub type RefactorResult<T> = Result<T, RefactorError>;

/// Machine-readable error envelope, attached to ledger entries and the
/// end-of-run report so an operator (or a supervising script) can act on a
/// failure without parsing the human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// The domain taxonomy named in spec §7, one variant family per source.
#[derive(Error, Debug)]
pub enum RefactorError {
    #[error("invalid repository: {message}")]
    RepoInvalid { message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("baseline verification failed: {0} command(s) did not pass")]
    BaselineRed(usize),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefactorError {
    pub fn repo_invalid(message: impl Into<String>) -> Self {
        Self::RepoInvalid { message: message.into() }
    }

    /// Whether this error leaves the run in a state where continuing to the
    /// next batch is meaningful, as opposed to an abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RepoInvalid { .. }
                | Self::Config(_)
                | Self::BaselineRed(_)
                | Self::Workspace(_)
                | Self::Backup(_)
        )
    }

    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::RepoInvalid { .. } => {
                Some("Pass a path to a real, readable directory as the repository root.")
            }
            Self::BaselineRed(_) => Some(
                "Fix the failing baseline commands before running refactor-bot, or narrow \
                 full_verifier to commands that currently pass.",
            ),
            Self::Workspace(_) => Some("Inspect <home>/worktrees/<run_id> and clean up manually."),
            Self::Backup(_) => Some("Check disk space and permissions under <home>/backups."),
            _ => None,
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        let code = match self {
            Self::RepoInvalid { .. } => "REPO_INVALID",
            Self::Config(_) => "CONFIG_INVALID",
            Self::BaselineRed(_) => "BASELINE_RED",
            Self::Workspace(_) => "WORKSPACE_FAILURE",
            Self::Backup(_) => "BACKUP_FAILURE",
            Self::Index(_) => "INDEX_ERROR",
            Self::Planner(_) => "PLANNER_ERROR",
            Self::Agent(e) => e.code(),
            Self::Patch(e) => e.code(),
            Self::Verifier(_) => "VERIFY_FAILED",
            Self::Ledger(_) => "LEDGER_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        };
        let recovery = self
            .recovery_suggestion()
            .unwrap_or("See the report and ledger for details.")
            .to_string();
        StructuredError::new(code, self.to_string(), recovery)
    }
}

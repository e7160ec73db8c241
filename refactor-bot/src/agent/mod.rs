//! External LLM CLI driver (§4.8 / C9).
//!
//! Grounded in `original_source/refactor_bot/claude_driver.py` for the call
//! contract (binary discovery, response-handling steps, role→prompt/schema
//! mapping) and in `other_examples/0e049903_ZhiHanZ-forge__src-runner.rs.rs`
//! for the idiomatic Rust subprocess-driving shape (piped stdout, `Command`
//! builder, role-to-flag mapping). Two behaviors deliberately diverge from
//! the Python original per spec §4.8:
//!
//! - Binary discovery checks the configured path whenever it exists, not
//!   only when it differs from the literal default string `"claude"` (the
//!   Python quirk would silently ignore a user who set `binary = "claude"`
//!   explicitly in a repo where the system `claude` isn't on `PATH` but a
//!   local one is at that exact string).
//! - Tool-exposure flags are passed only for the planner role; the patcher
//!   role gets none, so the model cannot spend turns re-reading files the
//!   context pack already embedded. The Python driver passes the same flags
//!   unconditionally for every role.

mod driver;

pub use driver::{AgentDriver, CancellationHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(
        "agent binary not found: configured path {configured:?} does not exist and \
         no `claude` binary is on PATH"
    )]
    NotFound { configured: String },

    #[error("agent call exceeded its {seconds}s wall-clock ceiling and was killed")]
    Timeout { seconds: u64 },

    #[error("agent call was cancelled")]
    Cancelled,

    #[error("agent exited with code {code}: {stderr}")]
    ExitFailure { code: i32, stderr: String },

    #[error("failed to parse agent stdout as json: {0}")]
    ParseFailure(String),

    #[error("agent reported error_max_turns: turn budget of {max_turns} exhausted")]
    MaxTurnsExceeded { max_turns: u32 },

    #[error("agent response error: {0}")]
    ResponseError(String),

    #[error("agent response failed schema validation: {0}")]
    SchemaInvalid(String),

    #[error("missing system prompt file: {0}")]
    MissingPrompt(String),

    #[error("missing schema file: {0}")]
    MissingSchema(String),

    #[error("invalid schema json in {path}: {source}")]
    SchemaParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error launching agent: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Machine-readable code, surfaced through [`crate::error::RefactorError::to_structured`].
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "AGENT_NOT_FOUND",
            Self::Timeout { .. } => "AGENT_TIMEOUT",
            Self::Cancelled => "AGENT_CANCELLED",
            Self::ExitFailure { .. } => "AGENT_EXIT_FAILURE",
            Self::ParseFailure(_) => "AGENT_PARSE_FAILURE",
            Self::MaxTurnsExceeded { .. } => "AGENT_MAX_TURNS_EXCEEDED",
            Self::ResponseError(_) => "AGENT_RESPONSE_ERROR",
            Self::SchemaInvalid(_) => "AGENT_SCHEMA_INVALID",
            Self::MissingPrompt(_) => "AGENT_PROMPT_MISSING",
            Self::MissingSchema(_) => "AGENT_SCHEMA_MISSING",
            Self::SchemaParse { .. } => "AGENT_SCHEMA_MALFORMED",
            Self::Io(_) => "AGENT_IO_ERROR",
        }
    }

    /// Whether retrying the same call is plausibly worth it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ExitFailure { .. } | Self::ParseFailure(_) | Self::Io(_))
    }
}

/// One of the four agent roles named in spec §4.8. `Security` is the
/// supplemented fourth role (§11.1), with no counterpart in the original
/// `AgentRole` enum beyond planner/patcher/critic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Patcher,
    Critic,
    Security,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Patcher => "patcher",
            Self::Critic => "critic",
            Self::Security => "security",
        }
    }

    fn system_prompt_file_name(&self) -> String {
        format!("{}.system.txt", self.as_str())
    }

    fn schema_file_name(&self) -> String {
        format!("{}.schema.json", self.as_str())
    }

    /// Role-specific turn ceiling. Planner and patcher use the configured
    /// knobs; critic and security get a small fixed budget since they only
    /// review, never explore or edit.
    fn max_turns(&self, config: &Config) -> u32 {
        match self {
            Self::Planner => config.agent.max_turns_planner,
            Self::Patcher => config.agent.max_turns_patcher,
            Self::Critic | Self::Security => 6,
        }
    }

    /// Whether tool-exposure flags (`--allowedTools`/`--tools`) are passed
    /// for this role. Per spec §4.8, only the planner gets tools; the
    /// patcher, critic, and security roles work entirely from their context
    /// pack and must not spend turns re-reading the repository.
    fn exposes_tools(&self) -> bool {
        matches!(self, Self::Planner)
    }
}

/// Outcome of one agent call.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub success: bool,
    pub raw_output: String,
    pub structured_output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub session_id: String,
    pub cancelled: bool,
}

impl AgentResponse {
    fn failure(session_id: String, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            raw_output: String::new(),
            structured_output: None,
            error_message: Some(error_message.into()),
            session_id,
            cancelled: false,
        }
    }
}

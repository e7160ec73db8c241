use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::AgentConfig;
use crate::util::generate_session_id;

use super::{AgentError, AgentResponse, AgentRole};

/// Wall-clock ceiling per agent call, per spec §4.8.
const WALL_CLOCK_CEILING_SECS: u64 = 600;
/// Grace period between SIGTERM and SIGKILL when cancelling an in-flight call.
const CANCEL_GRACE_PERIOD_SECS: u64 = 5;

fn process_alive(pid: u32) -> bool {
    // Signal 0 sends nothing but still checks existence/permission.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// A clonable reference to whichever subprocess the driver currently has in
/// flight. The executor holds one of these alongside the driver so it can
/// cancel a call it no longer wants to wait on (e.g. after a parent timeout
/// or a user-requested stop) without the driver itself needing to expose its
/// internals.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    pid: Arc<Mutex<Option<u32>>>,
}

impl CancellationHandle {
    async fn set(&self, pid: Option<u32>) {
        *self.pid.lock().await = pid;
    }

    /// SIGTERM, then SIGKILL after a 5s grace period if the process hasn't
    /// exited. A no-op if nothing is currently running.
    pub async fn cancel(&self) {
        let Some(pid) = *self.pid.lock().await else {
            return;
        };
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(CANCEL_GRACE_PERIOD_SECS);
        loop {
            if !process_alive(pid) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Drives the external agent binary in one-shot, structured-output mode.
pub struct AgentDriver {
    config: AgentConfig,
    prompts_dir: PathBuf,
    schemas_dir: PathBuf,
    working_dir: PathBuf,
    active: CancellationHandle,
}

impl AgentDriver {
    pub fn new(
        config: AgentConfig,
        prompts_dir: impl Into<PathBuf>,
        schemas_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            prompts_dir: prompts_dir.into(),
            schemas_dir: schemas_dir.into(),
            working_dir: working_dir.into(),
            active: CancellationHandle::default(),
        }
    }

    /// A shared handle the executor can use to cancel whatever call is
    /// currently in flight on this driver.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.active.clone()
    }

    /// Prefer the configured path if it exists; otherwise look up `claude`
    /// on `PATH`. Unlike the original driver, this does not special-case the
    /// literal default string — an explicitly configured `"claude"` that
    /// resolves to a real file is honored just like any other path.
    fn binary_path(&self) -> Result<PathBuf, AgentError> {
        let configured = std::path::Path::new(&self.config.binary);
        if configured.exists() {
            return Ok(configured.to_path_buf());
        }
        which::which("claude").map_err(|_| AgentError::NotFound { configured: self.config.binary.clone() })
    }

    /// Confirms the binary runs and reports its version, for a preflight
    /// check before a run starts.
    pub async fn check_ready(&self) -> Result<String, AgentError> {
        let binary = self.binary_path()?;
        let output = Command::new(&binary).arg("-v").output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(AgentError::ExitFailure {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn load_schema(&self, role: AgentRole) -> Result<(String, Value), AgentError> {
        let schema_file = self.schemas_dir.join(role.schema_file_name());
        if !schema_file.exists() {
            return Err(AgentError::MissingSchema(schema_file.display().to_string()));
        }
        let raw = std::fs::read_to_string(&schema_file)?;
        let schema: Value = serde_json::from_str(&raw).map_err(|source| AgentError::SchemaParse {
            path: schema_file.display().to_string(),
            source,
        })?;
        Ok((raw, schema))
    }

    /// One call to the agent: builds the command for `role`, launches it
    /// under the wall-clock ceiling, and validates the structured response.
    /// `activity_tx`, if given, receives an elapsed-seconds tick every second
    /// the call is in flight.
    pub async fn call(
        &self,
        role: AgentRole,
        prompt: &str,
        activity_tx: Option<tokio::sync::mpsc::UnboundedSender<f64>>,
    ) -> Result<AgentResponse, AgentError> {
        let session_id = generate_session_id();
        let binary = self.binary_path()?;

        let prompt_file = self.prompts_dir.join(role.system_prompt_file_name());
        if !prompt_file.exists() {
            return Err(AgentError::MissingPrompt(prompt_file.display().to_string()));
        }
        let (schema_raw, schema) = self.load_schema(role)?;
        let max_turns = role.max_turns(&self.config);

        let mut cmd = Command::new(&binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--json-schema")
            .arg(&schema_raw)
            .arg("--system-prompt-file")
            .arg(&prompt_file)
            .arg("--max-turns")
            .arg(max_turns.to_string())
            .arg("--session-id")
            .arg(&session_id);

        if role.exposes_tools() {
            cmd.arg("--allowedTools").arg(&self.config.allowed_tools).arg("--tools").arg(&self.config.tools);
        }

        cmd.current_dir(&self.working_dir)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        self.active.set(child.id()).await;
        let start = tokio::time::Instant::now();

        let activity_task = activity_tx.map(|tx| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    if tx.send(start.elapsed().as_secs_f64()).is_err() {
                        break;
                    }
                }
            })
        });

        let wait_result = timeout(Duration::from_secs(WALL_CLOCK_CEILING_SECS), child.wait_with_output()).await;
        if let Some(task) = activity_task {
            task.abort();
        }
        self.active.set(None).await;

        let output = match wait_result {
            Ok(Ok(output)) => output,
            Ok(Err(io_err)) => return Err(AgentError::Io(io_err)),
            Err(_) => return Err(AgentError::Timeout { seconds: WALL_CLOCK_CEILING_SECS }),
        };

        if !output.status.success() {
            if output.status.signal().is_some() {
                return Ok(AgentResponse {
                    success: false,
                    raw_output: String::new(),
                    structured_output: None,
                    error_message: Some("agent call cancelled".to_string()),
                    session_id,
                    cancelled: true,
                });
            }
            return Err(AgentError::ExitFailure {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let parsed: Value = serde_json::from_str(&stdout).map_err(|e| AgentError::ParseFailure(e.to_string()))?;

        if parsed.get("error_max_turns").and_then(Value::as_bool).unwrap_or(false) {
            return Err(AgentError::MaxTurnsExceeded { max_turns });
        }
        if let Some(error_value) = parsed.get("error") {
            if error_value.as_bool() == Some(true) || error_value.is_string() {
                let message = error_value.as_str().map(str::to_string).unwrap_or_else(|| "agent reported an error".to_string());
                return Err(AgentError::ResponseError(message));
            }
        }
        if let Some(errors) = parsed.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(AgentError::ResponseError(format!("{errors:?}")));
            }
        }

        let structured = parsed
            .get("structured_output")
            .cloned()
            .or_else(|| parsed.get("result").and_then(|r| r.get("structured_output")).cloned())
            .or_else(|| parsed.is_object().then(|| parsed.clone()));

        let Some(structured) = structured else {
            return Err(AgentError::ResponseError("no structured_output in agent response".to_string()));
        };

        let compiled = jsonschema::JSONSchema::compile(&schema)
            .map_err(|e| AgentError::SchemaInvalid(format!("{} at {}", e, e.instance_path)))?;
        if let Err(mut errors) = compiled.validate(&structured) {
            let first = errors.next().map(|e| e.to_string()).unwrap_or_else(|| "validation failed".to_string());
            return Err(AgentError::SchemaInvalid(first));
        }

        Ok(AgentResponse {
            success: true,
            raw_output: stdout,
            structured_output: Some(structured),
            error_message: None,
            session_id,
            cancelled: false,
        })
    }

    pub async fn call_planner(&self, context: &str, activity_tx: Option<tokio::sync::mpsc::UnboundedSender<f64>>) -> Result<AgentResponse, AgentError> {
        self.call(AgentRole::Planner, context, activity_tx).await
    }

    pub async fn call_patcher(&self, context: &str, activity_tx: Option<tokio::sync::mpsc::UnboundedSender<f64>>) -> Result<AgentResponse, AgentError> {
        self.call(AgentRole::Patcher, context, activity_tx).await
    }

    pub async fn call_critic(&self, context: &str, activity_tx: Option<tokio::sync::mpsc::UnboundedSender<f64>>) -> Result<AgentResponse, AgentError> {
        self.call(AgentRole::Critic, context, activity_tx).await
    }

    /// No Python counterpart: `claude_driver.py` defines `AgentRole.PLANNER`/
    /// `PATCHER`/`CRITIC` only. The security reviewer (§11.1, C14) is a
    /// supplemented fourth role, so this entry point has no original to port
    /// from and follows the same shape as the other three.
    pub async fn call_security(&self, context: &str, activity_tx: Option<tokio::sync::mpsc::UnboundedSender<f64>>) -> Result<AgentResponse, AgentError> {
        self.call(AgentRole::Security, context, activity_tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_prompt_and_schema(dir: &std::path::Path, role: AgentRole) {
        std::fs::write(dir.join(role.system_prompt_file_name()), "You are a test agent.").unwrap();
        std::fs::write(
            dir.join(role.schema_file_name()),
            r#"{"type": "object", "properties": {"ok": {"type": "boolean"}}, "required": ["ok"]}"#,
        )
        .unwrap();
    }

    #[test]
    fn binary_not_found_when_neither_path_exists() {
        let config = AgentConfig { binary: "/nonexistent/binary-xyz".to_string(), ..AgentConfig::default() };
        let driver = AgentDriver::new(config, ".", ".", ".");
        let err = driver.binary_path().unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
    }

    #[test]
    fn missing_prompt_file_is_detected_before_spawn() {
        let dir = tempdir().unwrap();
        write_prompt_and_schema(dir.path(), AgentRole::Critic);
        let planner_prompt = dir.path().join(AgentRole::Planner.system_prompt_file_name());
        assert!(!planner_prompt.exists());
    }

    #[tokio::test]
    async fn cancellation_handle_is_noop_with_nothing_running() {
        let handle = CancellationHandle::default();
        handle.cancel().await;
    }

    #[test]
    fn role_file_names_follow_convention() {
        assert_eq!(AgentRole::Planner.system_prompt_file_name(), "planner.system.txt");
        assert_eq!(AgentRole::Security.schema_file_name(), "security.schema.json");
    }

    #[test]
    fn only_planner_exposes_tools() {
        assert!(AgentRole::Planner.exposes_tools());
        assert!(!AgentRole::Patcher.exposes_tools());
        assert!(!AgentRole::Critic.exposes_tools());
        assert!(!AgentRole::Security.exposes_tools());
    }
}

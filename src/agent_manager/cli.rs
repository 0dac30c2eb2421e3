//! Reference `AgentManager`: spawns a configurable external binary per
//! session, one task per subprocess.
//!
//! Grounded on the Claude Code CLI client's subprocess-invocation
//! pattern: binary discovery across PATH and common install locations,
//! per-session workspace isolation, and single-JSON-object stdout
//! parsing. Generalized here to an arbitrary external binary rather
//! than one specific vendor.

use super::{AgentManager, AgentSession, SpawnOptions};
use crate::events::AgentEvent;
use crate::events::EventType;
use crate::models::ModelClass;
use crate::{ConductorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The single JSON object an agent binary is expected to print to
/// stdout on completion (success or failure).
#[derive(Debug, Deserialize)]
struct CliResponse {
    success: bool,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
    usage: CliUsage,
}

#[derive(Debug, Deserialize, Default)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    num_turns: u32,
}

pub struct CliAgentManager {
    binary_path: String,
    working_directory: PathBuf,
    sessions: Arc<Mutex<HashMap<String, AgentSession>>>,
    handlers: Arc<Mutex<Vec<Box<dyn Fn(AgentEvent) + Send + Sync>>>>,
}

impl CliAgentManager {
    /// Resolves `binary_path` through `find_binary` when it names a bare
    /// command rather than a path, so a configured name like `claude`
    /// still works on a host whose PATH doesn't reach it directly. An
    /// already-rooted path (absolute or containing a separator) is kept
    /// as-is; an unresolvable bare name falls back unresolved, since
    /// `Command` still attempts its own PATH lookup at spawn time.
    pub fn new(binary_path: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        let binary_path = binary_path.into();
        let resolved = if binary_path.contains(std::path::MAIN_SEPARATOR) || binary_path.contains('/') {
            binary_path
        } else {
            match Self::find_binary(&binary_path) {
                Some(found) => found.to_string_lossy().into_owned(),
                None => binary_path,
            }
        };

        Self {
            binary_path: resolved,
            working_directory: working_directory.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Search PATH plus a handful of common install locations, mirroring
    /// the ambient "don't assume PATH is complete" discovery idiom.
    pub fn find_binary(candidate: &str) -> Option<PathBuf> {
        if let Ok(path_var) = std::env::var("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let full = dir.join(candidate);
                if full.is_file() {
                    return Some(full);
                }
            }
        }

        for common in [
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/usr/bin",
        ] {
            let full = PathBuf::from(common).join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }

        None
    }

    async fn session_workspace(&self, session_id: &str) -> PathBuf {
        self.working_directory.join("sessions").join(session_id)
    }
}

#[async_trait]
impl AgentManager for CliAgentManager {
    async fn spawn_agent(&self, task_id: &str, options: SpawnOptions) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let workspace = self.session_workspace(&session_id).await;
        tokio::fs::create_dir_all(&workspace).await?;

        let mut command = Command::new(&self.binary_path);
        command
            .current_dir(&options.project_path)
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(options.model.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(max_turns) = options.max_turns {
            command.arg("--max-turns").arg(max_turns.to_string());
        }

        let mut child = command.spawn().map_err(|e| ConductorError::Agent {
            message: format!("failed to spawn agent binary '{}': {e}", self.binary_path),
        })?;

        if let Some(stdin) = child.stdin.take() {
            let prompt = options.system_prompt.clone().unwrap_or_default();
            let mut stdin = stdin;
            let _ = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
        }

        self.sessions.lock().await.insert(
            session_id.clone(),
            AgentSession {
                session_id: session_id.clone(),
                task_id: task_id.to_string(),
                model: options.model,
                started_at: Utc::now(),
            },
        );

        let sessions = self.sessions.clone();
        let handlers = self.handlers.clone();
        let session_id_for_task = session_id.clone();
        let task_id_owned = task_id.to_string();
        let model = options.model;

        tokio::spawn(async move {
            let output = child.wait_with_output().await;
            sessions.lock().await.remove(&session_id_for_task);

            let event = match output {
                Ok(output) if output.status.success() => {
                    match serde_json::from_slice::<CliResponse>(&output.stdout) {
                        Ok(response) if response.success => AgentEvent {
                            event_type: EventType::Completion,
                            session_id: session_id_for_task.clone(),
                            task_id: Some(task_id_owned.clone()),
                            data: serde_json::json!({
                                "success": true,
                                "input_tokens": response.usage.input_tokens,
                                "output_tokens": response.usage.output_tokens,
                                "cost_usd": response.usage.total_cost_usd,
                                "num_turns": response.usage.num_turns,
                                "summary": response.summary,
                                "model": model.as_str(),
                            }),
                            timestamp: Utc::now(),
                        },
                        Ok(response) => AgentEvent {
                            event_type: EventType::Error,
                            session_id: session_id_for_task.clone(),
                            task_id: Some(task_id_owned.clone()),
                            data: serde_json::json!({
                                "success": false,
                                "error": response.error,
                                "model": model.as_str(),
                            }),
                            timestamp: Utc::now(),
                        },
                        Err(e) => {
                            warn!(error = %e, "agent stdout was not valid JSON");
                            AgentEvent {
                                event_type: EventType::Error,
                                session_id: session_id_for_task.clone(),
                                task_id: Some(task_id_owned.clone()),
                                data: serde_json::json!({
                                    "success": false,
                                    "error": format!("unparseable agent response: {e}"),
                                }),
                                timestamp: Utc::now(),
                            }
                        }
                    }
                }
                Ok(output) => {
                    error!(
                        code = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "agent process exited non-zero"
                    );
                    AgentEvent {
                        event_type: EventType::Error,
                        session_id: session_id_for_task.clone(),
                        task_id: Some(task_id_owned.clone()),
                        data: serde_json::json!({
                            "success": false,
                            "error": "agent process exited non-zero",
                        }),
                        timestamp: Utc::now(),
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to wait on agent process");
                    AgentEvent {
                        event_type: EventType::Error,
                        session_id: session_id_for_task.clone(),
                        task_id: Some(task_id_owned.clone()),
                        data: serde_json::json!({
                            "success": false,
                            "error": format!("agent process wait failed: {e}"),
                        }),
                        timestamp: Utc::now(),
                    }
                }
            };

            let handlers = handlers.lock().await;
            for handler in handlers.iter() {
                handler(event.clone());
            }
        });

        debug!(%session_id, %task_id, "agent session spawned");
        Ok(session_id)
    }

    async fn inject_message(&self, session_id: &str, _text: &str) -> Result<()> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(ConductorError::NotFound(format!(
                "no active session {session_id}"
            )));
        }
        // The reference binary takes its entire prompt on initial stdin;
        // mid-session injection is not supported by this implementation.
        Err(ConductorError::Validation(
            "mid-session message injection is not supported by the CLI agent manager".to_string(),
        ))
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().await.remove(session_id);
        info!(%session_id, "session marked terminated (best-effort)");
        Ok(())
    }

    async fn get_active_sessions(&self) -> Result<Vec<AgentSession>> {
        Ok(self.sessions.lock().await.values().cloned().collect())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<AgentSession>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    fn on_event(&self, handler: Box<dyn Fn(AgentEvent) + Send + Sync>) {
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            handlers.lock().await.push(handler);
        });
    }
}

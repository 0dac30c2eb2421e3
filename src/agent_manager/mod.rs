//! The external agent runtime, as a collaborator trait.
//!
//! 🏗️ ARCHITECTURE DECISION: agent execution lives entirely outside the
//! core
//! Why: Single Responsibility - the core schedules and accounts for
//! sessions, it never needs to know how a session's tokens got
//! generated. Swapping the AI vendor or protocol means implementing
//! this trait again, not touching the scheduler.

pub mod cli;

pub use cli::CliAgentManager;

use crate::events::AgentEvent;
use crate::models::ModelClass;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub model: ModelClass,
    pub project_path: String,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub task_id: String,
    pub model: ModelClass,
    pub started_at: DateTime<Utc>,
}

/// The contract the scheduler and main loop depend on. A reference
/// implementation (`CliAgentManager`) shells out to a configurable
/// external binary; any implementation that honors this trait — a
/// direct API client, a remote RPC stub — is a drop-in replacement.
#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Start a new agent session for `task_id`. Returns the session id
    /// the caller should use to reserve capacity and track state.
    async fn spawn_agent(&self, task_id: &str, options: SpawnOptions) -> Result<String>;

    /// Send an additional message into a running session (e.g. to
    /// answer a `question` event).
    async fn inject_message(&self, session_id: &str, text: &str) -> Result<()>;

    /// Ask a session to stop. Best-effort; the session may still
    /// deliver a terminal event after this returns.
    async fn terminate_session(&self, session_id: &str) -> Result<()>;

    /// Sessions the runtime believes are still active. Used by
    /// `CapacityTracker::sync_with` after a restart.
    async fn get_active_sessions(&self) -> Result<Vec<AgentSession>>;

    async fn get_session(&self, session_id: &str) -> Result<Option<AgentSession>>;

    /// Register a handler the runtime should invoke whenever it has a
    /// new event for any session. Implementations are expected to feed
    /// this straight into an `EventDispatcher`.
    fn on_event(&self, handler: Box<dyn Fn(AgentEvent) + Send + Sync>);
}

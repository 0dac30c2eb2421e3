use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A unit of work tracked by the queue and, eventually, a repository.
///
/// Tasks arrive from outside the core (via `TaskRepository`); the core
/// only mutates `status` and the timestamps as it moves a task through
/// scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub description: String,
    /// Higher is more urgent. Default 0.
    pub priority: i64,
    pub complexity: Option<Complexity>,
    pub est_sessions_opus: u32,
    pub est_sessions_sonnet: u32,
    pub status: TaskStatus,
    /// True once a human has explicitly signed off on this task's
    /// priority/scope, independent of the approval-gate's own record.
    pub priority_confirmed: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: None,
            title: title.into(),
            description: description.into(),
            priority,
            complexity: None,
            est_sessions_opus: 0,
            est_sessions_sonnet: 0,
            status: TaskStatus::Queued,
            priority_confirmed: false,
            tags: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether this task asks for an Opus session by explicit estimate.
    pub fn wants_opus(&self) -> bool {
        self.est_sessions_opus > 0
    }

    /// Whether this task asks for a Sonnet-pool session by explicit
    /// estimate, or declines to express a preference at all.
    pub fn wants_sonnet(&self) -> bool {
        self.est_sessions_sonnet > 0 || (self.est_sessions_opus == 0 && self.est_sessions_sonnet == 0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Complex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Blocked,
    Complete,
    Failed,
}

/// Coarse capacity-accounting bucket. Haiku shares the Sonnet pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Opus,
    SonnetPool,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Opus => "opus",
            ModelClass::SonnetPool => "sonnet",
        }
    }
}

impl std::fmt::Display for ModelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a single agent session, as tracked by the
/// state manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Blocked,
    WaitingApproval,
    Complete,
    Failed,
}

/// A snapshot of one running (or just-finished) agent session, as held
/// by `StateManager` and persisted to the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub session_id: String,
    pub task_id: String,
    pub model: ModelClass,
    pub started_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub tokens_used: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new(session_id: impl Into<String>, task_id: impl Into<String>, model: ModelClass) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            model,
            started_at: Utc::now(),
            status: AgentStatus::Running,
            tokens_used: 0,
            last_event_at: None,
        }
    }
}

/// `{activeAgents, paused}` — the authoritative orchestration snapshot
/// owned by `StateManager` and mirrored to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub schema_version: u32,
    pub persisted_at: DateTime<Utc>,
    pub paused: bool,
    pub active_agents: HashMap<String, AgentState>,
    /// Fields from a newer schema version this binary doesn't know
    /// about yet. Round-tripped untouched so an old binary never drops
    /// data a newer one wrote.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            schema_version: crate::constants::STATE_FILE_SCHEMA_VERSION,
            persisted_at: Utc::now(),
            paused: false,
            active_agents: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// One recorded spend event, used by `SpendMonitor` for rolling-window
/// anomaly detection and budget accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendRecord {
    pub session_id: String,
    pub task_id: Option<String>,
    pub model: ModelClass,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// A single percentage threshold within a budget period, latched so it
/// fires at most once until the period resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetThreshold {
    pub percentage: f64,
    pub fired: bool,
}

impl BudgetThreshold {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage,
            fired: false,
        }
    }
}

/// One completed (successful or failed) agent run, used by
/// `ProductivityMonitor` for success-rate and streak tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub session_id: String,
    pub task_id: String,
    pub model: ModelClass,
    pub success: bool,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub last_trip_reason: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub reason: Option<String>,
    pub responded_by: Option<String>,
}

/// A usage-log row as written by `UsageLogRepository::create`, mirroring
/// the per-session accounting event emitted by the agent manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub session_id: String,
    pub task_id: Option<String>,
    pub model: ModelClass,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
    pub cost_usd: f64,
    pub event_type: UsageEventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    Completion,
    Error,
    Partial,
}

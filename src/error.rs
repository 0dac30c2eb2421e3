use thiserror::Error;

/// Convenience type alias for Results with ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Main error type for the conductor core
///
/// Represents every error that can occur while scheduling, spawning,
/// and supervising agent sessions, with enough context for the main
/// loop to decide whether to retry, log, or abort.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("System resource error: {message}")]
    SystemResource { message: String },

    #[error("System state error: {message}")]
    SystemState { message: String },

    /// Startup refused because pre-flight checks raised warnings and
    /// confirmation was required. Distinct from `SystemState` so the
    /// process boundary can map this to its own exit code rather than a
    /// generic fatal-startup failure.
    #[error("Pre-flight checks rejected startup: {message}")]
    PreflightRejected { message: String },

    #[error("Circuit breaker open: {reason}")]
    CircuitOpen { reason: String },

    #[error("Budget exceeded: {message}")]
    BudgetExceeded { message: String },

    #[error("Approval rejected for task {task_id}: {reason}")]
    ApprovalRejected { task_id: String, reason: String },

    #[error("Queue is full")]
    QueueFull,

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

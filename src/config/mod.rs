use crate::constants::{
    DEFAULT_APPROVAL_TIMEOUT_MS, DEFAULT_AUTO_APPROVE_PRIORITY_THRESHOLD,
    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_MS,
    DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS, DEFAULT_OPUS_SESSION_LIMIT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_SONNET_SESSION_LIMIT, DEFAULT_STATE_FILE_PATH,
};
use crate::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Process-wide configuration, loaded once from the environment at
/// startup. Every field has a documented default; only fields marked
/// required fail startup when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capacity: CapacityConfig,
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub main_loop: MainLoopConfig,
    pub approval: ApprovalConfig,
    pub agent_runtime: AgentRuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    pub opus_session_limit: u32,
    pub sonnet_session_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_budget_usd: Option<f64>,
    pub weekly_budget_usd: Option<f64>,
    pub hard_stop_at_budget_limit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainLoopConfig {
    pub poll_interval_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    pub state_file_path: String,
    pub validate_database_on_startup: bool,
    pub run_preflight_checks: bool,
    pub require_preflight_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub enable_task_approval: bool,
    pub approval_timeout_ms: u64,
    pub auto_approve_priority_threshold: i64,
    pub auto_approve_confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeConfig {
    pub binary_path: String,
    pub working_directory: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::warn!("Could not load .env file: {}", e),
        }

        let capacity = CapacityConfig {
            opus_session_limit: parse_env_or("OPUS_SESSION_LIMIT", DEFAULT_OPUS_SESSION_LIMIT)?,
            sonnet_session_limit: parse_env_or(
                "SONNET_SESSION_LIMIT",
                DEFAULT_SONNET_SESSION_LIMIT,
            )?,
        };

        if capacity.opus_session_limit == 0 && capacity.sonnet_session_limit == 0 {
            return Err(ConductorError::ConfigurationError(
                "at least one of OPUS_SESSION_LIMIT / SONNET_SESSION_LIMIT must be nonzero"
                    .to_string(),
            ));
        }

        let budget = BudgetConfig {
            daily_budget_usd: parse_optional_env("DAILY_BUDGET_USD")?,
            weekly_budget_usd: parse_optional_env("WEEKLY_BUDGET_USD")?,
            hard_stop_at_budget_limit: parse_env_or("HARD_STOP_AT_BUDGET_LIMIT", false)?,
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse_env_or(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            )?,
            reset_timeout_ms: parse_env_or(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
                DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_MS,
            )?,
        };

        let main_loop = MainLoopConfig {
            poll_interval_ms: parse_env_or("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
            graceful_shutdown_timeout_ms: parse_env_or(
                "GRACEFUL_SHUTDOWN_TIMEOUT_MS",
                DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS,
            )?,
            state_file_path: env::var("STATE_FILE_PATH")
                .unwrap_or_else(|_| DEFAULT_STATE_FILE_PATH.to_string()),
            validate_database_on_startup: parse_env_or("VALIDATE_DATABASE_ON_STARTUP", true)?,
            run_preflight_checks: parse_env_or("RUN_PREFLIGHT_CHECKS", true)?,
            require_preflight_confirmation: parse_env_or(
                "REQUIRE_PREFLIGHT_CONFIRMATION",
                false,
            )?,
        };

        let approval = ApprovalConfig {
            enable_task_approval: parse_env_or("ENABLE_TASK_APPROVAL", false)?,
            approval_timeout_ms: parse_env_or(
                "APPROVAL_TIMEOUT_MS",
                DEFAULT_APPROVAL_TIMEOUT_MS,
            )?,
            auto_approve_priority_threshold: parse_env_or(
                "AUTO_APPROVE_PRIORITY_THRESHOLD",
                DEFAULT_AUTO_APPROVE_PRIORITY_THRESHOLD,
            )?,
            auto_approve_confirmed: parse_env_or("AUTO_APPROVE_CONFIRMED", false)?,
        };

        let agent_runtime = AgentRuntimeConfig {
            binary_path: env::var("AGENT_BINARY_PATH").unwrap_or_else(|_| "claude".to_string()),
            working_directory: env::var("AGENT_WORKING_DIRECTORY")
                .unwrap_or_else(|_| ".".to_string()),
        };

        Ok(Config {
            capacity,
            budget,
            circuit_breaker,
            main_loop,
            approval,
            agent_runtime,
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| {
            ConductorError::ConfigurationError(format!("invalid value for {key}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_optional_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConductorError::ConfigurationError(format!("invalid value for {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

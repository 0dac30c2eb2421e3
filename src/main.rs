use clap::Parser;
use conductor_core::agent_manager::CliAgentManager;
use conductor_core::capacity::{CapacityConfig, CapacityTracker};
use conductor_core::config::Config;
use conductor_core::events::EventDispatcher;
use conductor_core::main_loop::{MainLoop, MainLoopConfig, MainLoopDeps};
use conductor_core::notify::LoggingNotificationSink;
use conductor_core::queue::TaskQueue;
use conductor_core::repositories::{InMemoryTaskRepository, InMemoryUsageLogRepository};
use conductor_core::safety::{
    ApprovalConfig, BudgetConfig, CircuitBreaker, CircuitBreakerConfig, NoopApprovalRequestSink,
    ProductivityConfig, ProductivityMonitor, SpendMonitor, TaskApprovalManager,
};
use conductor_core::scheduler::Scheduler;
use conductor_core::state::StateManager;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Autonomous multi-agent task orchestrator.
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Run a single scheduling tick worth of startup and shutdown, then
    /// exit. Useful for smoke-testing a configuration without leaving
    /// the process running.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };

    info!("starting conductor");

    let queue = Arc::new(TaskQueue::with_default_limit());
    let capacity = Arc::new(CapacityTracker::new(CapacityConfig {
        opus_limit: config.capacity.opus_session_limit,
        sonnet_limit: config.capacity.sonnet_session_limit,
    }));
    let dispatcher = Arc::new(EventDispatcher::new());
    let state_manager = Arc::new(StateManager::new(config.main_loop.state_file_path.clone()));

    let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        reset_timeout: Duration::from_millis(config.circuit_breaker.reset_timeout_ms),
        ..CircuitBreakerConfig::default()
    }));

    let spend_monitor = Arc::new(SpendMonitor::new(BudgetConfig {
        daily_budget_usd: config.budget.daily_budget_usd,
        weekly_budget_usd: config.budget.weekly_budget_usd,
        hard_stop_at_limit: config.budget.hard_stop_at_budget_limit,
    }));

    let productivity_monitor = Arc::new(ProductivityMonitor::new(
        ProductivityConfig::default(),
        conductor_core::constants::DEFAULT_SLOW_SESSION_DURATION_MS,
    ));

    let approval_manager = if config.approval.enable_task_approval {
        Some(Arc::new(TaskApprovalManager::new(
            ApprovalConfig {
                enable_task_approval: true,
                timeout_ms: config.approval.approval_timeout_ms,
                auto_approve_priority_threshold: config.approval.auto_approve_priority_threshold,
                require_approval_for_all: false,
                auto_approve_confirmed: config.approval.auto_approve_confirmed,
            },
            Arc::new(NoopApprovalRequestSink),
        )))
    } else {
        None
    };

    let agent_manager: Arc<dyn conductor_core::agent_manager::AgentManager> = Arc::new(
        CliAgentManager::new(
            config.agent_runtime.binary_path.clone(),
            config.agent_runtime.working_directory.clone(),
        ),
    );

    let task_repository = Arc::new(InMemoryTaskRepository::new());
    let usage_log_repository = Arc::new(InMemoryUsageLogRepository::new(10_000));
    let notification_sink = Arc::new(LoggingNotificationSink);

    let scheduler = Arc::new(Scheduler::new(
        agent_manager.clone(),
        capacity.clone(),
        queue.clone(),
    ));

    let main_loop = MainLoop::new(
        MainLoopConfig {
            poll_interval_ms: config.main_loop.poll_interval_ms,
            graceful_shutdown_timeout_ms: config.main_loop.graceful_shutdown_timeout_ms,
            run_preflight_checks: config.main_loop.run_preflight_checks,
            require_preflight_confirmation: config.main_loop.require_preflight_confirmation,
        },
        MainLoopDeps {
            scheduler,
            agent_manager,
            task_repository,
            usage_log_repository,
            approval_manager,
            spend_monitor,
            productivity_monitor,
            circuit_breaker,
            state_manager,
            capacity,
            dispatcher,
            notification_sink,
        },
    );

    if let Err(e) = main_loop.start().await {
        error!(error = %e, "failed to start main loop");
        return match e {
            conductor_core::ConductorError::PreflightRejected { .. } => ExitCode::from(2),
            _ => ExitCode::from(1),
        };
    }

    if cli.once {
        info!("--once requested, shutting down after startup");
        let _ = main_loop.stop().await;
        return ExitCode::SUCCESS;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    if let Err(e) = main_loop.stop().await {
        error!(error = %e, "error during shutdown");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

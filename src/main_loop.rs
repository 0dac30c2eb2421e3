//! Tick-driven orchestration state machine.
//!
//! 🧠 AGENT COORDINATION DECISION: a single driver task owns the tick
//! Why: every subsystem the tick touches (queue, capacity, state,
//! safety gates) is guarded by its own lock; serializing ticks through
//! one driver means those locks are never contended across ticks, only
//! within one, which keeps the concurrency story simple to reason
//! about.
//! 🔒 CONCURRENCY DESIGN: exactly one tick in flight at a time. A
//! pause takes effect before the next tick starts, never mid-tick.

use crate::agent_manager::AgentManager;
use crate::capacity::CapacityTracker;
use crate::constants::{
    RETRY_BACKOFF_FACTOR, RETRY_INITIAL_BACKOFF_MS, RETRY_JITTER_RATIO, RETRY_MAX_ATTEMPTS,
    RETRY_MAX_BACKOFF_MS,
};
use crate::events::{AgentEvent, EventDispatcher, EventType};
use crate::models::{CompletionRecord, ModelClass, SpendRecord, Task, TaskStatus, UsageEventType, UsageLogEntry};
use crate::notify::{Notification, NotificationSink, Severity};
use crate::repositories::{TaskRepository, UsageLogRepository};
use crate::safety::{CircuitBreaker, ProductivityMonitor, SpendMonitor, TaskApprovalManager};
use crate::scheduler::{ScheduleOutcome, Scheduler};
use crate::state::StateManager;
use crate::{ConductorError, Result};
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

pub struct MainLoopConfig {
    pub poll_interval_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    pub run_preflight_checks: bool,
    pub require_preflight_confirmation: bool,
}

pub struct MainLoopDeps {
    pub scheduler: Arc<Scheduler>,
    pub agent_manager: Arc<dyn AgentManager>,
    pub task_repository: Arc<dyn TaskRepository>,
    pub usage_log_repository: Arc<dyn UsageLogRepository>,
    pub approval_manager: Option<Arc<TaskApprovalManager>>,
    pub spend_monitor: Arc<SpendMonitor>,
    pub productivity_monitor: Arc<ProductivityMonitor>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub state_manager: Arc<StateManager>,
    pub capacity: Arc<CapacityTracker>,
    pub dispatcher: Arc<EventDispatcher>,
    pub notification_sink: Arc<dyn NotificationSink>,
}

pub struct MainLoop {
    config: MainLoopConfig,
    scheduler: Arc<Scheduler>,
    agent_manager: Arc<dyn AgentManager>,
    approval_manager: Option<Arc<TaskApprovalManager>>,
    spend_monitor: Arc<SpendMonitor>,
    circuit_breaker: Arc<CircuitBreaker>,
    state_manager: Arc<StateManager>,
    capacity: Arc<CapacityTracker>,
    dispatcher: Arc<EventDispatcher>,
    notification_sink: Arc<dyn NotificationSink>,
    state: Arc<RwLock<LoopState>>,
    running: Arc<AtomicBool>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    notified_kinds: Arc<Mutex<HashSet<String>>>,
    task_repository: Arc<dyn TaskRepository>,
    usage_log_repository: Arc<dyn UsageLogRepository>,
    productivity_monitor: Arc<ProductivityMonitor>,
}

impl MainLoop {
    pub fn new(config: MainLoopConfig, deps: MainLoopDeps) -> Self {
        Self {
            config,
            scheduler: deps.scheduler,
            agent_manager: deps.agent_manager,
            approval_manager: deps.approval_manager,
            spend_monitor: deps.spend_monitor,
            circuit_breaker: deps.circuit_breaker,
            state_manager: deps.state_manager,
            capacity: deps.capacity,
            dispatcher: deps.dispatcher,
            notification_sink: deps.notification_sink,
            state: Arc::new(RwLock::new(LoopState::Stopped)),
            running: Arc::new(AtomicBool::new(false)),
            tick_handle: Mutex::new(None),
            notified_kinds: Arc::new(Mutex::new(HashSet::new())),
            task_repository: deps.task_repository,
            usage_log_repository: deps.usage_log_repository,
            productivity_monitor: deps.productivity_monitor,
        }
    }

    pub async fn get_state(&self) -> LoopState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, LoopState::Running | LoopState::Paused)
    }

    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == LoopState::Paused
    }

    /// Runs startup: pre-flight checks, state reload, capacity
    /// reconciliation, event wiring, then begins ticking.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != LoopState::Stopped {
                return Err(ConductorError::SystemState {
                    message: "main loop is already running".to_string(),
                });
            }
            *state = LoopState::Starting;
        }

        if self.config.run_preflight_checks {
            let warnings = self.run_preflight_checks().await;
            if !warnings.is_empty() {
                for w in &warnings {
                    warn!(warning = %w, "pre-flight check warning");
                }
                if self.config.require_preflight_confirmation {
                    *self.state.write().await = LoopState::Stopped;
                    return Err(ConductorError::PreflightRejected {
                        message: format!(
                            "pre-flight checks raised {} warning(s); start() refused pending confirmation",
                            warnings.len()
                        ),
                    });
                }
            }
        }

        self.state_manager.load().await?;

        let active: Vec<(ModelClass, String)> = self
            .state_manager
            .get_all_agents()
            .await
            .into_iter()
            .map(|a| (a.model, a.session_id))
            .collect();
        self.capacity.sync_with(&active).await;

        self.wire_events();

        if let Some(warning) = self.capacity.capacity_warning() {
            self.notify_once("capacity_warning", Severity::Warning, warning).await;
        }

        self.running.store(true, Ordering::SeqCst);
        *self.state.write().await = LoopState::Running;

        let handle = self.spawn_tick_task();
        *self.tick_handle.lock().await = Some(handle);

        info!("main loop started");
        Ok(())
    }

    async fn run_preflight_checks(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.capacity.has_capacity(ModelClass::Opus).await
            && !self.capacity.has_capacity(ModelClass::SonnetPool).await
        {
            warnings.push("no capacity available in either model class at startup".to_string());
        }

        if let Err(e) = self.agent_manager.get_active_sessions().await {
            warnings.push(format!("agent manager health check failed: {e}"));
        }

        warnings
    }

    fn spawn_tick_task(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let running = self.running.clone();
        let poll_interval_ms = self.config.poll_interval_ms;

        let scheduler = self.scheduler.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        let spend_monitor = self.spend_monitor.clone();
        let productivity_monitor = self.productivity_monitor.clone();
        let approval_manager = self.approval_manager.clone();
        let notification_sink = self.notification_sink.clone();
        let notified_kinds = self.notified_kinds.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(poll_interval_ms));
            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    break;
                }

                if *state.read().await != LoopState::Running {
                    continue;
                }

                if !circuit_breaker.should_allow().await {
                    let reason = circuit_breaker
                        .last_trip_reason()
                        .await
                        .unwrap_or_else(|| "circuit open".to_string());
                    notify_once(
                        &notified_kinds,
                        &notification_sink,
                        "circuit_open",
                        Severity::Critical,
                        format!("circuit breaker is open: {reason}"),
                    )
                    .await;
                    continue;
                }

                if spend_monitor.should_stop().await {
                    notify_once(
                        &notified_kinds,
                        &notification_sink,
                        "budget_hard_stop",
                        Severity::Critical,
                        "budget hard stop reached, scheduling paused".to_string(),
                    )
                    .await;
                    continue;
                }

                if !productivity_monitor.allow().await {
                    notify_once(
                        &notified_kinds,
                        &notification_sink,
                        "productivity_halt",
                        Severity::Warning,
                        "productivity monitor failure streak halted scheduling".to_string(),
                    )
                    .await;
                    continue;
                }

                if let Some(manager) = &approval_manager {
                    request_missing_approvals(&scheduler, manager).await;
                }

                let eligible = build_eligibility_filter(approval_manager.clone());
                let outcomes = scheduler.schedule_all(eligible.as_ref()).await;

                for outcome in &outcomes {
                    if let ScheduleOutcome::Error(e) = outcome {
                        error!(error = %e, "scheduling error this tick");
                    }
                }
            }
        })
    }

    /// Wires completion/error handling: the agent manager's raw event
    /// callback feeds the dispatcher, and a dispatcher subscription on
    /// both terminal event types does the release/persist/account work.
    /// Registered once at `start()`.
    fn wire_events(&self) {
        let dispatcher_for_raw = self.dispatcher.clone();
        self.agent_manager.on_event(Box::new(move |event: AgentEvent| {
            let dispatcher = dispatcher_for_raw.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(event).await;
            });
        }));

        let ctx = Arc::new(TerminalEventContext {
            capacity: self.capacity.clone(),
            state_manager: self.state_manager.clone(),
            usage_log_repository: self.usage_log_repository.clone(),
            task_repository: self.task_repository.clone(),
            spend_monitor: self.spend_monitor.clone(),
            productivity_monitor: self.productivity_monitor.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            notification_sink: self.notification_sink.clone(),
            notified_kinds: self.notified_kinds.clone(),
        });

        let dispatcher = self.dispatcher.clone();
        let ctx_for_completion = ctx.clone();
        let dispatcher_clone = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher_clone
                .on(
                    EventType::Completion,
                    Arc::new(move |event: &AgentEvent| {
                        let ctx = ctx_for_completion.clone();
                        let event = event.clone();
                        tokio::spawn(async move { handle_terminal_event(event, ctx).await });
                        Ok(())
                    }),
                )
                .await;
        });

        let ctx_for_error = ctx;
        tokio::spawn(async move {
            dispatcher
                .on(
                    EventType::Error,
                    Arc::new(move |event: &AgentEvent| {
                        let ctx = ctx_for_error.clone();
                        let event = event.clone();
                        tokio::spawn(async move { handle_terminal_event(event, ctx).await });
                        Ok(())
                    }),
                )
                .await;
        });
    }

    async fn notify_once(&self, kind: &str, severity: Severity, text: String) {
        notify_once(&self.notified_kinds, &self.notification_sink, kind, severity, text).await;
    }

    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != LoopState::Running {
            return Err(ConductorError::SystemState {
                message: "can only pause while running".to_string(),
            });
        }
        *state = LoopState::Paused;
        self.state_manager.set_paused(true).await;
        info!("main loop paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != LoopState::Paused {
            return Err(ConductorError::SystemState {
                message: "can only resume while paused".to_string(),
            });
        }
        *state = LoopState::Running;
        self.state_manager.set_paused(false).await;
        info!("main loop resumed");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == LoopState::Stopped || *state == LoopState::Stopping {
                return Ok(());
            }
            *state = LoopState::Stopping;
        }

        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.tick_handle.lock().await.take() {
            let timeout = std::time::Duration::from_millis(self.config.graceful_shutdown_timeout_ms);
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("graceful shutdown timeout elapsed; remaining sessions may be orphaned");
            }
        }

        self.state_manager.save().await;
        *self.state.write().await = LoopState::Stopped;
        info!("main loop stopped");
        Ok(())
    }
}

/// Requests approval for any currently-queued task that needs one and
/// doesn't already have a pending or resolved request.
async fn request_missing_approvals(scheduler: &Arc<Scheduler>, manager: &Arc<TaskApprovalManager>) {
    for task in scheduler.queued_tasks().await {
        if !manager.requires_approval(&task) {
            continue;
        }
        if manager.get_request(&task.id).await.is_some() {
            continue;
        }
        if let Err(e) = manager.request_approval(task.clone()).await {
            warn!(task_id = %task.id, error = %e, "failed to request approval");
        }
    }
}

/// Builds a synchronous scheduler filter from the (async) approval
/// gate. The scheduler's filter contract is synchronous, so the check
/// is resolved via `block_in_place` rather than threading async
/// through the scheduler itself.
fn build_eligibility_filter(
    approval_manager: Option<Arc<TaskApprovalManager>>,
) -> Box<dyn Fn(&Task) -> bool + Send + Sync> {
    match approval_manager {
        None => Box::new(|_task: &Task| true),
        Some(manager) => Box::new(move |task: &Task| {
            let manager = manager.clone();
            let task = task.clone();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current()
                    .block_on(async move { manager.is_approved_or_not_required(&task).await })
            })
        }),
    }
}

struct TerminalEventContext {
    capacity: Arc<CapacityTracker>,
    state_manager: Arc<StateManager>,
    usage_log_repository: Arc<dyn UsageLogRepository>,
    task_repository: Arc<dyn TaskRepository>,
    spend_monitor: Arc<SpendMonitor>,
    productivity_monitor: Arc<ProductivityMonitor>,
    circuit_breaker: Arc<CircuitBreaker>,
    notification_sink: Arc<dyn NotificationSink>,
    notified_kinds: Arc<Mutex<HashSet<String>>>,
}

/// Handles a completion or error event for a tracked session: release
/// capacity, persist a usage log row, update spend/productivity, and
/// inform the circuit breaker. Unknown sessions (already removed, or
/// never tracked) are logged and ignored.
async fn handle_terminal_event(event: AgentEvent, ctx: Arc<TerminalEventContext>) {
    let is_completion = matches!(event.event_type, EventType::Completion);

    let Some(agent) = ctx.state_manager.get_agent(&event.session_id).await else {
        warn!(session_id = %event.session_id, "received terminal event for unknown session");
        return;
    };

    ctx.state_manager.remove_agent(&event.session_id).await;
    ctx.capacity.release_capacity(agent.model, &event.session_id).await;

    let success = event
        .data
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(is_completion);
    let input_tokens = event.data.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = event.data.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let cost_usd = event.data.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);

    let usage_entry = UsageLogEntry {
        session_id: event.session_id.clone(),
        task_id: Some(agent.task_id.clone()),
        model: agent.model,
        input_tokens,
        output_tokens,
        cache_read_tokens: None,
        cache_creation_tokens: None,
        cost_usd,
        event_type: if success {
            UsageEventType::Completion
        } else {
            UsageEventType::Error
        },
        timestamp: event.timestamp,
    };
    let usage_log_repository = ctx.usage_log_repository.clone();
    if let Err(e) = retry_transient("usage log write", || {
        let repo = usage_log_repository.clone();
        let entry = usage_entry.clone();
        async move { repo.create(entry).await }
    })
    .await
    {
        error!(error = %e, "failed to write usage log entry after retries");
    }

    let task_status = if success { TaskStatus::Complete } else { TaskStatus::Failed };
    let task_id = agent.task_id.clone();
    let task_repository = ctx.task_repository.clone();
    if let Err(e) = retry_transient("task status update", || {
        let repo = task_repository.clone();
        let task_id = task_id.clone();
        async move { repo.update_status(&task_id, task_status).await }
    })
    .await
    {
        error!(error = %e, "failed to update task status after retries");
    }

    let fired_budget_thresholds = ctx
        .spend_monitor
        .record_spend(SpendRecord {
            session_id: event.session_id.clone(),
            task_id: Some(agent.task_id.clone()),
            model: agent.model,
            cost_usd,
            input_tokens,
            output_tokens,
            timestamp: event.timestamp,
        })
        .await;

    for (period, percentage) in fired_budget_thresholds {
        let severity = if percentage >= 1.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        notify_once(
            &ctx.notified_kinds,
            &ctx.notification_sink,
            &format!("budget_{period}_{percentage}"),
            severity,
            format!("{period} budget at {:.0}%", percentage * 100.0),
        )
        .await;
    }

    let duration_ms = (event.timestamp - agent.started_at).num_milliseconds().max(0) as u64;
    let alerts = ctx
        .productivity_monitor
        .record_completion(CompletionRecord {
            session_id: event.session_id.clone(),
            task_id: agent.task_id.clone(),
            model: agent.model,
            success,
            duration_ms,
            tokens_used: input_tokens + output_tokens,
            cost_usd,
            timestamp: event.timestamp,
        })
        .await;

    for alert in alerts {
        notify_once(
            &ctx.notified_kinds,
            &ctx.notification_sink,
            &format!("productivity_{alert:?}"),
            Severity::Warning,
            format!("productivity alert: {alert:?}"),
        )
        .await;
    }

    if success {
        ctx.circuit_breaker.record_success().await;
    } else {
        ctx.circuit_breaker
            .record_failure(format!("session {} failed", event.session_id))
            .await;
    }
}

async fn notify_once(
    notified_kinds: &Arc<Mutex<HashSet<String>>>,
    sink: &Arc<dyn NotificationSink>,
    kind: &str,
    severity: Severity,
    text: String,
) {
    let mut kinds = notified_kinds.lock().await;
    if kinds.contains(kind) {
        return;
    }
    kinds.insert(kind.to_string());
    drop(kinds);

    let notification = Notification { severity, text };
    if let Err(e) = retry_transient("notification delivery", || {
        let sink = sink.clone();
        let notification = notification.clone();
        async move { sink.send_message(notification).await }
    })
    .await
    {
        warn!(error = %e, "failed to deliver notification after retries");
    }
}

/// Capped exponential backoff with jitter for transient collaborator
/// failures (repository writes, notification posts). Gives up and
/// returns the last error after `RETRY_MAX_ATTEMPTS` attempts.
async fn retry_transient<T, E, F, Fut>(what: &str, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut backoff_ms = RETRY_INITIAL_BACKOFF_MS;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= RETRY_MAX_ATTEMPTS => return Err(e),
            Err(e) => {
                warn!(attempt, %what, error = %e, "transient failure, retrying after backoff");
                let jitter = backoff_ms as f64 * RETRY_JITTER_RATIO * rand::random::<f64>();
                let delay_ms = ((backoff_ms as f64 + jitter) as u64).min(RETRY_MAX_BACKOFF_MS);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                backoff_ms = ((backoff_ms as f64 * RETRY_BACKOFF_FACTOR) as u64).min(RETRY_MAX_BACKOFF_MS);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end scenarios driving `MainLoop` through a stub agent
    //! runtime, separate from the per-module unit tests elsewhere in
    //! the crate.
    use super::*;
    use crate::agent_manager::{AgentSession, SpawnOptions};
    use crate::capacity::CapacityConfig;
    use crate::queue::TaskQueue;
    use crate::repositories::{InMemoryTaskRepository, InMemoryUsageLogRepository};
    use crate::safety::{BudgetConfig, CircuitBreakerConfig, ProductivityConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Spawns immediately succeed; a background task fires a completion
    /// event shortly after, carrying a fixed usage payload.
    struct AutoCompletingAgentManager {
        spawn_count: AtomicUsize,
        handlers: Arc<Mutex<Vec<Box<dyn Fn(AgentEvent) + Send + Sync>>>>,
    }

    impl AutoCompletingAgentManager {
        fn new() -> Self {
            Self {
                spawn_count: AtomicUsize::new(0),
                handlers: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl AgentManager for AutoCompletingAgentManager {
        async fn spawn_agent(&self, task_id: &str, options: SpawnOptions) -> Result<String> {
            let n = self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let session_id = format!("session-{n}");

            let handlers = self.handlers.clone();
            let session_id_for_task = session_id.clone();
            let task_id_owned = task_id.to_string();
            let model = options.model;

            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let event = AgentEvent {
                    event_type: EventType::Completion,
                    session_id: session_id_for_task,
                    task_id: Some(task_id_owned),
                    data: serde_json::json!({
                        "success": true,
                        "input_tokens": 500,
                        "output_tokens": 1000,
                        "cost_usd": 0.50,
                        "model": model.as_str(),
                    }),
                    timestamp: chrono::Utc::now(),
                };
                let handlers = handlers.lock().await;
                for handler in handlers.iter() {
                    handler(event.clone());
                }
            });

            Ok(session_id)
        }

        async fn inject_message(&self, _session_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn terminate_session(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get_active_sessions(&self) -> Result<Vec<AgentSession>> {
            Ok(Vec::new())
        }

        async fn get_session(&self, _session_id: &str) -> Result<Option<AgentSession>> {
            Ok(None)
        }

        fn on_event(&self, handler: Box<dyn Fn(AgentEvent) + Send + Sync>) {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                handlers.lock().await.push(handler);
            });
        }
    }

    /// Wires up a full collaborator stack around a caller-supplied agent
    /// manager and state path, returning both the loop and the scheduler
    /// so tests can enqueue work before `start()`.
    fn build_stack(
        agent_manager: Arc<AutoCompletingAgentManager>,
        state_path: std::path::PathBuf,
        usage_log_repository: Arc<InMemoryUsageLogRepository>,
    ) -> (MainLoop, Arc<Scheduler>) {
        let queue = Arc::new(TaskQueue::new(100));
        let capacity = Arc::new(CapacityTracker::new(CapacityConfig {
            opus_limit: 1,
            sonnet_limit: 2,
        }));
        let dispatcher = Arc::new(EventDispatcher::new());
        let state_manager = Arc::new(StateManager::new(state_path));
        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let spend_monitor = Arc::new(SpendMonitor::new(BudgetConfig {
            daily_budget_usd: None,
            weekly_budget_usd: None,
            hard_stop_at_limit: false,
        }));
        let productivity_monitor = Arc::new(ProductivityMonitor::new(ProductivityConfig::default(), 600_000));
        let task_repository = Arc::new(InMemoryTaskRepository::new());
        let notification_sink = Arc::new(LoggingNotificationSink);

        let scheduler = Arc::new(Scheduler::new(
            agent_manager.clone(),
            capacity.clone(),
            queue.clone(),
        ));

        let main_loop = MainLoop::new(
            MainLoopConfig {
                poll_interval_ms: 20,
                graceful_shutdown_timeout_ms: 500,
                run_preflight_checks: false,
                require_preflight_confirmation: false,
            },
            MainLoopDeps {
                scheduler: scheduler.clone(),
                agent_manager,
                task_repository,
                usage_log_repository,
                approval_manager: None,
                spend_monitor,
                productivity_monitor,
                circuit_breaker,
                state_manager,
                capacity,
                dispatcher,
                notification_sink,
            },
        );

        (main_loop, scheduler)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_lifecycle_schedules_and_records_completion() {
        let dir = tempfile::tempdir().unwrap();
        let agent_manager = Arc::new(AutoCompletingAgentManager::new());
        let usage_log_repository = Arc::new(InMemoryUsageLogRepository::new(100));
        let (main_loop, scheduler) = build_stack(
            agent_manager,
            dir.path().join("state.json"),
            usage_log_repository.clone(),
        );

        let mut task = Task::new("do the thing", "desc", 5);
        task.est_sessions_sonnet = 1;
        scheduler.add_task(task).await.unwrap();

        main_loop.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        assert_eq!(scheduler.get_stats().await.queue_size, 0);

        main_loop.stop().await.unwrap();

        let entries = usage_log_repository.get_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].model, ModelClass::SonnetPool);
        assert_eq!(entries[0].input_tokens, 500);
    }

    #[tokio::test]
    async fn restart_reconciles_capacity_with_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let state_manager = StateManager::new(state_path.clone());
        state_manager.load().await.unwrap();
        state_manager
            .add_agent(crate::models::AgentState::new("s1", "t1", ModelClass::Opus))
            .await;
        state_manager.save().await;

        let capacity = CapacityTracker::new(CapacityConfig {
            opus_limit: 1,
            sonnet_limit: 2,
        });

        let reloaded = StateManager::new(state_path);
        reloaded.load().await.unwrap();
        let active: Vec<(ModelClass, String)> = reloaded
            .get_all_agents()
            .await
            .into_iter()
            .map(|a| (a.model, a.session_id))
            .collect();
        capacity.sync_with(&active).await;

        assert_eq!(capacity.current_count(ModelClass::Opus).await, 1);
        assert!(!capacity.has_capacity(ModelClass::Opus).await);

        // Re-syncing with the same active set doesn't double-reserve.
        capacity.sync_with(&active).await;
        assert_eq!(capacity.current_count(ModelClass::Opus).await, 1);
    }
}

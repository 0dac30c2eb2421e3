//! Matches queued work to free capacity and invokes the agent manager.
//!
//! 🧠 SCHEDULING DECISION: one `schedule_next` attempt per call
//! Why: keeps each decision small and testable in isolation; the main
//! loop's tick drives `schedule_all` to drain everything currently
//! eligible without the scheduler itself owning a loop or a timer.

use crate::agent_manager::{AgentManager, SpawnOptions};
use crate::capacity::CapacityTracker;
use crate::models::{Complexity, ModelClass, Task};
use crate::queue::TaskQueue;
use crate::Result;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Scheduled {
        task_id: String,
        session_id: String,
        model: ModelClass,
    },
    Idle,
    NoCapacity,
    Error(String),
}

pub struct Scheduler {
    agent_manager: Arc<dyn AgentManager>,
    capacity: Arc<CapacityTracker>,
    queue: Arc<TaskQueue>,
}

impl Scheduler {
    pub fn new(
        agent_manager: Arc<dyn AgentManager>,
        capacity: Arc<CapacityTracker>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            agent_manager,
            capacity,
            queue,
        }
    }

    pub async fn add_task(&self, task: Task) -> Result<()> {
        self.queue.enqueue(task).await
    }

    pub async fn remove_task(&self, task_id: &str) -> Option<Task> {
        self.queue.remove(task_id).await
    }

    pub async fn release_capacity(&self, model: ModelClass, session_id: &str) {
        self.capacity.release_capacity(model, session_id).await;
    }

    pub async fn can_schedule(&self) -> bool {
        !self.queue.is_empty().await
            && (self.capacity.has_capacity(ModelClass::Opus).await
                || self.capacity.has_capacity(ModelClass::SonnetPool).await)
    }

    pub async fn queued_tasks(&self) -> Vec<Task> {
        self.queue.get_all_sorted().await
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_size: self.queue.size().await,
            capacity: self.capacity.stats().await,
        }
    }

    /// `determineModel`: explicit per-task estimates win; otherwise
    /// fall back to the complexity heuristic (high/complex → Opus).
    pub fn determine_model(&self, task: &Task) -> ModelClass {
        if task.est_sessions_opus > 0 {
            return ModelClass::Opus;
        }
        if task.est_sessions_sonnet > 0 {
            return ModelClass::SonnetPool;
        }
        match task.complexity {
            Some(Complexity::High) | Some(Complexity::Complex) => ModelClass::Opus,
            _ => ModelClass::SonnetPool,
        }
    }

    /// One scheduling attempt. Does not remove the candidate from the
    /// queue unless a session is actually spawned and reserved.
    pub async fn schedule_next(
        &self,
        filter: &(dyn Fn(&Task) -> bool + Send + Sync),
    ) -> ScheduleOutcome {
        if self.queue.is_empty().await {
            return ScheduleOutcome::Idle;
        }

        let opus_has_capacity = self.capacity.has_capacity(ModelClass::Opus).await;
        let sonnet_has_capacity = self.capacity.has_capacity(ModelClass::SonnetPool).await;

        if !opus_has_capacity && !sonnet_has_capacity {
            return ScheduleOutcome::NoCapacity;
        }

        // Candidate selection always initializes target_model before any
        // branch assigns it, even if no branch below fires.
        let mut target_model = ModelClass::SonnetPool;
        let mut candidate: Option<Task> = None;

        if opus_has_capacity {
            if let Some(task) = self.queue.get_next_for_model(ModelClass::Opus).await {
                target_model = self.determine_model(&task);
                if target_model != ModelClass::Opus && sonnet_has_capacity {
                    if let Some(sonnet_task) =
                        self.queue.get_next_for_model(ModelClass::SonnetPool).await
                    {
                        candidate = Some(sonnet_task);
                        target_model = ModelClass::SonnetPool;
                    } else {
                        candidate = Some(task);
                    }
                } else {
                    candidate = Some(task);
                }
            }
        }

        if candidate.is_none() && sonnet_has_capacity {
            if let Some(task) = self.queue.get_next_for_model(ModelClass::SonnetPool).await {
                target_model = self.determine_model(&task);
                candidate = Some(task);
            }
        }

        let Some(task) = candidate else {
            return ScheduleOutcome::NoCapacity;
        };

        // Task prefers Opus but only Sonnet capacity remains: downgrade.
        if target_model == ModelClass::Opus && !opus_has_capacity {
            target_model = ModelClass::SonnetPool;
        }

        if !filter(&task) {
            return ScheduleOutcome::Idle;
        }

        // Re-verify capacity right before spawning; fall back or bail if
        // it was exhausted between selection and this point.
        if !self.capacity.has_capacity(target_model).await {
            let fallback = match target_model {
                ModelClass::Opus => ModelClass::SonnetPool,
                ModelClass::SonnetPool => ModelClass::Opus,
            };
            if self.capacity.has_capacity(fallback).await {
                target_model = fallback;
            } else {
                return ScheduleOutcome::NoCapacity;
            }
        }

        let spawn_result = self
            .agent_manager
            .spawn_agent(
                &task.id,
                SpawnOptions {
                    model: target_model,
                    project_path: ".".to_string(),
                    system_prompt: Some(format!("{}\n\n{}", task.title, task.description)),
                    max_turns: None,
                },
            )
            .await;

        let session_id = match spawn_result {
            Ok(id) => id,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to spawn agent");
                return ScheduleOutcome::Error(e.to_string());
            }
        };

        if !self.capacity.reserve_capacity(target_model, &session_id).await {
            error!(
                task_id = %task.id, %session_id,
                "capacity exhausted immediately after spawn; leaving task queued"
            );
            return ScheduleOutcome::Error(
                "capacity reservation failed after spawn".to_string(),
            );
        }

        self.queue.remove(&task.id).await;

        info!(task_id = %task.id, %session_id, model = %target_model, "task scheduled");
        ScheduleOutcome::Scheduled {
            task_id: task.id,
            session_id,
            model: target_model,
        }
    }

    /// Repeats `schedule_next` until it stops making progress.
    pub async fn schedule_all(
        &self,
        filter: &(dyn Fn(&Task) -> bool + Send + Sync),
    ) -> Vec<ScheduleOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self.schedule_next(filter).await;
            let should_continue = matches!(outcome, ScheduleOutcome::Scheduled { .. });
            outcomes.push(outcome);
            if !should_continue {
                break;
            }
        }
        outcomes
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub queue_size: usize,
    pub capacity: crate::capacity::CapacityStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_manager::AgentSession;
    use crate::capacity::CapacityConfig;
    use crate::events::AgentEvent;
    use crate::ConductorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAgentManager {
        spawn_count: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AgentManager for StubAgentManager {
        async fn spawn_agent(&self, _task_id: &str, _options: SpawnOptions) -> Result<String> {
            if self.fail {
                return Err(ConductorError::Agent {
                    message: "stub failure".to_string(),
                });
            }
            let n = self.spawn_count.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session-{n}"))
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
        fn on_event(&self, _handler: Box<dyn Fn(AgentEvent) + Send + Sync>) {}
    }

    fn scheduler(opus: u32, sonnet: u32, fail: bool) -> Scheduler {
        Scheduler::new(
            Arc::new(StubAgentManager {
                spawn_count: AtomicUsize::new(0),
                fail,
            }),
            Arc::new(CapacityTracker::new(CapacityConfig {
                opus_limit: opus,
                sonnet_limit: sonnet,
            })),
            Arc::new(TaskQueue::new(100)),
        )
    }

    #[tokio::test]
    async fn idle_on_empty_queue() {
        let s = scheduler(1, 2, false);
        let outcome = s.schedule_next(&|_| true).await;
        assert!(matches!(outcome, ScheduleOutcome::Idle));
    }

    #[tokio::test]
    async fn schedules_within_capacity() {
        let s = scheduler(0, 2, false);
        for i in 0..3 {
            let mut task = Task::new(format!("t{i}"), "d", 1);
            task.est_sessions_sonnet = 1;
            s.add_task(task).await.unwrap();
        }

        let outcomes = s.schedule_all(&|_| true).await;
        let scheduled = outcomes
            .iter()
            .filter(|o| matches!(o, ScheduleOutcome::Scheduled { .. }))
            .count();
        assert_eq!(scheduled, 2);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ScheduleOutcome::NoCapacity)));
    }

    #[tokio::test]
    async fn downgrades_opus_task_when_only_sonnet_available() {
        let s = scheduler(0, 1, false);
        let mut task = Task::new("t", "d", 1);
        task.est_sessions_opus = 1;
        s.add_task(task).await.unwrap();

        let outcome = s.schedule_next(&|_| true).await;
        match outcome {
            ScheduleOutcome::Scheduled { model, .. } => assert_eq!(model, ModelClass::SonnetPool),
            other => panic!("expected scheduled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_false_keeps_task_queued() {
        let s = scheduler(0, 1, false);
        let task = Task::new("t", "d", 1);
        s.add_task(task.clone()).await.unwrap();

        let outcome = s.schedule_next(&|_| false).await;
        assert!(matches!(outcome, ScheduleOutcome::Idle));
        assert!(s.queue.has(&task.id).await);
    }

    #[tokio::test]
    async fn spawn_failure_does_not_reserve_or_dequeue() {
        let s = scheduler(0, 1, true);
        let task = Task::new("t", "d", 1);
        s.add_task(task.clone()).await.unwrap();

        let outcome = s.schedule_next(&|_| true).await;
        assert!(matches!(outcome, ScheduleOutcome::Error(_)));
        assert!(s.queue.has(&task.id).await);
        assert_eq!(s.capacity.current_count(ModelClass::SonnetPool).await, 0);
    }
}

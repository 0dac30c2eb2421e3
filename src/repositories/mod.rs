//! 🏗️ ARCHITECTURE DECISION: Repository pattern for task and usage-log
//! storage
//! Why: Abstract storage details from scheduling logic so a database-
//! backed implementation is a drop-in replacement for the in-memory
//! reference implementations used in tests and small deployments.
//! Alternative: direct storage access from the scheduler (rejected:
//! couples scheduling to a specific backend).

use crate::models::{Task, TaskStatus, UsageLogEntry};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Task>>;
    async fn get_queued(&self) -> Result<Vec<Task>>;
    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<()>;
    async fn assign_agent(&self, id: &str, session_id: &str) -> Result<()>;
    async fn save(&self, task: Task) -> Result<()>;
}

#[async_trait]
pub trait UsageLogRepository: Send + Sync {
    async fn create(&self, entry: UsageLogEntry) -> Result<()>;
    async fn get_all(&self) -> Result<Vec<UsageLogEntry>>;
}

/// Bounded-retention in-memory `TaskRepository`, suitable for tests and
/// small deployments. Mirrors the ambient FIFO-eviction idiom used for
/// other in-memory stores in this codebase.
pub struct InMemoryTaskRepository {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
    assignments: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            assignments: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get_by_id(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn get_queued(&self) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(id) {
            task.status = status;
            match status {
                TaskStatus::InProgress if task.started_at.is_none() => {
                    task.started_at = Some(chrono::Utc::now());
                }
                TaskStatus::Complete | TaskStatus::Failed => {
                    task.completed_at = Some(chrono::Utc::now());
                }
                _ => {}
            }
            debug!(task_id = id, ?status, "task status updated");
        }
        Ok(())
    }

    async fn assign_agent(&self, id: &str, session_id: &str) -> Result<()> {
        self.assignments
            .lock()
            .await
            .insert(id.to_string(), session_id.to_string());
        Ok(())
    }

    async fn save(&self, task: Task) -> Result<()> {
        info!(task_id = %task.id, "task saved");
        self.tasks.lock().await.insert(task.id.clone(), task);
        Ok(())
    }
}

/// Bounded-retention in-memory `UsageLogRepository`. Oldest entries are
/// evicted once `max_entries` is exceeded.
pub struct InMemoryUsageLogRepository {
    entries: Arc<Mutex<Vec<UsageLogEntry>>>,
    max_entries: usize,
}

impl InMemoryUsageLogRepository {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            max_entries,
        }
    }
}

#[async_trait]
impl UsageLogRepository for InMemoryUsageLogRepository {
    async fn create(&self, entry: UsageLogEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            entries.remove(0);
        }
        entries.push(entry);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<UsageLogEntry>> {
        Ok(self.entries.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelClass;

    #[tokio::test]
    async fn save_and_get_by_id_round_trips() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new("t", "d", 1);
        repo.save(task.clone()).await.unwrap();

        let found = repo.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }

    #[tokio::test]
    async fn update_status_stamps_started_and_completed() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new("t", "d", 1);
        repo.save(task.clone()).await.unwrap();

        repo.update_status(&task.id, TaskStatus::InProgress).await.unwrap();
        let started = repo.get_by_id(&task.id).await.unwrap().unwrap();
        assert!(started.started_at.is_some());

        repo.update_status(&task.id, TaskStatus::Complete).await.unwrap();
        let completed = repo.get_by_id(&task.id).await.unwrap().unwrap();
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn usage_log_evicts_oldest_past_limit() {
        let repo = InMemoryUsageLogRepository::new(2);
        for i in 0..3 {
            repo.create(UsageLogEntry {
                session_id: format!("s{i}"),
                task_id: None,
                model: ModelClass::Opus,
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: None,
                cache_creation_tokens: None,
                cost_usd: 0.0,
                event_type: crate::models::UsageEventType::Completion,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        }
        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "s1");
    }
}

//! Per-task human-approval gate with timeout.
//!
//! Grounded on the self-update `ApprovalManager`: a pending record per
//! task, an external request hook, and a timeout that resolves to
//! "not approved" rather than blocking the scheduler forever.

use crate::models::{ApprovalRequest, ApprovalStatus, Task};
use crate::{ConductorError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ApprovalConfig {
    pub enable_task_approval: bool,
    pub timeout_ms: u64,
    pub auto_approve_priority_threshold: i64,
    pub require_approval_for_all: bool,
    /// Whether a priority-confirmed task is allowed to auto-approve at
    /// all. A task can have `priority_confirmed` set without this being
    /// on, in which case it still needs a human round-trip.
    pub auto_approve_confirmed: bool,
}

/// External hook used to ask a human for approval (e.g. post a message
/// to a chat channel). A no-op implementation is fine for deployments
/// that always auto-approve.
#[async_trait]
pub trait ApprovalRequestSink: Send + Sync {
    async fn send_request(&self, task: &Task, prompt: &str) -> Result<()>;
}

pub struct NoopApprovalRequestSink;

#[async_trait]
impl ApprovalRequestSink for NoopApprovalRequestSink {
    async fn send_request(&self, _task: &Task, _prompt: &str) -> Result<()> {
        Ok(())
    }
}

pub struct TaskApprovalManager {
    config: ApprovalConfig,
    sink: Arc<dyn ApprovalRequestSink>,
    pending: Arc<Mutex<HashMap<String, ApprovalRequest>>>,
}

impl TaskApprovalManager {
    pub fn new(config: ApprovalConfig, sink: Arc<dyn ApprovalRequestSink>) -> Self {
        Self {
            config,
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether `task` needs an approval round-trip at all.
    pub fn requires_approval(&self, task: &Task) -> bool {
        if !self.config.enable_task_approval {
            return false;
        }

        let auto_approved = (task.priority_confirmed && self.config.auto_approve_confirmed)
            || task.priority >= self.config.auto_approve_priority_threshold;

        if auto_approved {
            return false;
        }

        self.config.require_approval_for_all || !task.priority_confirmed
    }

    /// Create a pending approval, notify the sink, and schedule a
    /// timeout that resolves the request as `Timeout` if nobody
    /// responds in time. Returns immediately; call `is_approved` later
    /// to check the outcome.
    pub async fn request_approval(self: &Arc<Self>, task: Task) -> Result<()> {
        let request = ApprovalRequest {
            task_id: task.id.clone(),
            status: ApprovalStatus::Pending,
            requested_at: chrono::Utc::now(),
            timeout_ms: self.config.timeout_ms,
            reason: None,
            responded_by: None,
        };

        {
            let mut pending = self.pending.lock().await;
            pending.insert(task.id.clone(), request);
        }

        let prompt = format!(
            "Task '{}' (priority {}) needs approval before it can be scheduled.",
            task.title, task.priority
        );
        if let Err(e) = self.sink.send_request(&task, &prompt).await {
            warn!(task_id = %task.id, error = %e, "failed to send approval request");
        }

        let manager = self.clone();
        let task_id = task.id.clone();
        let timeout_ms = self.config.timeout_ms;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            manager.timeout_if_still_pending(&task_id).await;
        });

        Ok(())
    }

    async fn timeout_if_still_pending(&self, task_id: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(request) = pending.get_mut(task_id) {
            if request.status == ApprovalStatus::Pending {
                request.status = ApprovalStatus::Timeout;
                info!(task_id, "approval request timed out, treating as not approved");
            }
        }
    }

    pub async fn handle_response(
        &self,
        task_id: &str,
        approved: bool,
        by: impl Into<String>,
        reason: Option<String>,
    ) -> Result<()> {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(task_id) {
            Some(request) if request.status == ApprovalStatus::Pending => {
                request.status = if approved {
                    ApprovalStatus::Approved
                } else {
                    ApprovalStatus::Rejected
                };
                request.responded_by = Some(by.into());
                request.reason = reason;
                Ok(())
            }
            Some(_) => Err(ConductorError::Validation(format!(
                "approval request for {task_id} already resolved"
            ))),
            None => Err(ConductorError::NotFound(format!(
                "no pending approval request for {task_id}"
            ))),
        }
    }

    /// The scheduler's gate predicate: true if the task doesn't need
    /// approval, or needs it and has received an `Approved` response.
    pub async fn is_approved_or_not_required(&self, task: &Task) -> bool {
        if !self.requires_approval(task) {
            return true;
        }
        let pending = self.pending.lock().await;
        matches!(
            pending.get(&task.id).map(|r| r.status),
            Some(ApprovalStatus::Approved)
        )
    }

    pub async fn has_pending_request(&self, task_id: &str) -> bool {
        let pending = self.pending.lock().await;
        matches!(
            pending.get(task_id).map(|r| r.status),
            Some(ApprovalStatus::Pending)
        )
    }

    pub async fn get_request(&self, task_id: &str) -> Option<ApprovalRequest> {
        self.pending.lock().await.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout_ms: u64) -> Arc<TaskApprovalManager> {
        Arc::new(TaskApprovalManager::new(
            ApprovalConfig {
                enable_task_approval: true,
                timeout_ms,
                auto_approve_priority_threshold: 8,
                require_approval_for_all: false,
                auto_approve_confirmed: true,
            },
            Arc::new(NoopApprovalRequestSink),
        ))
    }

    #[tokio::test]
    async fn confirmed_priority_auto_approves_only_when_configured() {
        let confirmed = Arc::new(TaskApprovalManager::new(
            ApprovalConfig {
                enable_task_approval: true,
                timeout_ms: 1000,
                auto_approve_priority_threshold: 100,
                require_approval_for_all: false,
                auto_approve_confirmed: false,
            },
            Arc::new(NoopApprovalRequestSink),
        ));
        let mut task = Task::new("t", "d", 1);
        task.priority_confirmed = true;
        assert!(confirmed.requires_approval(&task));
    }

    #[tokio::test]
    async fn high_priority_auto_approves() {
        let manager = manager(1000);
        let mut task = Task::new("t", "d", 9);
        task.priority_confirmed = false;
        assert!(!manager.requires_approval(&task));
    }

    #[tokio::test]
    async fn low_priority_unconfirmed_requires_approval() {
        let manager = manager(1000);
        let task = Task::new("t", "d", 1);
        assert!(manager.requires_approval(&task));
    }

    #[tokio::test]
    async fn timeout_resolves_as_not_approved() {
        let manager = manager(50);
        let task = Task::new("t", "d", 1);
        manager.request_approval(task.clone()).await.unwrap();

        assert!(!manager.is_approved_or_not_required(&task).await);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!manager.is_approved_or_not_required(&task).await);
        assert_eq!(
            manager.get_request(&task.id).await.unwrap().status,
            ApprovalStatus::Timeout
        );
    }

    #[tokio::test]
    async fn approval_response_is_honored() {
        let manager = manager(1000);
        let task = Task::new("t", "d", 1);
        manager.request_approval(task.clone()).await.unwrap();
        manager
            .handle_response(&task.id, true, "alice", None)
            .await
            .unwrap();
        assert!(manager.is_approved_or_not_required(&task).await);
    }
}

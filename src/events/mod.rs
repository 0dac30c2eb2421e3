//! Typed pub/sub for agent-session events.
//!
//! 🏗️ ARCHITECTURE DECISION: In-process typed dispatcher instead of a
//! message broker
//! Why: Single Responsibility - event routing is in-memory and
//! short-lived; a broker would add an operational dependency for no
//! benefit at this scale.
//! Alternative: tokio broadcast channel per event type (rejected: loses
//! the bounded history and per-handler error isolation this module
//! provides).

use crate::constants::DEFAULT_EVENT_HISTORY_SIZE;
use crate::{ConductorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Question,
    ToolCall,
    Completion,
    Error,
    Blocker,
    SubagentSpawn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_type: EventType,
    pub session_id: String,
    pub task_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(event_type: EventType, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            task_id: None,
            data,
            timestamp: Utc::now(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&AgentEvent) -> Result<()> + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct DispatcherInner {
    by_type: HashMap<EventType, Vec<Subscription>>,
    global: Vec<Subscription>,
    history: VecDeque<AgentEvent>,
}

/// Unsubscribe token returned by `on`/`once`/`on_global`. Dropping it
/// does nothing; call `unsubscribe()` explicitly to remove the handler.
pub struct Subscription_ {
    id: u64,
    event_type: Option<EventType>,
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
    next_id: Arc<AtomicU64>,
    max_history: usize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_history_size(DEFAULT_EVENT_HISTORY_SIZE)
    }

    pub fn with_history_size(max_history: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherInner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_history,
        }
    }

    pub async fn on(&self, event_type: EventType, handler: Handler) -> Subscription_ {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner
            .by_type
            .entry(event_type)
            .or_default()
            .push(Subscription {
                id,
                handler,
                once: false,
            });
        Subscription_ {
            id,
            event_type: Some(event_type),
        }
    }

    pub async fn once(&self, event_type: EventType, handler: Handler) -> Subscription_ {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner
            .by_type
            .entry(event_type)
            .or_default()
            .push(Subscription {
                id,
                handler,
                once: true,
            });
        Subscription_ {
            id,
            event_type: Some(event_type),
        }
    }

    pub async fn on_global(&self, handler: Handler) -> Subscription_ {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.global.push(Subscription {
            id,
            handler,
            once: false,
        });
        Subscription_ {
            id,
            event_type: None,
        }
    }

    pub async fn off(&self, subscription: &Subscription_) {
        let mut inner = self.inner.lock().await;
        match subscription.event_type {
            Some(t) => {
                if let Some(list) = inner.by_type.get_mut(&t) {
                    list.retain(|s| s.id != subscription.id);
                }
            }
            None => inner.global.retain(|s| s.id != subscription.id),
        }
    }

    pub async fn remove_all(&self, event_type: EventType) {
        let mut inner = self.inner.lock().await;
        inner.by_type.remove(&event_type);
    }

    /// Dispatch one event: type-specific handlers (in registration
    /// order) first, then global handlers. A handler returning an
    /// error is logged and does not stop the remaining handlers, nor
    /// propagate to the caller.
    pub async fn dispatch(&self, event: AgentEvent) {
        let mut inner = self.inner.lock().await;

        inner.history.push_back(event.clone());
        while inner.history.len() > self.max_history {
            inner.history.pop_front();
        }

        if let Some(list) = inner.by_type.get_mut(&event.event_type) {
            let mut i = 0;
            while i < list.len() {
                let handler = list[i].handler.clone();
                if let Err(e) = handler(&event) {
                    warn!(error = %e, event_type = ?event.event_type, "event handler returned an error");
                }
                if list[i].once {
                    list.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        let mut i = 0;
        while i < inner.global.len() {
            let handler = inner.global[i].handler.clone();
            if let Err(e) = handler(&event) {
                warn!(error = %e, "global event handler returned an error");
            }
            if inner.global[i].once {
                inner.global.remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub async fn dispatch_batch(&self, events: Vec<AgentEvent>) {
        for event in events {
            self.dispatch(event).await;
        }
    }

    /// Wait for the next event of `event_type` matching `filter`, or
    /// time out. Installs a temporary one-shot handler that is always
    /// removed, whether it fires or the wait times out.
    pub async fn wait_for(
        &self,
        event_type: EventType,
        filter: impl Fn(&AgentEvent) -> bool + Send + Sync + 'static,
        timeout_ms: u64,
    ) -> Result<AgentEvent> {
        let (tx, rx) = oneshot::channel::<AgentEvent>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let tx_clone = tx.clone();
        let sub = self
            .on(event_type, Arc::new(move |event: &AgentEvent| {
                if filter(event) {
                    if let Ok(mut guard) = tx_clone.try_lock() {
                        if let Some(sender) = guard.take() {
                            let _ = sender.send(event.clone());
                        }
                    }
                }
                Ok(())
            }))
            .await;

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            rx,
        )
        .await;

        self.off(&sub).await;

        match result {
            Ok(Ok(event)) => Ok(event),
            _ => {
                debug!(?event_type, timeout_ms, "wait_for timed out");
                Err(ConductorError::Timeout {
                    message: format!("waitFor({event_type:?}) timed out after {timeout_ms}ms"),
                })
            }
        }
    }

    pub async fn get_history(
        &self,
        filter: impl Fn(&AgentEvent) -> bool,
    ) -> Vec<AgentEvent> {
        let inner = self.inner.lock().await;
        inner.history.iter().filter(|e| filter(e)).cloned().collect()
    }

    pub async fn clear_history(&self) {
        let mut inner = self.inner.lock().await;
        inner.history.clear();
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn dispatch_invokes_type_then_global_handlers() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_a = order.clone();
        dispatcher
            .on(
                EventType::Completion,
                Arc::new(move |_| {
                    order_a.lock().unwrap().push("type");
                    Ok(())
                }),
            )
            .await;

        let order_b = order.clone();
        dispatcher
            .on_global(Arc::new(move |_| {
                order_b.lock().unwrap().push("global");
                Ok(())
            }))
            .await;

        dispatcher
            .dispatch(AgentEvent::new(
                EventType::Completion,
                "s1",
                serde_json::json!({}),
            ))
            .await;

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec!["type", "global"]);
    }

    #[tokio::test]
    async fn once_handler_fires_a_single_time() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();

        dispatcher
            .once(
                EventType::Error,
                Arc::new(move |_| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        for _ in 0..3 {
            dispatcher
                .dispatch(AgentEvent::new(EventType::Error, "s1", serde_json::json!({})))
                .await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn erroring_handler_does_not_block_others() {
        let dispatcher = EventDispatcher::new();
        let second_ran = Arc::new(AtomicBool::new(false));
        let second_ran_clone = second_ran.clone();

        dispatcher
            .on(
                EventType::Completion,
                Arc::new(|_| {
                    Err(ConductorError::SystemError("boom".to_string()))
                }),
            )
            .await;
        dispatcher
            .on(
                EventType::Completion,
                Arc::new(move |_| {
                    second_ran_clone.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        dispatcher
            .dispatch(AgentEvent::new(
                EventType::Completion,
                "s1",
                serde_json::json!({}),
            ))
            .await;

        assert!(second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_for_times_out_without_matching_event() {
        let dispatcher = EventDispatcher::new();
        let result = dispatcher
            .wait_for(EventType::Completion, |_| true, 20)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_event() {
        let dispatcher = EventDispatcher::new();
        let dispatcher_clone_for_task = dispatcher.clone();

        let handle = tokio::spawn(async move {
            dispatcher_clone_for_task
                .wait_for(EventType::Completion, |e| e.session_id == "target", 1000)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        dispatcher
            .dispatch(AgentEvent::new(
                EventType::Completion,
                "target",
                serde_json::json!({}),
            ))
            .await;

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let dispatcher = EventDispatcher::with_history_size(2);
        for i in 0..5 {
            dispatcher
                .dispatch(AgentEvent::new(
                    EventType::Completion,
                    format!("s{i}"),
                    serde_json::json!({}),
                ))
                .await;
        }
        let history = dispatcher.get_history(|_| true).await;
        assert_eq!(history.len(), 2);
    }
}

//! Per-model-class session capacity gating.
//!
//! 🏗️ ARCHITECTURE DECISION: Capacity tracked separately from the queue
//! Why: Single Responsibility - the queue decides *what* to run next,
//! capacity decides *whether* anything can run right now.

use crate::models::ModelClass;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct CapacityConfig {
    pub opus_limit: u32,
    pub sonnet_limit: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            opus_limit: crate::constants::DEFAULT_OPUS_SESSION_LIMIT,
            sonnet_limit: crate::constants::DEFAULT_SONNET_SESSION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ModelCapacityStats {
    pub current: u32,
    pub limit: u32,
    pub available: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CapacityStats {
    pub opus: ModelCapacityStats,
    pub sonnet: ModelCapacityStats,
}

#[derive(Default)]
struct Reservations {
    opus: HashSet<String>,
    sonnet: HashSet<String>,
}

impl Reservations {
    fn set_for(&mut self, model: ModelClass) -> &mut HashSet<String> {
        match model {
            ModelClass::Opus => &mut self.opus,
            ModelClass::SonnetPool => &mut self.sonnet,
        }
    }

    fn set_for_ref(&self, model: ModelClass) -> &HashSet<String> {
        match model {
            ModelClass::Opus => &self.opus,
            ModelClass::SonnetPool => &self.sonnet,
        }
    }
}

pub struct CapacityTracker {
    config: CapacityConfig,
    reservations: Arc<Mutex<Reservations>>,
}

impl CapacityTracker {
    pub fn new(config: CapacityConfig) -> Self {
        if config.opus_limit > 2 || config.sonnet_limit > 5 {
            warn!(
                opus_limit = config.opus_limit,
                sonnet_limit = config.sonnet_limit,
                "capacity limits are higher than the recommended single-operator defaults"
            );
        }

        Self {
            config,
            reservations: Arc::new(Mutex::new(Reservations::default())),
        }
    }

    /// Non-empty iff the construction-time limits exceed the
    /// recommended defaults; surfaced so the host can forward it to
    /// the notification sink once at startup.
    pub fn capacity_warning(&self) -> Option<String> {
        if self.config.opus_limit > 2 || self.config.sonnet_limit > 5 {
            Some(format!(
                "capacity limits (opus={}, sonnet={}) exceed recommended single-operator defaults",
                self.config.opus_limit, self.config.sonnet_limit
            ))
        } else {
            None
        }
    }

    fn limit(&self, model: ModelClass) -> u32 {
        match model {
            ModelClass::Opus => self.config.opus_limit,
            ModelClass::SonnetPool => self.config.sonnet_limit,
        }
    }

    pub async fn has_capacity(&self, model: ModelClass) -> bool {
        let reservations = self.reservations.lock().await;
        (reservations.set_for_ref(model).len() as u32) < self.limit(model)
    }

    /// Reserve one slot for `session_id` under `model`. Idempotent: if
    /// `session_id` is already tracked under this model, returns true
    /// without changing the count.
    pub async fn reserve_capacity(&self, model: ModelClass, session_id: &str) -> bool {
        let mut reservations = self.reservations.lock().await;
        let limit = self.limit(model);
        let set = reservations.set_for(model);

        if set.contains(session_id) {
            return true;
        }

        if set.len() as u32 >= limit {
            debug!(%session_id, model = %model, "capacity reservation rejected: at limit");
            return false;
        }

        set.insert(session_id.to_string());
        debug!(%session_id, model = %model, current = set.len(), limit, "capacity reserved");
        true
    }

    /// Idempotent: releasing a session_id that isn't reserved is a no-op.
    pub async fn release_capacity(&self, model: ModelClass, session_id: &str) {
        let mut reservations = self.reservations.lock().await;
        let set = reservations.set_for(model);
        if set.remove(session_id) {
            debug!(%session_id, model = %model, current = set.len(), "capacity released");
        }
    }

    pub async fn current_count(&self, model: ModelClass) -> u32 {
        self.reservations.lock().await.set_for_ref(model).len() as u32
    }

    pub async fn available_count(&self, model: ModelClass) -> u32 {
        self.limit(model).saturating_sub(self.current_count(model).await)
    }

    pub async fn stats(&self) -> CapacityStats {
        let reservations = self.reservations.lock().await;
        let build = |model: ModelClass| {
            let current = reservations.set_for_ref(model).len() as u32;
            let limit = self.limit(model);
            ModelCapacityStats {
                current,
                limit,
                available: limit.saturating_sub(current),
                utilization: if limit == 0 {
                    0.0
                } else {
                    current as f64 / limit as f64
                },
            }
        };
        CapacityStats {
            opus: build(ModelClass::Opus),
            sonnet: build(ModelClass::SonnetPool),
        }
    }

    /// Rebuild reservations from an authoritative list of active
    /// sessions, e.g. after a restart. Clears first so stale entries
    /// from a crashed run don't linger.
    pub async fn sync_with(&self, active: &[(ModelClass, String)]) {
        let mut reservations = self.reservations.lock().await;
        reservations.opus.clear();
        reservations.sonnet.clear();
        let mut per_model: HashMap<ModelClass, u32> = HashMap::new();
        for (model, session_id) in active {
            let limit = self.limit(*model);
            let count = per_model.entry(*model).or_insert(0);
            if *count < limit {
                reservations.set_for(*model).insert(session_id.clone());
                *count += 1;
            } else {
                warn!(%session_id, model = %model, "dropping active session during capacity sync: over limit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(opus: u32, sonnet: u32) -> CapacityTracker {
        CapacityTracker::new(CapacityConfig {
            opus_limit: opus,
            sonnet_limit: sonnet,
        })
    }

    #[tokio::test]
    async fn reserve_respects_limit() {
        let t = tracker(1, 1);
        assert!(t.reserve_capacity(ModelClass::Opus, "a").await);
        assert!(!t.reserve_capacity(ModelClass::Opus, "b").await);
        assert_eq!(t.current_count(ModelClass::Opus).await, 1);
    }

    #[tokio::test]
    async fn reserve_is_idempotent() {
        let t = tracker(1, 1);
        assert!(t.reserve_capacity(ModelClass::Opus, "a").await);
        assert!(t.reserve_capacity(ModelClass::Opus, "a").await);
        assert_eq!(t.current_count(ModelClass::Opus).await, 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let t = tracker(1, 1);
        t.release_capacity(ModelClass::Opus, "nonexistent").await;
        assert_eq!(t.current_count(ModelClass::Opus).await, 0);
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let t = tracker(1, 1);
        t.reserve_capacity(ModelClass::Opus, "a").await;
        t.release_capacity(ModelClass::Opus, "a").await;
        assert!(t.has_capacity(ModelClass::Opus).await);
    }

    #[tokio::test]
    async fn sync_with_drops_over_limit_sessions() {
        let t = tracker(1, 5);
        t.sync_with(&[
            (ModelClass::Opus, "a".to_string()),
            (ModelClass::Opus, "b".to_string()),
        ])
        .await;
        assert_eq!(t.current_count(ModelClass::Opus).await, 1);
    }
}

//! Circuit breaker gating agent spawns when the agent runtime is
//! failing repeatedly.
//!
//! Grounded directly on the Claude Code API circuit breaker: closed →
//! open on threshold, open → half_open after a timeout, half_open →
//! closed on probe success or back to open on probe failure.

use crate::models::CircuitState;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::constants::DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_millis(
                crate::constants::DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_MS,
            ),
            success_threshold: crate::constants::DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
            failure_window: Duration::from_secs(
                crate::constants::DEFAULT_CIRCUIT_BREAKER_FAILURE_WINDOW_SECS,
            ),
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU32>,
    success_count: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
    last_state_change: Arc<RwLock<Instant>>,
    total_requests: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    last_trip_reason: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_state_change_seconds: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            success_count: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
            last_state_change: Arc::new(RwLock::new(Instant::now())),
            total_requests: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            last_trip_reason: Arc::new(RwLock::new(None)),
        }
    }

    /// Whether a new spawn should be allowed right now. Transitions
    /// open → half_open as a side effect once the reset timeout has
    /// elapsed.
    pub async fn should_allow(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let current_state = *self.state.read().await;
        match current_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_change = *self.last_state_change.read().await;
                if last_change.elapsed() >= self.config.reset_timeout {
                    self.transition_to_half_open().await;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub async fn is_open(&self) -> bool {
        *self.state.read().await == CircuitState::Open
    }

    pub async fn record_success(&self) {
        let current_state = *self.state.read().await;
        match current_state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(count, threshold = self.config.success_threshold, "half-open success");
                if count >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                warn!("success recorded while circuit is open");
            }
        }
    }

    pub async fn record_failure(&self, reason: impl Into<String>) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let current_state = *self.state.read().await;

        match current_state {
            CircuitState::Closed => {
                let mut last_failure = self.last_failure_time.write().await;
                let now = Instant::now();

                if let Some(last_time) = *last_failure {
                    if now.duration_since(last_time) > self.config.failure_window {
                        self.failure_count.store(1, Ordering::Relaxed);
                    } else {
                        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if count >= self.config.failure_threshold {
                            *self.last_trip_reason.write().await = Some(reason.into());
                            drop(last_failure);
                            self.transition_to_open().await;
                            return;
                        }
                    }
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                }
                *last_failure = Some(now);
            }
            CircuitState::HalfOpen => {
                *self.last_trip_reason.write().await = Some(reason.into());
                self.transition_to_open().await;
            }
            CircuitState::Open => {
                let mut last_failure = self.last_failure_time.write().await;
                *last_failure = Some(Instant::now());
            }
        }
    }

    async fn transition_to_open(&self) {
        let mut state = self.state.write().await;
        let previous = *state;
        *state = CircuitState::Open;
        *self.last_state_change.write().await = Instant::now();
        self.success_count.store(0, Ordering::Relaxed);
        warn!(?previous, "circuit breaker opened");
    }

    async fn transition_to_half_open(&self) {
        *self.state.write().await = CircuitState::HalfOpen;
        *self.last_state_change.write().await = Instant::now();
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        info!("circuit breaker transitioned to half-open");
    }

    async fn transition_to_closed(&self) {
        let mut state = self.state.write().await;
        let previous = *state;
        *state = CircuitState::Closed;
        *self.last_state_change.write().await = Instant::now();
        self.failure_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        *self.last_trip_reason.write().await = None;
        info!(?previous, "circuit breaker closed, service recovered");
    }

    pub async fn get_state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn last_trip_reason(&self) -> Option<String> {
        self.last_trip_reason.read().await.clone()
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let last_change = *self.last_state_change.read().await;
        CircuitBreakerMetrics {
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_state_change_seconds: last_change.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(50),
            success_threshold: 1,
            failure_window: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(config(3));
        for _ in 0..3 {
            cb.record_failure("boom").await;
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);
        assert!(!cb.should_allow().await);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let cb = CircuitBreaker::new(config(1));
        cb.record_failure("boom").await;
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.should_allow().await);
        assert_eq!(cb.get_state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new(config(1));
        cb.record_failure("boom").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.should_allow().await;
        assert_eq!(cb.get_state().await, CircuitState::HalfOpen);

        cb.record_failure("still broken").await;
        assert_eq!(cb.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let cb = CircuitBreaker::new(config(3));
        cb.record_failure("one").await;
        cb.record_success().await;
        cb.record_failure("two").await;
        cb.record_failure("three").await;
        // only 2 consecutive-since-reset failures recorded, should stay closed
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }
}

//! Success-rate and failure-streak alarms over a sliding window of
//! completed agent runs.

use crate::constants::{
    DEFAULT_FAILURE_STREAK_THRESHOLD, DEFAULT_MINIMUM_COMPLETIONS_FOR_ALARM,
    DEFAULT_PRODUCTIVITY_WINDOW_SECS, DEFAULT_SUCCESS_RATE_THRESHOLD,
};
use crate::models::{CompletionRecord, ModelClass};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct ProductivityConfig {
    pub window_secs: i64,
    pub minimum_completions: usize,
    pub success_rate_threshold: f64,
    pub failure_streak_threshold: u32,
}

impl Default for ProductivityConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_PRODUCTIVITY_WINDOW_SECS,
            minimum_completions: DEFAULT_MINIMUM_COMPLETIONS_FOR_ALARM,
            success_rate_threshold: DEFAULT_SUCCESS_RATE_THRESHOLD,
            failure_streak_threshold: DEFAULT_FAILURE_STREAK_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProductivityStats {
    pub total_completions: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub consecutive_failures: u32,
    pub tasks_per_hour: f64,
    pub per_model: HashMap<String, ModelStats>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStats {
    pub completions: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProductivityAlert {
    LowSuccessRate,
    SlowDuration,
    FailureStreak,
}

struct Inner {
    records: Vec<CompletionRecord>,
    consecutive_failures: u32,
    fired_this_hour: HashSet<(String, i64)>,
}

pub struct ProductivityMonitor {
    config: ProductivityConfig,
    slow_duration_threshold_ms: u64,
    inner: Arc<Mutex<Inner>>,
}

impl ProductivityMonitor {
    pub fn new(config: ProductivityConfig, slow_duration_threshold_ms: u64) -> Self {
        Self {
            config,
            slow_duration_threshold_ms,
            inner: Arc::new(Mutex::new(Inner {
                records: Vec::new(),
                consecutive_failures: 0,
                fired_this_hour: HashSet::new(),
            })),
        }
    }

    /// Record a completion and return any alerts that just fired.
    /// Each alert kind is suppressed to once per hour via a
    /// `(kind, hour_bucket)` dedup key.
    pub async fn record_completion(&self, record: CompletionRecord) -> Vec<ProductivityAlert> {
        let mut inner = self.inner.lock().await;
        let now = record.timestamp;

        if record.success {
            inner.consecutive_failures = 0;
        } else {
            inner.consecutive_failures += 1;
        }

        inner.records.push(record);

        let window_start = now - ChronoDuration::seconds(self.config.window_secs);
        inner.records.retain(|r| r.timestamp >= window_start);

        let mut alerts = Vec::new();
        let hour_bucket = now.timestamp() / 3600;

        let total = inner.records.len();
        if total >= self.config.minimum_completions {
            let successes = inner.records.iter().filter(|r| r.success).count();
            let rate = successes as f64 / total as f64;
            if rate < self.config.success_rate_threshold
                && inner
                    .fired_this_hour
                    .insert(("low_success_rate".to_string(), hour_bucket))
            {
                alerts.push(ProductivityAlert::LowSuccessRate);
            }

            let avg_duration = inner.records.iter().map(|r| r.duration_ms as f64).sum::<f64>()
                / total as f64;
            if avg_duration > self.slow_duration_threshold_ms as f64
                && inner
                    .fired_this_hour
                    .insert(("slow_duration".to_string(), hour_bucket))
            {
                alerts.push(ProductivityAlert::SlowDuration);
            }
        }

        if inner.consecutive_failures >= self.config.failure_streak_threshold
            && inner
                .fired_this_hour
                .insert(("failure_streak".to_string(), hour_bucket))
        {
            alerts.push(ProductivityAlert::FailureStreak);
        }

        if !alerts.is_empty() {
            warn!(?alerts, "productivity monitor alert");
        }

        alerts
    }

    /// Whether new work should be scheduled right now. Mirrors the
    /// failure-streak alarm: a streak at or past threshold blocks new
    /// spawns until a success resets it, the same condition that fires
    /// `ProductivityAlert::FailureStreak`.
    pub async fn allow(&self) -> bool {
        self.inner.lock().await.consecutive_failures < self.config.failure_streak_threshold
    }

    pub async fn get_stats(&self) -> ProductivityStats {
        let inner = self.inner.lock().await;
        let total = inner.records.len();
        let successes = inner.records.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };
        let average_duration_ms = if total == 0 {
            0.0
        } else {
            inner.records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64
        };

        let window_hours = (self.config.window_secs as f64 / 3600.0).max(1.0 / 3600.0);
        let tasks_per_hour = total as f64 / window_hours;

        let mut per_model: HashMap<String, (usize, usize)> = HashMap::new();
        for r in inner.records.iter() {
            let entry = per_model.entry(r.model.as_str().to_string()).or_insert((0, 0));
            entry.0 += 1;
            if r.success {
                entry.1 += 1;
            }
        }

        ProductivityStats {
            total_completions: total,
            success_rate,
            average_duration_ms,
            consecutive_failures: inner.consecutive_failures,
            tasks_per_hour,
            per_model: per_model
                .into_iter()
                .map(|(k, (completions, successes))| {
                    (
                        k,
                        ModelStats {
                            completions,
                            success_rate: if completions == 0 {
                                1.0
                            } else {
                                successes as f64 / completions as f64
                            },
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(success: bool) -> CompletionRecord {
        CompletionRecord {
            session_id: "s1".to_string(),
            task_id: "t1".to_string(),
            model: ModelClass::SonnetPool,
            success,
            duration_ms: 100,
            tokens_used: 10,
            cost_usd: 0.01,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failure_streak_fires_alert() {
        let monitor = ProductivityMonitor::new(
            ProductivityConfig {
                failure_streak_threshold: 2,
                ..Default::default()
            },
            60_000,
        );
        monitor.record_completion(completion(false)).await;
        let alerts = monitor.record_completion(completion(false)).await;
        assert!(alerts.contains(&ProductivityAlert::FailureStreak));
    }

    #[tokio::test]
    async fn success_resets_streak() {
        let monitor = ProductivityMonitor::new(
            ProductivityConfig {
                failure_streak_threshold: 2,
                ..Default::default()
            },
            60_000,
        );
        monitor.record_completion(completion(false)).await;
        monitor.record_completion(completion(true)).await;
        let stats = monitor.get_stats().await;
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn allow_blocks_on_active_failure_streak() {
        let monitor = ProductivityMonitor::new(
            ProductivityConfig {
                failure_streak_threshold: 2,
                ..Default::default()
            },
            60_000,
        );
        assert!(monitor.allow().await);
        monitor.record_completion(completion(false)).await;
        monitor.record_completion(completion(false)).await;
        assert!(!monitor.allow().await);
        monitor.record_completion(completion(true)).await;
        assert!(monitor.allow().await);
    }

    #[tokio::test]
    async fn low_success_rate_requires_minimum_sample() {
        let monitor = ProductivityMonitor::new(
            ProductivityConfig {
                minimum_completions: 5,
                success_rate_threshold: 0.9,
                ..Default::default()
            },
            60_000,
        );
        // one failure, below minimum sample — must not fire yet
        let alerts = monitor.record_completion(completion(false)).await;
        assert!(!alerts.contains(&ProductivityAlert::LowSuccessRate));
    }
}

//! System-wide tunables and the reasoning behind their defaults.
//!
//! Every constant here is overridable via environment variable (see
//! `config`); the literal below is what ships when the operator sets
//! nothing. Treat this file as the place to look up *why* a number is
//! what it is, not just what it is.

/// Default Opus session cap. Opus is the expensive, high-reasoning
/// model class; one concurrent session is the safe default for a
/// single-operator deployment and avoids accidental budget spikes.
pub const DEFAULT_OPUS_SESSION_LIMIT: u32 = 1;

/// Default Sonnet-pool session cap (Sonnet and Haiku share this pool).
/// Two concurrent sessions balances throughput against the same
/// per-host resource envelope Opus is capped for.
pub const DEFAULT_SONNET_SESSION_LIMIT: u32 = 2;

/// Age-based fairness boost applied to a task's priority, per hour
/// it has sat in the queue. Small enough that a genuinely low-priority
/// task still waits behind fresh high-priority work for a long time,
/// but large enough that a task is never starved indefinitely.
pub const QUEUE_AGE_BOOST_PER_HOUR: f64 = 0.1;

/// Upper bound on tasks held in the queue at once. Past this the queue
/// rejects new work rather than growing unbounded.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// How many events the dispatcher keeps in its history ring before
/// evicting the oldest. Sized for a few hours of activity at typical
/// tick rates without unbounded memory growth.
pub const DEFAULT_EVENT_HISTORY_SIZE: usize = 1000;

/// Default poll interval for the main loop tick.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default grace period given to in-flight agents to finish when a
/// shutdown is requested before they're considered orphaned.
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Default circuit breaker failure threshold within its rolling window.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Default circuit breaker reset timeout: how long `open` holds before
/// the breaker allows a half-open probe.
pub const DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Half-open state requires this many consecutive probe successes
/// before fully closing again.
pub const DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD: u32 = 1;

/// Window over which circuit breaker failures are counted.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_WINDOW_SECS: u64 = 300;

/// Default timeout for a pending task approval request. Chosen to be
/// long enough for a human to notice and respond, short enough that a
/// forgotten request doesn't block the queue forever.
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Tasks at or above this integer priority auto-approve even without
/// prior human confirmation, on the assumption that urgency was
/// already judged by whoever set the priority.
pub const DEFAULT_AUTO_APPROVE_PRIORITY_THRESHOLD: i64 = 8;

/// Productivity monitor: sliding window length for success-rate and
/// duration statistics.
pub const DEFAULT_PRODUCTIVITY_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Productivity monitor: minimum completions observed before the
/// success-rate alarm is allowed to fire. Prevents one early failure
/// from tripping an alarm against a near-empty sample.
pub const DEFAULT_MINIMUM_COMPLETIONS_FOR_ALARM: usize = 5;

/// Productivity monitor: success rate floor before an alarm fires.
pub const DEFAULT_SUCCESS_RATE_THRESHOLD: f64 = 0.70;

/// Productivity monitor: consecutive-failure streak that fires an
/// alarm regardless of overall success rate.
pub const DEFAULT_FAILURE_STREAK_THRESHOLD: u32 = 3;

/// Productivity monitor: average session duration past which the
/// slow-duration alarm fires.
pub const DEFAULT_SLOW_SESSION_DURATION_MS: u64 = 30 * 60 * 1000;

/// Spend monitor: default budget threshold percentages that each fire
/// (at most once per period) as usage climbs toward the cap.
pub const DEFAULT_BUDGET_ALERT_THRESHOLDS: &[f64] = &[0.5, 0.8, 1.0];

/// Retry policy for transient collaborator failures (repository
/// writes, notification posts): capped exponential backoff with
/// jitter, matching the ambient retry idiom used elsewhere.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const RETRY_BACKOFF_FACTOR: f64 = 2.0;
pub const RETRY_MAX_BACKOFF_MS: u64 = 30_000;
pub const RETRY_JITTER_RATIO: f64 = 0.25;

/// Default path for the orchestration state file, relative to the
/// process's working directory.
pub const DEFAULT_STATE_FILE_PATH: &str = "conductor_state.json";

/// Current on-disk schema version for the state file. Bump when the
/// persisted shape changes in a way old files can't self-describe.
pub const STATE_FILE_SCHEMA_VERSION: u32 = 1;

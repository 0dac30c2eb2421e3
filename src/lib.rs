//! # Conductor Core
//!
//! An autonomous multi-agent task orchestrator: a priority queue with
//! age-based fairness, per-model-class capacity gating, and a safety
//! rail stack (circuit breaker, spend monitor, productivity monitor,
//! human approval gate) wrapped around long-running agent sessions.
//!
//! ## Architecture
//!
//! - **Scheduler**: matches queued tasks to free capacity and invokes
//!   the agent runtime.
//! - **MainLoop**: the tick-driven state machine tying scheduling,
//!   safety gates, and event wiring together.
//! - **Agent runtime**: an external process, reached only through the
//!   `AgentManager` trait — the core never assumes a specific vendor
//!   or protocol.
//! - **Repositories**: `TaskRepository` / `UsageLogRepository` abstract
//!   storage so an in-memory reference implementation and a database
//!   backend are interchangeable.
//!
//! ## Usage
//!
//! Typically run as a standalone process: load `Config` from the
//! environment, construct the collaborator stack, and drive a
//! `MainLoop` until shutdown.

/// Per-model-class session capacity gating
pub mod capacity;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Typed event dispatcher for agent-session events
pub mod events;
/// Tick-driven orchestration state machine
pub mod main_loop;
/// Core data models
pub mod models;
/// The external agent runtime, as a collaborator trait
pub mod agent_manager;
/// Human-visible notification sink
pub mod notify;
/// Priority task queue with age-based fairness
pub mod queue;
/// Task and usage-log storage abstractions
pub mod repositories;
/// Circuit breaker, spend/productivity monitors, and the approval gate
pub mod safety;
/// Matches queued work to free capacity
pub mod scheduler;
/// Authoritative orchestration snapshot with atomic disk persistence
pub mod state;

pub use error::{ConductorError, Result};

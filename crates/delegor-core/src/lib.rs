//! Core types and error definitions for the Delegor coordination engine.
//!
//! This crate provides the foundational types shared across all Delegor crates:
//! the task model, aggregation policies, agent handles, configuration, and the
//! unified error enum.
//!
//! # Main types
//!
//! - [`DelegorError`] — Unified error enum for all Delegor subsystems.
//! - [`DelegorResult`] — Convenience alias for `Result<T, DelegorError>`.
//! - [`Domain`] — Domain tag (nlp, vision, knowledge, pricing).
//! - [`Task`] — A unit of work with status, deadline, and retry accounting.
//! - [`TaskGroup`] / [`AggregationPolicy`] — How a parent result is derived
//!   from its children's outcomes.
//! - [`AgentHandle`] — Identity, load, and health of a pool member.
//! - [`CoordinatorConfig`] — TOML-backed engine configuration.

/// Engine configuration (delivery mode, retry, circuit, per-domain tuning).
pub mod config;
/// Task groups and aggregation policies.
pub mod group;
/// Agent pool member identity and health.
pub mod handle;
/// Task model: domains, payloads, statuses, outcomes.
pub mod task;

pub use config::{
    CircuitBreakerConfig, CoordinatorConfig, DeliveryMode, DomainConfig, RetryPolicy,
};
pub use group::{AggregationPolicy, GroupResolution, OutcomeCounts, TaskGroup};
pub use handle::{AgentHandle, HealthStatus};
pub use task::{Domain, Payload, Task, TaskOutcome, TaskStatus};

/// Top-level error type for the Delegor engine.
///
/// Each variant corresponds either to a subsystem that can produce errors or
/// to one of the user-visible failure classes (validation, timeout, circuit
/// open, version conflict, group deadline).
#[derive(Debug, thiserror::Error)]
pub enum DelegorError {
    /// A malformed request or payload. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A capability call exceeded its deadline and was abandoned.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The circuit for a domain is open; dispatch fails fast.
    #[error("Domain unavailable: {0}")]
    DomainUnavailable(task::Domain),

    /// An optimistic-concurrency update lost the race on a ledger entry.
    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The task whose entry was contended.
        task_id: uuid::Uuid,
        /// The version the writer expected to replace.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// A group-level timeout elapsed before the group resolved.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An error from the task ledger.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// An error from the message bus.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error raised by a domain capability during invocation.
    #[error("Capability error: {0}")]
    Capability(String),

    /// An error from a sub-master coordination loop.
    #[error("Sub-master error: {0}")]
    SubMaster(String),

    /// An error from the root orchestrator.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DelegorError`].
pub type DelegorResult<T> = Result<T, DelegorError>;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delegor_core::{DelegorResult, Domain, HealthStatus, Task, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue carrying parent-level results back to the orchestrator.
pub const RESULTS_QUEUE: &str = "results.orchestrator";

/// Queue carrying sub-master heartbeats.
pub const HEALTH_QUEUE: &str = "health";

/// The inbox queue of a domain's sub-master.
pub fn task_queue(domain: Domain) -> String {
    format!("tasks.{domain}")
}

/// The queue a sub-master's agent workers consume from.
pub fn agent_queue(domain: Domain) -> String {
    format!("agents.{domain}")
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A task handed to a sub-master, or a sub-task handed to an agent pool.
    TaskAssignment {
        /// The task to execute or decompose.
        task: Task,
    },
    /// A terminal outcome flowing upstream.
    ResultReport {
        /// The task this outcome belongs to.
        task_id: Uuid,
        /// The owning domain.
        domain: Domain,
        /// The terminal outcome.
        outcome: TaskOutcome,
    },
    /// A sub-master's periodic pool-health signal.
    Heartbeat {
        /// The reporting domain.
        domain: Domain,
        /// Rolled-up pool health.
        health: HealthStatus,
    },
}

/// A message plus its delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Delivery identity, stable across redeliveries.
    pub id: Uuid,
    /// The queue this envelope sits on.
    pub queue: String,
    /// Delivery attempt, starting at 1; bumps on visibility-timeout redelivery.
    pub attempt: u32,
    /// When the message was first published.
    pub enqueued_at: DateTime<Utc>,
    /// The payload.
    pub message: BusMessage,
}

/// A consumed envelope awaiting acknowledgment.
///
/// Until [`MessageBus::ack`] is called the broker considers the message
/// in flight and will redeliver it after the visibility timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The consumed envelope.
    pub envelope: Envelope,
}

/// The abstract broker contract the engine requires.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue a message on `queue`.
    async fn publish(&self, queue: &str, message: BusMessage) -> DelegorResult<()>;

    /// Enqueue a message after `delay` elapses (backoff requeue).
    async fn publish_delayed(
        &self,
        queue: &str,
        message: BusMessage,
        delay: Duration,
    ) -> DelegorResult<()>;

    /// Receive the next message from `queue`.
    ///
    /// Suspends until a message is available; returns `None` once the bus is
    /// shut down.
    async fn consume(&self, queue: &str) -> Option<Delivery>;

    /// Acknowledge a delivery, removing it from the redelivery window.
    async fn ack(&self, delivery: &Delivery) -> DelegorResult<()>;

    /// Stop delivery; pending and future `consume` calls return `None`.
    fn shutdown(&self);

    /// Whether [`MessageBus::shutdown`] has been called.
    fn is_shutdown(&self) -> bool;
}

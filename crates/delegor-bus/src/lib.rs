//! Message bus abstraction between the orchestrator, sub-masters, and agents.
//!
//! The engine only assumes the abstract contract: at-least-once delivery,
//! consumer acknowledgment, visibility-timeout redelivery of unacked messages,
//! and FIFO within a queue (which preserves order inside a single task's retry
//! sequence). No ordering is guaranteed across different tasks. A concrete
//! broker is an external collaborator; [`InMemoryBus`] is the in-process
//! implementation used by the engine and its tests.
//!
//! # Main types
//!
//! - [`MessageBus`] — The abstract broker contract.
//! - [`BusMessage`] — The protocol: assignments, result reports, heartbeats.
//! - [`InMemoryBus`] — In-memory broker with visibility-timeout redelivery.

/// In-memory broker implementation.
pub mod memory;
/// Protocol messages, envelopes, and the bus trait.
pub mod protocol;

pub use memory::InMemoryBus;
pub use protocol::{
    agent_queue, task_queue, BusMessage, Delivery, Envelope, MessageBus, HEALTH_QUEUE,
    RESULTS_QUEUE,
};

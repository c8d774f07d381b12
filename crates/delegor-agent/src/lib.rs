//! Agent executors: the leaves of the delegation hierarchy.
//!
//! An executor wraps a single unit of domain work behind a capability
//! interface, enforces its deadline, and reports success or failure to the
//! owning sub-master. The pool tracks member identity, load, and health for
//! least-loaded dispatch.
//!
//! # Main types
//!
//! - [`CapabilitySet`] — One capability implementation per domain tag,
//!   dispatched by enum match.
//! - [`AgentExecutor`] — Deadline-enforcing execution of one sub-task.
//! - [`AgentPool`] — Load/health-tracked registry of agent handles.

/// Domain capability interfaces and the tagged dispatcher.
pub mod capability;
/// Deadline-enforcing execution.
pub mod executor;
/// Agent handle registry with load accounting.
pub mod pool;

pub use capability::{
    CapabilitySet, KnowledgeCapability, NlpCapability, PricingCapability, PricingDecision,
    RankedMatch, VisionCapability,
};
pub use executor::AgentExecutor;
pub use pool::AgentPool;

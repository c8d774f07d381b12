use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain tag identifying which sub-master owns a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Natural-language processing.
    Nlp,
    /// Image feature extraction.
    Vision,
    /// Knowledge-base retrieval.
    Knowledge,
    /// Pricing evaluation.
    Pricing,
}

impl Domain {
    /// All domains, in dispatch order.
    pub const ALL: [Domain; 4] = [Domain::Nlp, Domain::Vision, Domain::Knowledge, Domain::Pricing];
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Nlp => write!(f, "nlp"),
            Domain::Vision => write!(f, "vision"),
            Domain::Knowledge => write!(f, "knowledge"),
            Domain::Pricing => write!(f, "pricing"),
        }
    }
}

/// The unit of data a task carries to its capability.
///
/// `Batch` is the fan-out shape: the default decomposer splits it one child
/// per item. The remaining shapes map one-to-one onto capability calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Raw text for NLP processing.
    Text {
        /// The text to process.
        text: String,
    },
    /// Encoded image bytes for feature extraction.
    Image {
        /// The image content.
        bytes: Vec<u8>,
    },
    /// A retrieval query for the knowledge base.
    Query {
        /// The query string.
        query: String,
    },
    /// An arbitrary structured context for pricing evaluation.
    Context {
        /// The evaluation context.
        context: serde_json::Value,
    },
    /// A batch of payloads to fan out across sub-tasks.
    Batch {
        /// The individual payloads.
        items: Vec<Payload>,
    },
}

/// Status of a task in its lifecycle.
///
/// Transitions only move forward through
/// `Pending → Dispatched → Running → {Succeeded, Failed, Cancelled}`, with the
/// single backward edge `Failed → Pending` used by bounded retry. The ledger
/// rejects everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to a queue consumer.
    Pending,
    /// Enqueued for a sub-master or an agent pool.
    Dispatched,
    /// An executor is working on it.
    Running,
    /// Terminal: completed with a result.
    Succeeded,
    /// Failed with a reason; retryable until the budget is spent.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Terminal: abandoned because the parent resolved or timed out.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Dispatched)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::Dispatched, TaskStatus::Running)
            | (TaskStatus::Dispatched, TaskStatus::Failed { .. })
            | (TaskStatus::Dispatched, TaskStatus::Cancelled)
            | (TaskStatus::Running, TaskStatus::Succeeded)
            | (TaskStatus::Running, TaskStatus::Failed { .. })
            | (TaskStatus::Running, TaskStatus::Cancelled)
            | (TaskStatus::Failed { .. }, TaskStatus::Pending) => true,
            _ => false,
        }
    }
}

/// Terminal projection of a task, used by aggregation and result reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Completed with a result value.
    Succeeded {
        /// The produced result.
        value: serde_json::Value,
    },
    /// Failed after exhausting its retry budget (or not retryable).
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Cancelled before producing a result.
    Cancelled,
}

impl TaskOutcome {
    /// Whether this outcome counts as a success for aggregation.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }
}

/// A unit of work tracked by the ledger and routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identity; also the idempotency key for resubmission.
    pub id: Uuid,
    /// The domain whose sub-master owns this task.
    pub domain: Domain,
    /// The data handed to the capability (or fanned out to children).
    pub payload: Payload,
    /// The task that spawned this one. `None` only for root tasks.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Absolute deadline; executions past it are abandoned.
    pub deadline: DateTime<Utc>,
    /// Number of `Failed → Pending` retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Result value, set only on `Succeeded`.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of reaching a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending root task.
    pub fn new(domain: Domain, payload: Payload, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            payload,
            parent_id: None,
            status: TaskStatus::Pending,
            deadline,
            retry_count: 0,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark this task as a child of `parent`.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Whether this is a root task (created by the orchestrator).
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Terminal projection, or `None` while the task is still live.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match &self.status {
            TaskStatus::Succeeded => Some(TaskOutcome::Succeeded {
                value: self.result.clone().unwrap_or(serde_json::Value::Null),
            }),
            TaskStatus::Failed { reason } => Some(TaskOutcome::Failed {
                reason: reason.clone(),
            }),
            TaskStatus::Cancelled => Some(TaskOutcome::Cancelled),
            _ => None,
        }
    }

    /// Time left until the absolute deadline, or `None` if it already passed.
    pub fn time_remaining(&self) -> Option<std::time::Duration> {
        (self.deadline - Utc::now()).to_std().ok()
    }
}

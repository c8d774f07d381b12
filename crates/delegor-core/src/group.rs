use crate::task::TaskOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The rule by which a parent's result is derived from its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Every child must succeed.
    AllSucceed,
    /// At least `required` children must succeed.
    AnySucceed {
        /// Minimum number of successful children.
        required: usize,
    },
    /// Collect whatever succeeds, tolerating up to `max_failures` failures.
    BestEffort {
        /// How many terminal failures the group absorbs before failing.
        max_failures: usize,
    },
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        AggregationPolicy::AllSucceed
    }
}

/// How a group currently stands against its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupResolution {
    /// The policy's success predicate is satisfied.
    Succeeded,
    /// The predicate is provably unsatisfiable.
    Failed,
    /// Still waiting on children.
    Unresolved,
}

/// Tallies of child outcomes, the only input `resolve` looks at.
///
/// Cancelled children count as failures: they will never contribute a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Children that succeeded.
    pub succeeded: usize,
    /// Children that terminally failed or were cancelled.
    pub failed: usize,
    /// Total number of children in the group.
    pub total: usize,
}

impl OutcomeCounts {
    /// Tally a slice of terminal outcomes against a known group size.
    pub fn tally(outcomes: &[TaskOutcome], total: usize) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            succeeded,
            failed: outcomes.len() - succeeded,
            total,
        }
    }

    /// Children that have not reached a terminal status yet.
    pub fn unresolved(&self) -> usize {
        self.total - self.succeeded - self.failed
    }
}

impl AggregationPolicy {
    /// Resolve the group against the current tallies.
    ///
    /// Pure and commutative over children: only counts matter, never the order
    /// in which outcomes arrived. Returns `Failed` as soon as success becomes
    /// provably unsatisfiable, without waiting for stragglers.
    pub fn resolve(&self, counts: &OutcomeCounts) -> GroupResolution {
        match self {
            AggregationPolicy::AllSucceed => {
                if counts.failed > 0 {
                    GroupResolution::Failed
                } else if counts.succeeded == counts.total {
                    GroupResolution::Succeeded
                } else {
                    GroupResolution::Unresolved
                }
            }
            AggregationPolicy::AnySucceed { required } => {
                if counts.succeeded >= *required {
                    GroupResolution::Succeeded
                } else if counts.succeeded + counts.unresolved() < *required {
                    GroupResolution::Failed
                } else {
                    GroupResolution::Unresolved
                }
            }
            AggregationPolicy::BestEffort { max_failures } => {
                if counts.failed > *max_failures {
                    GroupResolution::Failed
                } else if counts.unresolved() == 0 {
                    GroupResolution::Succeeded
                } else {
                    GroupResolution::Unresolved
                }
            }
        }
    }
}

/// A root request's set of child task ids plus its aggregation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group identity; doubles as the correlation id returned to callers.
    pub id: Uuid,
    /// The member task ids.
    pub children: Vec<Uuid>,
    /// How the members' outcomes combine.
    pub policy: AggregationPolicy,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl TaskGroup {
    /// Create a group over the given members.
    pub fn new(children: Vec<Uuid>, policy: AggregationPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            children,
            policy,
            created_at: Utc::now(),
        }
    }
}

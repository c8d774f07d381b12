use delegor_core::{DelegorResult, Task, TaskOutcome};
use uuid::Uuid;

/// Domain-specific decomposition and aggregation strategy.
///
/// The contract is fixed even though the strategy is pluggable: every child
/// returned by `decompose` carries `parent_id = task.id`, and `aggregate`
/// must reconstruct the parent's result purely from its children's outcomes.
/// An empty decomposition means the task is a leaf and is executed directly.
pub trait Decomposer: Send + Sync {
    /// Split a task into sub-tasks, or return an empty vec for a leaf.
    fn decompose(&self, task: &Task) -> DelegorResult<Vec<Task>>;

    /// Merge child outcomes into the parent's result value.
    ///
    /// Must be commutative over children: siblings complete in any order.
    fn aggregate(&self, task: &Task, outcomes: &[(Uuid, TaskOutcome)]) -> serde_json::Value;
}

/// The default strategy: fan a `Batch` payload out one child per item.
///
/// Non-batch payloads are leaves. Aggregation sorts children by task id (so
/// arrival order never shows through), collects successful values, and keeps
/// a marker per failed or cancelled child.
pub struct FanOutDecomposer;

impl Decomposer for FanOutDecomposer {
    fn decompose(&self, task: &Task) -> DelegorResult<Vec<Task>> {
        match &task.payload {
            delegor_core::Payload::Batch { items } => Ok(items
                .iter()
                .map(|item| {
                    Task::new(task.domain, item.clone(), task.deadline).with_parent(task.id)
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn aggregate(&self, task: &Task, outcomes: &[(Uuid, TaskOutcome)]) -> serde_json::Value {
        let mut sorted: Vec<&(Uuid, TaskOutcome)> = outcomes.iter().collect();
        sorted.sort_by_key(|(id, _)| *id);

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for (id, outcome) in sorted {
            match outcome {
                TaskOutcome::Succeeded { value } => results.push(value.clone()),
                TaskOutcome::Failed { reason } => failures.push(serde_json::json!({
                    "task_id": id,
                    "reason": reason,
                })),
                TaskOutcome::Cancelled => failures.push(serde_json::json!({
                    "task_id": id,
                    "reason": "cancelled",
                })),
            }
        }

        serde_json::json!({
            "domain": task.domain,
            "total": outcomes.len(),
            "succeeded": results.len(),
            "failed": failures.len(),
            "results": results,
            "failures": failures,
        })
    }
}

use crate::capability::CapabilitySet;
use chrono::{DateTime, Utc};
use delegor_core::{DelegorError, DelegorResult, Task};
use tracing::debug;

/// Executes one sub-task against its domain capability, under a deadline.
///
/// The deadline is absolute: if the capability does not complete in time the
/// call is abandoned and a timeout is reported to the sub-master, which
/// retries per policy. The collaborator itself is never forcibly killed.
#[derive(Clone)]
pub struct AgentExecutor {
    capabilities: CapabilitySet,
}

impl AgentExecutor {
    /// Create an executor over the given capability set.
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self { capabilities }
    }

    /// Run `task` against its domain capability, abandoning at `deadline`.
    pub async fn execute(
        &self,
        task: &Task,
        deadline: DateTime<Utc>,
    ) -> DelegorResult<serde_json::Value> {
        let window = (deadline - Utc::now()).to_std().map_err(|_| {
            DelegorError::Timeout(format!("task {} deadline already passed", task.id))
        })?;

        debug!(task_id = %task.id, domain = %task.domain, window_ms = window.as_millis() as u64, "executing");

        match tokio::time::timeout(window, self.capabilities.invoke(task.domain, &task.payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DelegorError::Timeout(format!(
                "task {} abandoned after {}ms",
                task.id,
                window.as_millis()
            ))),
        }
    }
}

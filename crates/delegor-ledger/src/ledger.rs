use chrono::{DateTime, Utc};
use delegor_core::{DelegorError, DelegorResult, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A task snapshot with its optimistic-concurrency version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The task as of this version.
    pub task: Task,
    /// Monotonically increasing version counter; bumps on every update.
    pub version: u64,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
}

/// The authoritative, versioned store of task state.
///
/// `update_status` is a compare-and-swap: it fails with
/// [`DelegorError::VersionConflict`] when the expected version is stale, and
/// rejects transitions outside the task state machine. [`TaskLedger::transition`]
/// wraps the re-read-and-retry loop so version conflicts stay invisible to
/// callers.
pub struct TaskLedger {
    entries: Arc<RwLock<HashMap<Uuid, LedgerEntry>>>,
}

impl TaskLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a task if its id is not already present.
    ///
    /// Returns `true` when the task was inserted, `false` when an entry with
    /// the same id already existed. Resubmitting after a crash therefore
    /// leaves exactly one live entry.
    pub async fn create(&self, task: Task) -> bool {
        let mut entries = self.entries.write().await;
        match entries.entry(task.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    task,
                    version: 1,
                    updated_at: Utc::now(),
                });
                true
            }
        }
    }

    /// Fetch the current entry for a task.
    pub async fn get(&self, id: Uuid) -> Option<LedgerEntry> {
        let entries = self.entries.read().await;
        entries.get(&id).cloned()
    }

    /// Compare-and-swap a status change.
    ///
    /// Fails with `VersionConflict` when `expected_version` is stale, and with
    /// a `Ledger` error when the transition is outside the state machine.
    /// Returns the new version on success.
    pub async fn update_status(
        &self,
        id: Uuid,
        expected_version: u64,
        new_status: TaskStatus,
    ) -> DelegorResult<u64> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| DelegorError::Ledger(format!("task {id} not found")))?;

        if entry.version != expected_version {
            return Err(DelegorError::VersionConflict {
                task_id: id,
                expected: expected_version,
                actual: entry.version,
            });
        }
        if !entry.task.status.can_transition_to(&new_status) {
            return Err(DelegorError::Ledger(format!(
                "invalid transition for task {id}: {:?} -> {:?}",
                entry.task.status, new_status
            )));
        }

        entry.task.status = new_status;
        if entry.task.status.is_terminal() {
            entry.task.completed_at = Some(Utc::now());
        }
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.version)
    }

    /// Compare-and-swap the terminal success transition, storing the result.
    pub async fn record_result(
        &self,
        id: Uuid,
        expected_version: u64,
        value: serde_json::Value,
    ) -> DelegorResult<u64> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| DelegorError::Ledger(format!("task {id} not found")))?;

        if entry.version != expected_version {
            return Err(DelegorError::VersionConflict {
                task_id: id,
                expected: expected_version,
                actual: entry.version,
            });
        }
        if !entry.task.status.can_transition_to(&TaskStatus::Succeeded) {
            return Err(DelegorError::Ledger(format!(
                "invalid transition for task {id}: {:?} -> Succeeded",
                entry.task.status
            )));
        }

        entry.task.status = TaskStatus::Succeeded;
        entry.task.result = Some(value);
        entry.task.completed_at = Some(Utc::now());
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.version)
    }

    /// The single backward edge: `Failed → Pending`, consuming one retry.
    ///
    /// The caller enforces the retry budget; the ledger only counts.
    pub async fn retry(&self, id: Uuid, expected_version: u64) -> DelegorResult<u64> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| DelegorError::Ledger(format!("task {id} not found")))?;

        if entry.version != expected_version {
            return Err(DelegorError::VersionConflict {
                task_id: id,
                expected: expected_version,
                actual: entry.version,
            });
        }
        if !entry.task.status.can_transition_to(&TaskStatus::Pending) {
            return Err(DelegorError::Ledger(format!(
                "task {id} is not in a retryable state: {:?}",
                entry.task.status
            )));
        }

        entry.task.status = TaskStatus::Pending;
        entry.task.retry_count += 1;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.version)
    }

    /// Apply a transition computed from the current task state, absorbing
    /// version conflicts by re-reading and retrying.
    ///
    /// `f` inspects the task and returns the next status, or `None` when no
    /// transition applies anymore (another writer already moved it on).
    /// Returns `Ok(Some(version))` for the winning writer and `Ok(None)` for
    /// losers — which is how redelivered duplicates are absorbed.
    pub async fn transition<F>(&self, id: Uuid, f: F) -> DelegorResult<Option<u64>>
    where
        F: Fn(&Task) -> Option<TaskStatus>,
    {
        loop {
            let entry = self
                .get(id)
                .await
                .ok_or_else(|| DelegorError::Ledger(format!("task {id} not found")))?;
            let Some(next) = f(&entry.task) else {
                return Ok(None);
            };
            match self.update_status(id, entry.version, next).await {
                Ok(version) => return Ok(Some(version)),
                Err(DelegorError::VersionConflict { .. }) => {
                    debug!(task_id = %id, "ledger CAS lost, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A point-in-time copy of every entry.
    pub async fn snapshot(&self) -> Vec<LedgerEntry> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the ledger holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove terminal entries whose last update is older than `retention`.
    ///
    /// Live tasks are never collected. Returns how many entries were removed.
    pub async fn gc(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !(e.task.status.is_terminal() && e.updated_at < cutoff));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "ledger gc");
        }
        removed
    }

    /// Write every entry to `path` as JSON lines. Format is internal.
    pub async fn dump(&self, path: &Path) -> DelegorResult<usize> {
        let snapshot = self.snapshot().await;
        let mut file = tokio::fs::File::create(path).await?;
        for entry in &snapshot {
            let line = serde_json::to_string(entry)?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(snapshot.len())
    }

    /// Rebuild a ledger from a JSONL dump produced by [`TaskLedger::dump`].
    pub async fn load(path: &Path) -> DelegorResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut map = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: LedgerEntry = serde_json::from_str(line)?;
            map.insert(entry.task.id, entry);
        }
        Ok(Self {
            entries: Arc::new(RwLock::new(map)),
        })
    }
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

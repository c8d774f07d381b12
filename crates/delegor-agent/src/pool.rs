use delegor_core::{AgentHandle, Domain, HealthStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Registry of agent handles for one domain, owned by one sub-master.
///
/// Load counters move only through [`AgentPool::begin`] / [`AgentPool::finish`]
/// around each execution, so [`AgentPool::least_loaded_healthy`] always sees
/// accurate in-flight counts. Nothing outside the owning sub-master touches
/// the pool.
pub struct AgentPool {
    domain: Domain,
    handles: Arc<RwLock<HashMap<Uuid, AgentHandle>>>,
}

impl AgentPool {
    /// Create a pool of `size` fresh healthy handles for `domain`.
    pub fn new(domain: Domain, size: usize) -> Self {
        let mut handles = HashMap::new();
        for _ in 0..size {
            let handle = AgentHandle::new(domain);
            handles.insert(handle.id, handle);
        }
        Self {
            domain,
            handles: Arc::new(RwLock::new(handles)),
        }
    }

    /// The domain this pool serves.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Add one fresh handle, returning its id.
    pub async fn register(&self) -> Uuid {
        let handle = AgentHandle::new(self.domain);
        let id = handle.id;
        self.handles.write().await.insert(id, handle);
        id
    }

    /// The healthy member with the lowest in-flight load, if any.
    ///
    /// Ties break on id so repeated picks are deterministic.
    pub async fn least_loaded_healthy(&self) -> Option<Uuid> {
        let handles = self.handles.read().await;
        handles
            .values()
            .filter(|h| h.is_dispatchable())
            .min_by_key(|h| (h.load, h.id))
            .map(|h| h.id)
    }

    /// Count an execution starting on `id`.
    pub async fn begin(&self, id: Uuid) {
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&id) {
            handle.load += 1;
        }
    }

    /// Count an execution finishing on `id`.
    pub async fn finish(&self, id: Uuid) {
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&id) {
            if handle.load == 0 {
                warn!(agent = %id, "load counter underflow");
            }
            handle.load = handle.load.saturating_sub(1);
        }
    }

    /// Update a member's health.
    pub async fn set_health(&self, id: Uuid, health: HealthStatus) {
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&id) {
            handle.health = health;
        }
    }

    /// Roll the pool up into one health signal for heartbeats.
    ///
    /// No dispatchable member means the domain is unreachable; any impaired
    /// member degrades the pool; otherwise it is healthy.
    pub async fn overall_health(&self) -> HealthStatus {
        let handles = self.handles.read().await;
        let healthy = handles.values().filter(|h| h.is_dispatchable()).count();
        if healthy == 0 {
            HealthStatus::Unreachable
        } else if healthy < handles.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// A point-in-time copy of every handle.
    pub async fn snapshot(&self) -> Vec<AgentHandle> {
        let handles = self.handles.read().await;
        handles.values().cloned().collect()
    }

    /// Number of members in the pool.
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Whether the pool has no members.
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_starts_healthy() {
        let pool = AgentPool::new(Domain::Nlp, 3);
        assert_eq!(pool.len().await, 3);
        assert_eq!(pool.overall_health().await, HealthStatus::Healthy);
        assert!(pool.least_loaded_healthy().await.is_some());
    }

    #[tokio::test]
    async fn test_least_loaded_pick_tracks_load() {
        let pool = AgentPool::new(Domain::Vision, 2);
        let first = pool.least_loaded_healthy().await.unwrap();
        pool.begin(first).await;

        let second = pool.least_loaded_healthy().await.unwrap();
        assert_ne!(first, second, "loaded member must be skipped");

        pool.begin(second).await;
        // Both loaded equally; a pick is still possible.
        assert!(pool.least_loaded_healthy().await.is_some());

        pool.finish(first).await;
        assert_eq!(pool.least_loaded_healthy().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_unhealthy_members_never_picked() {
        let pool = AgentPool::new(Domain::Knowledge, 2);
        let snapshot = pool.snapshot().await;
        pool.set_health(snapshot[0].id, HealthStatus::Unreachable).await;
        pool.set_health(snapshot[1].id, HealthStatus::Degraded).await;

        assert!(pool.least_loaded_healthy().await.is_none());
        assert_eq!(pool.overall_health().await, HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_overall_health_degraded() {
        let pool = AgentPool::new(Domain::Pricing, 3);
        let snapshot = pool.snapshot().await;
        pool.set_health(snapshot[0].id, HealthStatus::Unreachable).await;
        assert_eq!(pool.overall_health().await, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_empty_pool_unreachable() {
        let pool = AgentPool::new(Domain::Nlp, 0);
        assert!(pool.is_empty().await);
        assert_eq!(pool.overall_health().await, HealthStatus::Unreachable);
        assert!(pool.least_loaded_healthy().await.is_none());
    }

    #[tokio::test]
    async fn test_finish_saturates_at_zero() {
        let pool = AgentPool::new(Domain::Nlp, 1);
        let id = pool.least_loaded_healthy().await.unwrap();
        pool.finish(id).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].load, 0);
    }

    #[tokio::test]
    async fn test_register_grows_pool() {
        let pool = AgentPool::new(Domain::Vision, 1);
        let id = pool.register().await;
        assert_eq!(pool.len().await, 2);
        pool.set_health(id, HealthStatus::Unreachable).await;
        assert_eq!(pool.overall_health().await, HealthStatus::Degraded);
    }
}

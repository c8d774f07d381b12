use crate::task::Domain;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health of an agent pool member (or, rolled up, of a whole pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Accepting work normally.
    Healthy,
    /// Working but impaired; skipped by load balancing when possible.
    Degraded,
    /// Not responding; never dispatched to.
    Unreachable,
}

/// Identity of a pool member, owned exclusively by one sub-master.
///
/// The load counter is touched only by the owning pool, around each
/// execution, so least-loaded dispatch stays accurate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandle {
    /// Unique member identity.
    pub id: Uuid,
    /// The domain this member serves.
    pub domain: Domain,
    /// Number of executions currently in flight on this member.
    pub load: u32,
    /// Current health.
    pub health: HealthStatus,
}

impl AgentHandle {
    /// Create a fresh healthy handle for `domain`.
    pub fn new(domain: Domain) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            load: 0,
            health: HealthStatus::Healthy,
        }
    }

    /// Whether load balancing may pick this member.
    pub fn is_dispatchable(&self) -> bool {
        self.health == HealthStatus::Healthy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_healthy_and_idle() {
        let handle = AgentHandle::new(Domain::Vision);
        assert_eq!(handle.load, 0);
        assert_eq!(handle.health, HealthStatus::Healthy);
        assert!(handle.is_dispatchable());
    }

    #[test]
    fn test_unhealthy_not_dispatchable() {
        let mut handle = AgentHandle::new(Domain::Nlp);
        handle.health = HealthStatus::Degraded;
        assert!(!handle.is_dispatchable());
        handle.health = HealthStatus::Unreachable;
        assert!(!handle.is_dispatchable());
    }
}

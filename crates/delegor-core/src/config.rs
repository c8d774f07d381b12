use crate::group::AggregationPolicy;
use crate::task::Domain;
use crate::{DelegorError, DelegorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How resolved group results reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Caller polls by correlation id (or awaits the group handle).
    Poll,
    /// Results are additionally pushed over a channel as they resolve.
    Push,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Poll
    }
}

/// Retry behaviour for failed sub-tasks within one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of `Failed → Pending` retries per sub-task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Circuit-breaker thresholds for a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive `Unreachable` health signals before the circuit opens.
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
    /// How long an open circuit suppresses dispatch, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            unreachable_threshold: default_unreachable_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Per-domain sub-master tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Number of agent handles in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Concurrent executions allowed across the pool.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-attempt execution timeout, in milliseconds. The effective deadline
    /// of one attempt is the earlier of this and the task's absolute deadline.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Interval between pool-health heartbeats, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Retry policy for this domain's sub-tasks.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How a decomposed task's children aggregate into its result.
    #[serde(default)]
    pub aggregation: AggregationPolicy,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            concurrency: default_concurrency(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            retry: RetryPolicy::default(),
            aggregation: AggregationPolicy::default(),
        }
    }
}

/// Top-level engine configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Result delivery mode.
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// How long terminal ledger entries are retained before GC, in ms.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Default absolute deadline applied to submitted tasks, in ms.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// Circuit-breaker thresholds, shared across domains.
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    /// Per-domain overrides; unlisted domains use [`DomainConfig::default`].
    #[serde(default)]
    pub domains: HashMap<Domain, DomainConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::default(),
            retention_ms: default_retention_ms(),
            default_deadline_ms: default_deadline_ms(),
            circuit: CircuitBreakerConfig::default(),
            domains: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml(s: &str) -> DelegorResult<Self> {
        toml::from_str(s).map_err(|e| DelegorError::Config(format!("invalid config: {e}")))
    }

    /// The effective configuration for `domain`.
    pub fn domain(&self, domain: Domain) -> DomainConfig {
        self.domains.get(&domain).cloned().unwrap_or_default()
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_unreachable_threshold() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_pool_size() -> usize {
    3
}
fn default_concurrency() -> usize {
    2
}
fn default_attempt_timeout_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_retention_ms() -> u64 {
    300_000
}
fn default_deadline_ms() -> u64 {
    30_000
}

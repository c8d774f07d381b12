use delegor_core::{CircuitBreakerConfig, Domain, HealthStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
struct BreakerState {
    consecutive_unreachable: u32,
    open_until: Option<Instant>,
}

/// Per-domain circuit breaker fed by health signals.
///
/// After the configured number of consecutive `Unreachable` signals the
/// circuit opens for the cooldown window: new submissions to the domain fail
/// fast with `DomainUnavailable` instead of queueing indefinitely. A
/// `Healthy` signal closes the circuit immediately; an elapsed cooldown lets
/// traffic probe through again.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: RwLock<HashMap<Domain, BreakerState>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one health signal into the domain's breaker state.
    pub async fn record_health(&self, domain: Domain, health: HealthStatus) {
        let mut states = self.states.write().await;
        let state = states.entry(domain).or_default();
        match health {
            HealthStatus::Unreachable => {
                state.consecutive_unreachable += 1;
                if state.consecutive_unreachable >= self.config.unreachable_threshold {
                    let was_closed = state.open_until.is_none();
                    state.open_until =
                        Some(Instant::now() + Duration::from_millis(self.config.cooldown_ms));
                    if was_closed {
                        warn!(
                            domain = %domain,
                            signals = state.consecutive_unreachable,
                            cooldown_ms = self.config.cooldown_ms,
                            "circuit opened"
                        );
                    }
                }
            }
            HealthStatus::Healthy => {
                if state.open_until.is_some() {
                    info!(domain = %domain, "circuit closed on healthy signal");
                }
                state.consecutive_unreachable = 0;
                state.open_until = None;
            }
            HealthStatus::Degraded => {
                // Impaired but reachable: breaks the unreachable streak
                // without touching an already-open circuit.
                state.consecutive_unreachable = 0;
            }
        }
    }

    /// Whether dispatch to `domain` is currently suppressed.
    pub async fn is_open(&self, domain: Domain) -> bool {
        let states = self.states.read().await;
        states
            .get(&domain)
            .and_then(|s| s.open_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// The current unreachable streak for `domain` (diagnostics).
    pub async fn unreachable_streak(&self, domain: Domain) -> u32 {
        let states = self.states.read().await;
        states.get(&domain).map_or(0, |s| s.consecutive_unreachable)
    }
}

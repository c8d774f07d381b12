use delegor_core::{DelegorError, RetryPolicy};
use std::time::Duration;

/// Backoff delay for a given attempt: exponential, capped at the policy max.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let ms = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.backoff_max_ms);
    Duration::from_millis(ms)
}

/// Whether a leaf failure is transient and worth retrying.
///
/// Timeouts, capability faults, and bus hiccups retry; validation errors and
/// everything already classified at a higher level do not.
pub fn is_retryable(err: &DelegorError) -> bool {
    matches!(
        err,
        DelegorError::Timeout(_) | DelegorError::Capability(_) | DelegorError::Bus(_)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        };
        assert_eq!(compute_backoff(&policy, 0), Duration::from_millis(500));
        assert_eq!(compute_backoff(&policy, 1), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&policy, 2), Duration::from_millis(2000));
        assert_eq!(compute_backoff(&policy, 3), Duration::from_millis(4000));
        assert_eq!(compute_backoff(&policy, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&DelegorError::Timeout("slow".into())));
        assert!(is_retryable(&DelegorError::Capability("flaky model".into())));
        assert!(is_retryable(&DelegorError::Bus("broker blip".into())));

        assert!(!is_retryable(&DelegorError::Validation("bad payload".into())));
        assert!(!is_retryable(&DelegorError::Ledger("missing".into())));
        assert!(!is_retryable(&DelegorError::DomainUnavailable(
            delegor_core::Domain::Nlp
        )));
    }
}

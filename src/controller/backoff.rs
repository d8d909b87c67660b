//! Requeue backoff for failing reconciles

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const BASE_DELAY_SECS: u64 = 15;
/// First delay for errors a quick retry will not fix
const SLOW_BASE_DELAY_SECS: u64 = 60;
const MAX_DELAY_SECS: u64 = 300;

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(BASE_DELAY_SECS);
    let max = max_delay_secs.unwrap_or(MAX_DELAY_SECS);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(16)));
    Duration::from_secs(delay_secs.min(max))
}

/// Consecutive failures per request, keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    /// Record a failure and return the delay before the next attempt.
    /// Non-retriable errors start from a longer base delay.
    pub fn record_failure(&self, key: &str, retriable: bool) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let base = if retriable {
            BASE_DELAY_SECS
        } else {
            SLOW_BASE_DELAY_SECS
        };
        let delay = calculate_backoff(*attempt, Some(base), None);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(60));
        assert_eq!(calculate_backoff(3, None, None), Duration::from_secs(120));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));

        // capped at 5 minutes
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(40, None, None), Duration::from_secs(300));
    }

    #[test]
    fn test_custom_base_and_cap() {
        assert_eq!(calculate_backoff(2, Some(1), Some(10)), Duration::from_secs(4));
        assert_eq!(calculate_backoff(8, Some(1), Some(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_tracker_doubles_and_resets() {
        let tracker = FailureTracker::default();
        assert_eq!(tracker.record_failure("ns/a", true), Duration::from_secs(15));
        assert_eq!(tracker.record_failure("ns/a", true), Duration::from_secs(30));
        assert_eq!(tracker.record_failure("ns/b", true), Duration::from_secs(15));

        tracker.reset("ns/a");
        assert_eq!(tracker.record_failure("ns/a", true), Duration::from_secs(15));
    }

    #[test]
    fn test_non_retriable_failures_start_slower() {
        let tracker = FailureTracker::default();
        assert_eq!(tracker.record_failure("ns/a", false), Duration::from_secs(60));
        assert_eq!(tracker.record_failure("ns/a", false), Duration::from_secs(120));
        assert_eq!(tracker.record_failure("ns/a", false), Duration::from_secs(240));
        assert_eq!(tracker.record_failure("ns/a", false), Duration::from_secs(300));
    }
}

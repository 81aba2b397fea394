use std::time::Duration;

use dashmap::DashMap;

/// Smoothing factor for the first-token latency EWMA.
const EWMA_ALPHA: f64 = 0.3;

/// Ranking buckets first-token latency in 250 ms steps so small jitter does
/// not reorder otherwise-equal candidates.
const LATENCY_BUCKET_MS: f64 = 250.0;

#[derive(Debug, Clone, Default)]
pub struct AccountStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub ewma_first_token_ms: f64,
}

/// Per-account outcome metrics fed back by the dispatcher and consumed by
/// load-aware ranking.
#[derive(Default)]
pub struct OutcomeTracker {
    stats: DashMap<String, AccountStats>,
}

impl OutcomeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, account_id: &str, success: bool, first_token: Option<Duration>) {
        let mut entry = self.stats.entry(account_id.to_string()).or_default();
        if success {
            entry.successes += 1;
            entry.consecutive_failures = 0;
        } else {
            entry.failures += 1;
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
        if let Some(latency) = first_token {
            let sample = latency.as_millis() as f64;
            entry.ewma_first_token_ms = if entry.ewma_first_token_ms == 0.0 {
                sample
            } else {
                EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * entry.ewma_first_token_ms
            };
        }
    }

    /// Latency tier used as a secondary ranking key; 0 for unknown accounts.
    #[must_use]
    pub fn latency_bucket(&self, account_id: &str) -> u64 {
        self.stats
            .get(account_id)
            .map(|s| (s.ewma_first_token_ms / LATENCY_BUCKET_MS) as u64)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn get(&self, account_id: &str) -> Option<AccountStats> {
        self.stats.get(account_id).map(|s| s.clone())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_consecutive_failures() {
        let tracker = OutcomeTracker::new();
        tracker.record("a", false, None);
        tracker.record("a", false, None);
        assert_eq!(tracker.get("a").unwrap().consecutive_failures, 2);
        tracker.record("a", true, None);
        let stats = tracker.get("a").unwrap();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.successes, 1);
    }

    #[test]
    fn first_sample_seeds_the_ewma() {
        let tracker = OutcomeTracker::new();
        tracker.record("a", true, Some(Duration::from_millis(800)));
        let stats = tracker.get("a").unwrap();
        assert!((stats.ewma_first_token_ms - 800.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ewma_moves_toward_new_samples() {
        let tracker = OutcomeTracker::new();
        tracker.record("a", true, Some(Duration::from_millis(1000)));
        tracker.record("a", true, Some(Duration::from_millis(0)));
        let stats = tracker.get("a").unwrap();
        assert!(stats.ewma_first_token_ms < 1000.0);
        assert!(stats.ewma_first_token_ms > 0.0);
    }

    #[test]
    fn latency_bucket_quantizes() {
        let tracker = OutcomeTracker::new();
        tracker.record("a", true, Some(Duration::from_millis(600)));
        assert_eq!(tracker.latency_bucket("a"), 2);
        assert_eq!(tracker.latency_bucket("unknown"), 0);
    }
}

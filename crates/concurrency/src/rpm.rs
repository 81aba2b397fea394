use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use ferry_common::time::minute_epoch;

/// Bucket TTL is slightly longer than one minute so a bucket survives
/// until the next minute's readers are done with it.
const BUCKET_TTL: Duration = Duration::from_secs(75);

const SWEEP_EVERY: u64 = 256;

struct Bucket {
    count: AtomicU32,
    expires_at: Instant,
}

/// Per-account requests-per-minute counters keyed
/// `rpm:{account_id}:{minute_epoch}`.
///
/// Increments are atomic; the TTL is set once when the bucket is created
/// (re-setting it is a no-op, which keeps the operation idempotent).
#[derive(Default)]
pub struct RpmCounters {
    buckets: DashMap<String, Bucket>,
    increments_seen: AtomicU64,
}

impl RpmCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for the account in the current minute and return
    /// the bucket's new total.
    pub fn incr(&self, account_id: &str) -> u32 {
        let key = format!("rpm:{account_id}:{}", minute_epoch());
        let count = {
            let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
                count: AtomicU32::new(0),
                expires_at: Instant::now() + BUCKET_TTL,
            });
            bucket.count.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.sweep_if_due();
        count
    }

    /// Current count for the account in the current minute.
    #[must_use]
    pub fn current(&self, account_id: &str) -> u32 {
        let key = format!("rpm:{account_id}:{}", minute_epoch());
        self.buckets
            .get(&key)
            .map(|b| b.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn sweep_if_due(&self) {
        let seen = self.increments_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(SWEEP_EVERY) {
            return;
        }
        let now = Instant::now();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_within_the_minute() {
        let counters = RpmCounters::new();
        assert_eq!(counters.incr("acct-1"), 1);
        assert_eq!(counters.incr("acct-1"), 2);
        assert_eq!(counters.current("acct-1"), 2);
    }

    #[test]
    fn accounts_are_independent() {
        let counters = RpmCounters::new();
        counters.incr("acct-1");
        assert_eq!(counters.current("acct-2"), 0);
    }

    #[test]
    fn unknown_account_reads_zero() {
        let counters = RpmCounters::new();
        assert_eq!(counters.current("nobody"), 0);
    }
}

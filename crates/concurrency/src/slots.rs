use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    thiserror::Error,
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

/// Which entity a slot counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    User,
    Account,
}

impl Scope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Account => "account",
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a slot")]
    Timeout,
    #[error("too many callers already waiting")]
    QueueFull,
    #[error("request cancelled while waiting")]
    Cancelled,
    #[error("slot store unavailable: {0}")]
    Store(String),
}

/// Atomic slot counters keyed by `slot:{scope}:{id}`, with wait counters
/// keyed by `wait:{scope}:{id}`.
///
/// The contract all implementations honor:
/// - `try_acquire` is atomic and never blocks.
/// - a release observed at time T makes the slot available to some waiter
///   by T + ε.
/// - counters stay within `0 ≤ counter ≤ max` and `0 ≤ wait ≤ wait_max`.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Take a slot if one is free. Returns false when the counter is at max.
    fn try_acquire(&self, scope: Scope, key: &str, max: u32) -> Result<bool, AcquireError>;

    /// Wait until a slot frees up, the timeout elapses, or `cancel` fires.
    async fn acquire_with_wait(
        &self,
        scope: Scope,
        key: &str,
        max: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError>;

    /// Admission-side gate: returns false when `max_wait` callers are
    /// already queued for the key.
    fn increment_wait(&self, scope: Scope, key: &str, max_wait: u32) -> Result<bool, AcquireError>;

    fn decrement_wait(&self, scope: Scope, key: &str);

    /// Return a previously acquired slot. Callers go through [`SlotPermit`],
    /// which guarantees the release happens exactly once.
    fn release(&self, scope: Scope, key: &str);

    /// Current held-slot count for the key; 0 when the key is unknown.
    fn current(&self, scope: Scope, key: &str) -> u32;
}

/// A held slot. Releasing is idempotent and also fires on drop, so a
/// permit registered into a request cannot leak on any exit path,
/// cancellation included.
pub struct SlotPermit {
    store: Arc<dyn SlotStore>,
    scope: Scope,
    key: String,
    released: AtomicBool,
}

impl SlotPermit {
    #[must_use]
    pub fn new(store: Arc<dyn SlotStore>, scope: Scope, key: impl Into<String>) -> Self {
        Self {
            store,
            scope,
            key: key.into(),
            released: AtomicBool::new(false),
        }
    }

    /// Release the slot now. A second call is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.store.release(self.scope, &self.key);
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("scope", &self.scope.as_str())
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

struct SlotState {
    count: AtomicU32,
    freed: Notify,
}

impl SlotState {
    fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            freed: Notify::new(),
        }
    }
}

/// Process-local [`SlotStore`] over atomics, with `Notify`-based wakeups.
///
/// Slot counters live under `slot:{scope}:{id}` and wait counters under
/// `wait:{scope}:{id}`, matching the layout a networked store would use.
/// Waiters are served in roughly FIFO order; strict fairness is not
/// promised and starvation is bounded by the wait gate.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: DashMap<String, Arc<SlotState>>,
    waits: DashMap<String, Arc<AtomicU32>>,
}

impl MemorySlotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, scope: Scope, key: &str) -> Arc<SlotState> {
        let full = format!("slot:{}:{key}", scope.as_str());
        Arc::clone(
            &self
                .slots
                .entry(full)
                .or_insert_with(|| Arc::new(SlotState::new())),
        )
    }

    fn peek(&self, scope: Scope, key: &str) -> Option<Arc<SlotState>> {
        let full = format!("slot:{}:{key}", scope.as_str());
        self.slots.get(&full).map(|e| Arc::clone(&e))
    }

    fn wait_state(&self, scope: Scope, key: &str) -> Arc<AtomicU32> {
        let full = format!("wait:{}:{key}", scope.as_str());
        Arc::clone(
            &self
                .waits
                .entry(full)
                .or_insert_with(|| Arc::new(AtomicU32::new(0))),
        )
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    fn try_acquire(&self, scope: Scope, key: &str, max: u32) -> Result<bool, AcquireError> {
        let state = self.state(scope, key);
        let mut current = state.count.load(Ordering::Acquire);
        loop {
            if current >= max {
                return Ok(false);
            }
            match state.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(observed) => current = observed,
            }
        }
    }

    async fn acquire_with_wait(
        &self,
        scope: Scope,
        key: &str,
        max: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let state = self.state(scope, key);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeup before probing so a release between the
            // probe and the await is not lost.
            let freed = state.freed.notified();
            if self.try_acquire(scope, key, max)? {
                return Ok(());
            }
            tokio::select! {
                () = freed => {},
                () = tokio::time::sleep_until(deadline) => return Err(AcquireError::Timeout),
                () = cancel.cancelled() => return Err(AcquireError::Cancelled),
            }
        }
    }

    fn increment_wait(&self, scope: Scope, key: &str, max_wait: u32) -> Result<bool, AcquireError> {
        let waiting = self.wait_state(scope, key);
        let mut current = waiting.load(Ordering::Acquire);
        loop {
            if current >= max_wait {
                return Ok(false);
            }
            match waiting.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(observed) => current = observed,
            }
        }
    }

    fn decrement_wait(&self, scope: Scope, key: &str) {
        let waiting = self.wait_state(scope, key);
        let mut current = waiting.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(scope = scope.as_str(), key, "wait counter underflow ignored");
                return;
            }
            match waiting.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, scope: Scope, key: &str) {
        let Some(state) = self.peek(scope, key) else {
            warn!(scope = scope.as_str(), key, "release for unknown slot key");
            return;
        };
        let mut current = state.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(scope = scope.as_str(), key, "slot counter underflow ignored");
                return;
            }
            match state.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        state.freed.notify_waiters();
    }

    fn current(&self, scope: Scope, key: &str) -> u32 {
        self.peek(scope, key)
            .map(|s| s.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<MemorySlotStore> {
        Arc::new(MemorySlotStore::new())
    }

    #[test]
    fn try_acquire_respects_max() {
        let s = store();
        assert!(s.try_acquire(Scope::User, "u1", 2).unwrap());
        assert!(s.try_acquire(Scope::User, "u1", 2).unwrap());
        assert!(!s.try_acquire(Scope::User, "u1", 2).unwrap());
        assert_eq!(s.current(Scope::User, "u1"), 2);
    }

    #[test]
    fn scopes_do_not_collide() {
        let s = store();
        assert!(s.try_acquire(Scope::User, "x", 1).unwrap());
        assert!(s.try_acquire(Scope::Account, "x", 1).unwrap());
        assert_eq!(s.current(Scope::User, "x"), 1);
        assert_eq!(s.current(Scope::Account, "x"), 1);
    }

    #[test]
    fn release_frees_a_slot() {
        let s = store();
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());
        s.release(Scope::Account, "a");
        assert_eq!(s.current(Scope::Account, "a"), 0);
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());
    }

    #[test]
    fn release_never_underflows() {
        let s = store();
        s.release(Scope::Account, "a");
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());
        s.release(Scope::Account, "a");
        s.release(Scope::Account, "a");
        assert_eq!(s.current(Scope::Account, "a"), 0);
    }

    #[test]
    fn permit_release_is_idempotent() {
        let s = store();
        assert!(s.try_acquire(Scope::User, "u", 1).unwrap());
        let permit = SlotPermit::new(s.clone(), Scope::User, "u");
        permit.release();
        permit.release();
        drop(permit);
        assert_eq!(s.current(Scope::User, "u"), 0);
    }

    #[test]
    fn permit_drop_releases() {
        let s = store();
        assert!(s.try_acquire(Scope::User, "u", 1).unwrap());
        {
            let _permit = SlotPermit::new(s.clone(), Scope::User, "u");
        }
        assert_eq!(s.current(Scope::User, "u"), 0);
    }

    #[test]
    fn wait_gate_bounds_queue() {
        let s = store();
        assert!(s.increment_wait(Scope::User, "u", 2).unwrap());
        assert!(s.increment_wait(Scope::User, "u", 2).unwrap());
        assert!(!s.increment_wait(Scope::User, "u", 2).unwrap());
        s.decrement_wait(Scope::User, "u");
        assert!(s.increment_wait(Scope::User, "u", 2).unwrap());
    }

    #[tokio::test]
    async fn waiter_is_woken_by_release() {
        let s = store();
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());

        let s2 = Arc::clone(&s);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            s2.acquire_with_wait(
                Scope::Account,
                "a",
                1,
                Duration::from_secs(5),
                &cancel,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        s.release(Scope::Account, "a");

        waiter.await.unwrap().unwrap();
        assert_eq!(s.current(Scope::Account, "a"), 1);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let s = store();
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());
        let cancel = CancellationToken::new();
        let err = s
            .acquire_with_wait(
                Scope::Account,
                "a",
                1,
                Duration::from_millis(30),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Timeout));
        assert_eq!(s.current(Scope::Account, "a"), 1);
    }

    #[tokio::test]
    async fn cancellation_unwinds_cleanly() {
        let s = store();
        assert!(s.try_acquire(Scope::Account, "a", 1).unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = s
            .acquire_with_wait(Scope::Account, "a", 1, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Cancelled));
        // The counter is exactly as if the wait never happened.
        assert_eq!(s.current(Scope::Account, "a"), 1);
    }

    #[tokio::test]
    async fn contended_acquires_all_pair_with_releases() {
        let s = store();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                s.acquire_with_wait(Scope::Account, "a", 4, Duration::from_secs(5), &cancel)
                    .await
                    .unwrap();
                assert!(s.current(Scope::Account, "a") <= 4);
                tokio::time::sleep(Duration::from_millis(5)).await;
                s.release(Scope::Account, "a");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(s.current(Scope::Account, "a"), 0);
    }
}

use std::time::{Duration, Instant};

use {dashmap::DashMap, tracing::debug};

/// TTL'd mapping from session fingerprints (and previous-response ids) to
/// account ids.
///
/// A binding only constrains selection; it never extends an account's
/// schedulability window. Fingerprints are opaque byte strings.
pub trait StickyStore: Send + Sync {
    /// Idempotent overwrite; refreshes the TTL.
    fn bind(&self, group: &str, fingerprint: &str, account_id: &str, ttl: Duration);

    fn lookup(&self, group: &str, fingerprint: &str) -> Option<String>;

    /// Refresh the TTL of an existing binding. Returns false on miss.
    fn refresh_ttl(&self, group: &str, fingerprint: &str, ttl: Duration) -> bool;

    fn unbind(&self, group: &str, fingerprint: &str);

    /// Index a server-issued response id to the account that produced it,
    /// for previous-response affinity.
    fn bind_response(&self, response_id: &str, account_id: &str, ttl: Duration);

    fn lookup_response(&self, response_id: &str) -> Option<String>;

    /// Drop expired entries; returns how many were removed.
    fn sweep(&self) -> usize;
}

struct Binding {
    account_id: String,
    expires_at: Instant,
}

/// Process-local [`StickyStore`] with lazy expiry on read plus an explicit
/// sweep for the background task.
#[derive(Default)]
pub struct MemoryStickyStore {
    entries: DashMap<String, Binding>,
}

fn session_key(group: &str, fingerprint: &str) -> String {
    format!("sticky:{group}:{fingerprint}")
}

fn response_key(response_id: &str) -> String {
    format!("resp:{response_id}")
}

impl MemoryStickyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: String, account_id: &str, ttl: Duration) {
        self.entries.insert(key, Binding {
            account_id: account_id.to_string(),
            expires_at: Instant::now() + ttl,
        });
    }

    fn live_lookup(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.account_id.clone());
            }
        } else {
            return None;
        }
        // Expired: drop it so the map does not accumulate dead sessions.
        self.entries.remove(key);
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StickyStore for MemoryStickyStore {
    fn bind(&self, group: &str, fingerprint: &str, account_id: &str, ttl: Duration) {
        self.insert(session_key(group, fingerprint), account_id, ttl);
    }

    fn lookup(&self, group: &str, fingerprint: &str) -> Option<String> {
        self.live_lookup(&session_key(group, fingerprint))
    }

    fn refresh_ttl(&self, group: &str, fingerprint: &str, ttl: Duration) -> bool {
        let key = session_key(group, fingerprint);
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(&key)
            && entry.expires_at > now
        {
            entry.expires_at = now + ttl;
            return true;
        }
        false
    }

    fn unbind(&self, group: &str, fingerprint: &str) {
        if self.entries.remove(&session_key(group, fingerprint)).is_some() {
            debug!(group, fingerprint, "sticky binding removed");
        }
    }

    fn bind_response(&self, response_id: &str, account_id: &str, ttl: Duration) {
        self.insert(response_key(response_id), account_id, ttl);
    }

    fn lookup_response(&self, response_id: &str) -> Option<String> {
        self.live_lookup(&response_key(response_id))
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, binding| binding.expires_at > now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn bind_then_lookup() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", TTL);
        assert_eq!(store.lookup("g1", "fp-a").as_deref(), Some("acct-1"));
        assert_eq!(store.lookup("g2", "fp-a"), None);
    }

    #[test]
    fn bind_overwrites_existing() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", TTL);
        store.bind("g1", "fp-a", "acct-2", TTL);
        assert_eq!(store.lookup("g1", "fp-a").as_deref(), Some("acct-2"));
    }

    #[test]
    fn expired_binding_is_a_miss() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", Duration::ZERO);
        assert_eq!(store.lookup("g1", "fp-a"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn refresh_extends_live_bindings_only() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", TTL);
        assert!(store.refresh_ttl("g1", "fp-a", TTL));
        assert!(!store.refresh_ttl("g1", "fp-missing", TTL));

        store.bind("g1", "fp-b", "acct-1", Duration::ZERO);
        assert!(!store.refresh_ttl("g1", "fp-b", TTL));
    }

    #[test]
    fn unbind_removes_binding() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", TTL);
        store.unbind("g1", "fp-a");
        assert_eq!(store.lookup("g1", "fp-a"), None);
    }

    #[test]
    fn response_index_is_separate_namespace() {
        let store = MemoryStickyStore::new();
        store.bind_response("resp_123", "acct-1", TTL);
        assert_eq!(store.lookup_response("resp_123").as_deref(), Some("acct-1"));
        assert_eq!(store.lookup("", "resp_123"), None);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let store = MemoryStickyStore::new();
        store.bind("g1", "fp-a", "acct-1", Duration::ZERO);
        store.bind("g1", "fp-b", "acct-2", TTL);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use {
    ferry_accounts::{Account, Platform},
    ferry_config::schema::{OpenAiHttp2Config, PoolConfig, PoolIsolation},
};

use crate::{
    error::UpstreamError,
    fallback::Http2FallbackTracker,
    proxy::{self, DIRECT_KEY},
};

/// Protocol profile a pooled client was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Default,
    OpenAiHttp2,
    OpenAiHttp1Fallback,
}

impl Profile {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::OpenAiHttp2 => "openai-http2",
            Self::OpenAiHttp1Fallback => "openai-http1-fallback",
        }
    }
}

#[derive(Debug)]
struct ClientEntry {
    client: reqwest::Client,
    profile: Profile,
    proxy_key: String,
    /// Raw proxy URL the entry was built with; per-account keys use it to
    /// detect a proxy change that must invalidate the entry.
    raw_proxy: Option<String>,
    in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl ClientEntry {
    fn touch(&self) {
        let mut guard = self
            .last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self
            .last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out client. Holding a lease keeps the entry's in-flight count
/// non-zero, which protects it from eviction.
#[derive(Debug)]
pub struct ClientLease {
    entry: Arc<ClientEntry>,
}

impl ClientLease {
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.entry.client
    }

    #[must_use]
    pub fn profile(&self) -> Profile {
        self.entry.profile
    }

    #[must_use]
    pub fn proxy_key(&self) -> &str {
        &self.entry.proxy_key
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.entry.touch();
    }
}

/// Cache of upstream clients keyed by the configured isolation policy.
///
/// The map sits behind one mutex; entry counters are atomics, so leases
/// are dropped without touching the lock.
pub struct ClientPool {
    entries: Mutex<HashMap<String, Arc<ClientEntry>>>,
    cfg: PoolConfig,
    h2: OpenAiHttp2Config,
    response_header_timeout: Duration,
    fallback: Http2FallbackTracker,
}

impl ClientPool {
    #[must_use]
    pub fn new(cfg: PoolConfig, h2: OpenAiHttp2Config, response_header_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fallback: Http2FallbackTracker::new(&h2),
            cfg,
            h2,
            response_header_timeout,
        }
    }

    /// Check out a client for the account, building and caching one if
    /// needed. Fails hard when the cache is full and nothing is evictable.
    pub fn acquire(&self, account: &Account) -> Result<ClientLease, UpstreamError> {
        let (raw_proxy, proxy_key) = self.resolve_proxy(account)?;
        let profile = self.profile_for(account, &proxy_key);
        let key = match self.cfg.connection_pool_isolation {
            PoolIsolation::Account => format!("acct:{}", account.id),
            PoolIsolation::AccountProxy => format!("acct:{}|{proxy_key}", account.id),
            PoolIsolation::Proxy => format!("proxy:{proxy_key}"),
        };

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.sweep_idle(&mut entries);

        if let Some(existing) = entries.get(&key) {
            let stale = existing.profile != profile || existing.raw_proxy != account.proxy;
            if !stale {
                return Ok(Self::lease(Arc::clone(existing)));
            }
            // Proxy or protocol changed under the key; in-flight leases keep
            // the old entry alive through their Arc.
            debug!(key, old_profile = existing.profile.as_str(), "invalidating pooled client");
            entries.remove(&key);
        }

        if entries.len() >= self.cfg.max_upstream_clients && !Self::evict_lru(&mut entries) {
            return Err(UpstreamError::PoolExhausted);
        }

        let entry = Arc::new(self.build_entry(account, raw_proxy, proxy_key, profile)?);
        entries.insert(key, Arc::clone(&entry));
        Ok(Self::lease(entry))
    }

    /// Report an HTTP/2-specific transport failure observed through the
    /// lease. Returns true when the proxy just entered fallback.
    pub fn record_http2_error(&self, lease: &ClientLease) -> bool {
        if lease.profile() != Profile::OpenAiHttp2 {
            return false;
        }
        self.fallback.record_error(lease.proxy_key())
    }

    /// Report a successful request through the lease; resets the proxy's
    /// error window for openai-profile clients.
    pub fn record_success(&self, lease: &ClientLease) {
        if matches!(
            lease.profile(),
            Profile::OpenAiHttp2 | Profile::OpenAiHttp1Fallback
        ) {
            self.fallback.record_success(lease.proxy_key());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease(entry: Arc<ClientEntry>) -> ClientLease {
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        entry.touch();
        ClientLease { entry }
    }

    fn resolve_proxy(&self, account: &Account) -> Result<(Option<String>, String), UpstreamError> {
        let Some(raw) = &account.proxy else {
            return Ok((None, DIRECT_KEY.to_string()));
        };
        match proxy::normalize_proxy_key(raw) {
            Ok(key) => Ok((Some(raw.clone()), key)),
            Err(err) if self.cfg.allow_proxy_bypass => {
                warn!(account_id = %account.id, error = %err, "proxy bypassed by operator opt-in");
                Ok((None, DIRECT_KEY.to_string()))
            },
            Err(err) => Err(err),
        }
    }

    fn profile_for(&self, account: &Account, proxy_key: &str) -> Profile {
        if account.platform != Platform::OpenAi || !self.h2.enabled {
            return Profile::Default;
        }
        if self.h2.allow_fallback_to_http1 && self.fallback.is_fallback(proxy_key) {
            Profile::OpenAiHttp1Fallback
        } else {
            Profile::OpenAiHttp2
        }
    }

    fn build_entry(
        &self,
        account: &Account,
        raw_proxy: Option<String>,
        proxy_key: String,
        profile: Profile,
    ) -> Result<ClientEntry, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(self.response_header_timeout)
            .pool_max_idle_per_host(account.max_concurrency.max(1) as usize);

        if let Some(raw) = &raw_proxy {
            builder = builder.proxy(proxy::build_proxy(raw)?);
        }
        if profile == Profile::OpenAiHttp1Fallback {
            // ALPN is pinned to http/1.1, which also empties the HTTP/2
            // upgrade path.
            builder = builder.http1_only();
        }

        let client = builder.build().map_err(UpstreamError::Build)?;
        Ok(ClientEntry {
            client,
            profile,
            proxy_key,
            raw_proxy,
            in_flight: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        })
    }

    fn sweep_idle(&self, entries: &mut HashMap<String, Arc<ClientEntry>>) {
        let ttl = Duration::from_secs(self.cfg.client_idle_ttl_seconds);
        entries.retain(|_, entry| {
            entry.in_flight.load(Ordering::Acquire) > 0 || entry.last_used().elapsed() <= ttl
        });
    }

    /// Evict the least-recently-used idle entry. Entries with in-flight
    /// requests are never evicted.
    fn evict_lru(entries: &mut HashMap<String, Arc<ClientEntry>>) -> bool {
        let victim = entries
            .iter()
            .filter(|(_, entry)| entry.in_flight.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, entry)| entry.last_used())
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                debug!(key, "evicting idle pooled client");
                entries.remove(&key);
                true
            },
            None => false,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use ferry_config::schema::AccountEntry;

    fn account(id: &str, proxy: Option<&str>) -> Account {
        Account::from_entry(
            &AccountEntry {
                id: id.into(),
                api_key: "sk".into(),
                base_url: "https://upstream.example".into(),
                proxy: proxy.map(String::from),
                ..AccountEntry::default()
            },
            8,
        )
    }

    fn pool(max_clients: usize) -> ClientPool {
        ClientPool::new(
            PoolConfig {
                max_upstream_clients: max_clients,
                ..PoolConfig::default()
            },
            OpenAiHttp2Config::default(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn same_account_reuses_the_entry() {
        let pool = pool(4);
        let a = account("a", None);
        let lease1 = pool.acquire(&a).unwrap();
        drop(lease1);
        let _lease2 = pool.acquire(&a).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn openai_accounts_get_the_http2_profile() {
        let pool = pool(4);
        let lease = pool.acquire(&account("a", None)).unwrap();
        assert_eq!(lease.profile(), Profile::OpenAiHttp2);
    }

    #[tokio::test]
    async fn fallback_mark_switches_profile() {
        let pool = ClientPool::new(
            PoolConfig::default(),
            OpenAiHttp2Config {
                fallback_error_threshold: 1,
                ..OpenAiHttp2Config::default()
            },
            Duration::from_secs(30),
        );
        let a = account("a", None);
        let lease = pool.acquire(&a).unwrap();
        assert!(pool.record_http2_error(&lease));
        drop(lease);

        let lease = pool.acquire(&a).unwrap();
        assert_eq!(lease.profile(), Profile::OpenAiHttp1Fallback);
    }

    #[tokio::test]
    async fn in_flight_entries_are_never_evicted() {
        let pool = pool(1);
        let a = account("a", None);
        let held = pool.acquire(&a).unwrap();

        let err = pool.acquire(&account("b", None)).unwrap_err();
        assert!(matches!(err, UpstreamError::PoolExhausted));

        drop(held);
        pool.acquire(&account("b", None)).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn proxy_change_invalidates_per_account_entry() {
        let pool = pool(4);
        let lease = pool.acquire(&account("a", None)).unwrap();
        assert_eq!(lease.proxy_key(), DIRECT_KEY);
        drop(lease);

        let lease = pool
            .acquire(&account("a", Some("http://proxy.example:3128")))
            .unwrap();
        assert_eq!(lease.proxy_key(), "http://proxy.example:3128");
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn bad_proxy_fails_without_bypass() {
        let pool = pool(4);
        let err = pool
            .acquire(&account("a", Some("socks5://proxy.example:1080")))
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ProxyScheme { .. }));
    }

    #[tokio::test]
    async fn bad_proxy_is_skipped_with_bypass_opt_in() {
        let pool = ClientPool::new(
            PoolConfig {
                allow_proxy_bypass: true,
                ..PoolConfig::default()
            },
            OpenAiHttp2Config::default(),
            Duration::from_secs(30),
        );
        let lease = pool
            .acquire(&account("a", Some("socks5://proxy.example:1080")))
            .unwrap();
        assert_eq!(lease.proxy_key(), DIRECT_KEY);
    }
}

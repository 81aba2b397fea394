use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use {sha2::{Digest, Sha256}, tokio_util::sync::CancellationToken};

use crate::validate::ValidatedRequest;

/// How the request reached the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Ws,
    AsyncJob,
}

impl Transport {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
            Self::AsyncJob => "async_job",
        }
    }
}

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub api_key_id: String,
    pub group: Option<String>,
    pub max_concurrency: u32,
}

/// Set-once phase timers, shared with the relay task so latency fields
/// survive into the final log line.
#[derive(Debug)]
pub struct PhaseTimings {
    started: Instant,
    auth_ms: AtomicU64,
    routing_ms: AtomicU64,
    upstream_ms: AtomicU64,
    response_ms: AtomicU64,
    first_token_ms: AtomicU64,
}

impl PhaseTimings {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            auth_ms: AtomicU64::new(0),
            routing_ms: AtomicU64::new(0),
            upstream_ms: AtomicU64::new(0),
            response_ms: AtomicU64::new(0),
            first_token_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn mark_auth(&self) {
        self.auth_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    pub fn mark_routing(&self) {
        self.routing_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    pub fn mark_upstream(&self) {
        self.upstream_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    pub fn mark_response(&self) {
        self.response_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    /// Records time-to-first-token once; later calls are ignored.
    pub fn mark_first_token(&self) {
        let _ = self.first_token_ms.compare_exchange(
            0,
            self.elapsed_ms().max(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[must_use]
    pub fn auth_ms(&self) -> u64 {
        self.auth_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn routing_ms(&self) -> u64 {
        self.routing_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn upstream_ms(&self) -> u64 {
        self.upstream_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn response_ms(&self) -> u64 {
        self.response_ms.load(Ordering::Acquire)
    }

    /// 0 means no token was streamed.
    #[must_use]
    pub fn first_token_ms(&self) -> u64 {
        self.first_token_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn first_token(&self) -> Option<std::time::Duration> {
        match self.first_token_ms() {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }
}

/// Per-request envelope created at handler entry and destroyed at the
/// final response (or WS close).
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub caller: Caller,
    pub model: String,
    pub stream: bool,
    pub transport: Transport,
    pub previous_response_id: Option<String>,
    pub fingerprint: Option<String>,
    /// Accounts that already failed for this request.
    pub blacklist: HashSet<String>,
    /// Flipped by the relay when the first streaming byte is written; the
    /// single source of truth for error shape.
    pub stream_started: Arc<AtomicBool>,
    pub cancel: CancellationToken,
    pub timings: Arc<PhaseTimings>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        request_id: String,
        caller: Caller,
        validated: &ValidatedRequest,
        transport: Transport,
        fingerprint: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            caller,
            model: validated.model.clone(),
            stream: validated.stream,
            transport,
            previous_response_id: validated.previous_response_id.clone(),
            fingerprint,
            blacklist: HashSet::new(),
            stream_started: Arc::new(AtomicBool::new(false)),
            cancel,
            timings: Arc::new(PhaseTimings::start()),
        }
    }

    #[must_use]
    pub fn stream_started(&self) -> bool {
        self.stream_started.load(Ordering::Acquire)
    }
}

/// Derive the session fingerprint for affinity.
///
/// Precedence: the caller-supplied session header, then a stable hash of
/// the upstream cache key, then (for WS) a seed from the caller identity.
/// Fingerprints are opaque; only equality matters.
#[must_use]
pub fn derive_fingerprint(
    session_header: Option<&str>,
    prompt_cache_key: Option<&str>,
    caller_seed: Option<&Caller>,
) -> Option<String> {
    if let Some(header) = session_header
        && !header.is_empty()
    {
        return Some(header.to_string());
    }
    if let Some(cache_key) = prompt_cache_key
        && !cache_key.is_empty()
    {
        return Some(stable_hash(&["pck", cache_key]));
    }
    caller_seed.map(|caller| {
        stable_hash(&[
            "caller",
            &caller.user_id,
            &caller.api_key_id,
            caller.group.as_deref().unwrap_or("-"),
        ])
    })
}

fn stable_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> Caller {
        Caller {
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            group: Some("team".into()),
            max_concurrency: 4,
        }
    }

    #[test]
    fn header_wins_over_cache_key() {
        let fp = derive_fingerprint(Some("sess-1"), Some("cache-1"), None);
        assert_eq!(fp.as_deref(), Some("sess-1"));
    }

    #[test]
    fn cache_key_hash_is_stable_and_distinct() {
        let a = derive_fingerprint(None, Some("cache-1"), None).unwrap();
        let b = derive_fingerprint(None, Some("cache-1"), None).unwrap();
        let c = derive_fingerprint(None, Some("cache-2"), None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn caller_seed_is_last_resort() {
        let c = caller();
        let fp = derive_fingerprint(None, None, Some(&c)).unwrap();
        assert_eq!(fp.len(), 32);
        assert_eq!(fp, derive_fingerprint(None, None, Some(&c)).unwrap());
    }

    #[test]
    fn no_inputs_means_no_fingerprint() {
        assert_eq!(derive_fingerprint(None, None, None), None);
    }

    #[test]
    fn first_token_is_recorded_once() {
        let timings = PhaseTimings::start();
        timings.mark_first_token();
        let first = timings.first_token_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        timings.mark_first_token();
        assert_eq!(timings.first_token_ms(), first);
        assert!(first >= 1);
    }
}

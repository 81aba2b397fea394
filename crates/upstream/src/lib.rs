//! Upstream HTTP client pooling.
//!
//! Clients are cached per isolation key (account, account+proxy, or proxy),
//! capped with LRU eviction that never evicts an in-flight client, and
//! tagged with a protocol profile. The openai profile tracks per-proxy
//! HTTP/2 error windows and downgrades a misbehaving proxy to HTTP/1.1 for
//! a TTL.

pub mod error;
pub mod fallback;
pub mod pool;
pub mod proxy;

pub use {
    error::UpstreamError,
    fallback::{Http2FallbackTracker, is_http2_error},
    pool::{ClientLease, ClientPool, Profile},
    proxy::normalize_proxy_key,
};

use std::time::{Duration, Instant};

use {dashmap::DashMap, tracing::warn};

use ferry_config::schema::OpenAiHttp2Config;

struct ProxyWindow {
    errors: u32,
    window_started: Instant,
    fallback_until: Option<Instant>,
}

/// Per-proxy HTTP/2 error windows for the openai protocol profile.
///
/// Reaching the error threshold within the window marks the proxy
/// "fallback" for a TTL; clients built against it then force HTTP/1.1.
/// A success resets the error window but the fallback mark outlives it
/// until the TTL expires.
pub struct Http2FallbackTracker {
    windows: DashMap<String, ProxyWindow>,
    threshold: u32,
    window: Duration,
    ttl: Duration,
}

impl Http2FallbackTracker {
    #[must_use]
    pub fn new(cfg: &OpenAiHttp2Config) -> Self {
        Self {
            windows: DashMap::new(),
            threshold: cfg.fallback_error_threshold.max(1),
            window: Duration::from_secs(cfg.fallback_window_seconds),
            ttl: Duration::from_secs(cfg.fallback_ttl_seconds),
        }
    }

    /// Record an HTTP/2-specific error against the proxy. Returns true when
    /// this error pushed the proxy into fallback.
    pub fn record_error(&self, proxy_key: &str) -> bool {
        self.record_error_at(proxy_key, Instant::now())
    }

    fn record_error_at(&self, proxy_key: &str, now: Instant) -> bool {
        let mut entry = self
            .windows
            .entry(proxy_key.to_string())
            .or_insert_with(|| ProxyWindow {
                errors: 0,
                window_started: now,
                fallback_until: None,
            });

        if now.duration_since(entry.window_started) >= self.window {
            entry.window_started = now;
            entry.errors = 0;
        }
        entry.errors += 1;

        let already_falling_back = entry.fallback_until.is_some_and(|until| until > now);
        if entry.errors >= self.threshold && !already_falling_back {
            entry.fallback_until = Some(now + self.ttl);
            entry.errors = 0;
            warn!(proxy = proxy_key, ttl_secs = self.ttl.as_secs(), "http/2 disabled for proxy");
            return true;
        }
        false
    }

    /// Record a successful request through the proxy: the error window is
    /// reset; an active fallback mark is left to expire on its own.
    pub fn record_success(&self, proxy_key: &str) {
        self.record_success_at(proxy_key, Instant::now());
    }

    fn record_success_at(&self, proxy_key: &str, now: Instant) {
        if let Some(mut entry) = self.windows.get_mut(proxy_key) {
            entry.errors = 0;
            entry.window_started = now;
        }
    }

    #[must_use]
    pub fn is_fallback(&self, proxy_key: &str) -> bool {
        self.is_fallback_at(proxy_key, Instant::now())
    }

    fn is_fallback_at(&self, proxy_key: &str, now: Instant) -> bool {
        self.windows
            .get(proxy_key)
            .and_then(|entry| entry.fallback_until)
            .is_some_and(|until| until > now)
    }
}

/// Whether a reqwest error looks like an HTTP/2 transport failure rather
/// than a general connection problem.
#[must_use]
pub fn is_http2_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if message_indicates_http2(&current.to_string()) {
            return true;
        }
        source = current.source();
    }
    false
}

fn message_indicates_http2(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("http2")
        || lower.contains("h2 protocol")
        || lower.contains("goaway")
        || lower.contains("refused_stream")
        || lower.contains("frame size")
        || (lower.contains("stream") && lower.contains("reset"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32, window_secs: u64, ttl_secs: u64) -> OpenAiHttp2Config {
        OpenAiHttp2Config {
            enabled: true,
            allow_fallback_to_http1: true,
            fallback_error_threshold: threshold,
            fallback_window_seconds: window_secs,
            fallback_ttl_seconds: ttl_secs,
        }
    }

    #[test]
    fn threshold_within_window_activates_fallback() {
        let tracker = Http2FallbackTracker::new(&cfg(2, 60, 600));
        let now = Instant::now();
        assert!(!tracker.record_error_at("p", now));
        assert!(tracker.record_error_at("p", now + Duration::from_secs(1)));
        assert!(tracker.is_fallback_at("p", now + Duration::from_secs(2)));
    }

    #[test]
    fn errors_outside_the_window_do_not_accumulate() {
        let tracker = Http2FallbackTracker::new(&cfg(2, 10, 600));
        let now = Instant::now();
        assert!(!tracker.record_error_at("p", now));
        // Window expired: the counter restarts.
        assert!(!tracker.record_error_at("p", now + Duration::from_secs(11)));
        assert!(!tracker.is_fallback_at("p", now + Duration::from_secs(12)));
    }

    #[test]
    fn success_resets_window_but_fallback_persists() {
        let tracker = Http2FallbackTracker::new(&cfg(2, 60, 600));
        let now = Instant::now();
        tracker.record_error_at("p", now);
        tracker.record_error_at("p", now);
        assert!(tracker.is_fallback_at("p", now + Duration::from_secs(1)));

        tracker.record_success_at("p", now + Duration::from_secs(2));
        // Fallback mode persists until the TTL expires.
        assert!(tracker.is_fallback_at("p", now + Duration::from_secs(3)));
    }

    #[test]
    fn fallback_expires_after_ttl() {
        let tracker = Http2FallbackTracker::new(&cfg(1, 60, 5));
        let now = Instant::now();
        tracker.record_error_at("p", now);
        assert!(tracker.is_fallback_at("p", now + Duration::from_secs(4)));
        assert!(!tracker.is_fallback_at("p", now + Duration::from_secs(6)));
    }

    #[test]
    fn proxies_are_tracked_independently() {
        let tracker = Http2FallbackTracker::new(&cfg(1, 60, 600));
        tracker.record_error("p1");
        assert!(tracker.is_fallback("p1"));
        assert!(!tracker.is_fallback("p2"));
    }

    #[test]
    fn http2_message_detection() {
        assert!(message_indicates_http2("http2 error: connection error"));
        assert!(message_indicates_http2("h2 protocol error: unexpected frame"));
        assert!(message_indicates_http2("stream was reset: REFUSED_STREAM"));
        assert!(message_indicates_http2("connection closed: GOAWAY received"));
        assert!(!message_indicates_http2("connection refused"));
        assert!(!message_indicates_http2("dns error"));
    }
}

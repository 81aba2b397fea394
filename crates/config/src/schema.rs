//! Config schema types (server, dispatch, pooling, usage recording,
//! concurrency, accounts, API keys).

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub pool: PoolConfig,
    pub openai_http2: OpenAiHttp2Config,
    pub usage_record: UsageRecordConfig,
    pub concurrency: ConcurrencyConfig,
    /// Passthrough rules consulted by the error classifier after failover
    /// is exhausted.
    pub passthrough: Vec<PassthroughRule>,
    /// Upstream accounts. A database-backed registry can replace this table;
    /// the gateway only sees the `AccountSource` trait.
    pub accounts: Vec<AccountEntry>,
    /// End-user API keys. Credential issuance is owned elsewhere; this table
    /// is the minimal static keyring the dispatcher needs.
    pub api_keys: Vec<ApiKeyEntry>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Request bodies above this size are rejected with 413.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8790,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of account switches after the first attempt.
    pub max_account_switches: u32,
    /// Deadline for the upstream to produce response headers.
    pub response_header_timeout_seconds: u64,
    /// Platform used to filter candidates for callers without a group.
    pub forced_platform: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_account_switches: 3,
            response_header_timeout_seconds: 60,
            forced_platform: None,
        }
    }
}

/// How upstream HTTP clients are keyed in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolIsolation {
    Account,
    AccountProxy,
    Proxy,
}

/// Upstream client pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connection_pool_isolation: PoolIsolation,
    pub max_upstream_clients: usize,
    pub client_idle_ttl_seconds: u64,
    /// Fallback concurrency for accounts that do not declare their own.
    pub default_account_concurrency: u32,
    /// When true, a proxy URL that fails to parse is skipped instead of
    /// failing the request.
    pub allow_proxy_bypass: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_pool_isolation: PoolIsolation::Account,
            max_upstream_clients: 128,
            client_idle_ttl_seconds: 300,
            default_account_concurrency: 8,
            allow_proxy_bypass: false,
        }
    }
}

/// HTTP/2 usage and HTTP/1.1 fallback for the openai protocol profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiHttp2Config {
    pub enabled: bool,
    pub allow_fallback_to_http1: bool,
    /// HTTP/2-specific errors within the window before the proxy is
    /// downgraded.
    pub fallback_error_threshold: u32,
    pub fallback_window_seconds: u64,
    pub fallback_ttl_seconds: u64,
}

impl Default for OpenAiHttp2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_fallback_to_http1: true,
            fallback_error_threshold: 3,
            fallback_window_seconds: 60,
            fallback_ttl_seconds: 600,
        }
    }
}

/// Overflow behavior for the usage-record pool queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Drop,
    SampleDrop,
}

/// Usage-record worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageRecordConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    /// Per-task deadline, clamped to 1–10 seconds.
    pub task_timeout_seconds: u64,
    pub overflow_policy: OverflowPolicy,
}

impl UsageRecordConfig {
    /// The configured task timeout, clamped to the supported range.
    #[must_use]
    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_seconds.clamp(1, 10))
    }
}

impl Default for UsageRecordConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 1024,
            task_timeout_seconds: 5,
            overflow_policy: OverflowPolicy::Drop,
        }
    }
}

/// Slot, wait-queue and sticky-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Keepalive interval for idle streaming responses.
    pub ping_interval_seconds: u64,
    /// Raw bytes written as an SSE keepalive; must be a comment or event the
    /// client ignores.
    pub sse_ping_format: String,
    /// Default per-user concurrency for API keys without their own limit.
    pub default_user_concurrency: u32,
    /// Callers queued per user key before new arrivals are rejected.
    pub user_wait_max: u32,
    pub user_wait_timeout_seconds: u64,
    /// Callers queued per account key before new arrivals are rejected.
    pub account_wait_max: u32,
    pub account_wait_timeout_seconds: u64,
    pub sticky_ttl_seconds: u64,
    /// Load-ranked selection keeps the top K candidates.
    pub candidate_top_k: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: 15,
            sse_ping_format: ": ping\n\n".into(),
            default_user_concurrency: 4,
            user_wait_max: 32,
            user_wait_timeout_seconds: 30,
            account_wait_max: 16,
            account_wait_timeout_seconds: 20,
            sticky_ttl_seconds: 3600,
            candidate_top_k: 3,
        }
    }
}

/// One passthrough override: matched against (provider, upstream status,
/// body substring) after failover is exhausted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughRule {
    /// Platform tag the rule applies to; `None` matches any.
    pub provider: Option<String>,
    pub upstream_status: u16,
    /// Substring the upstream body must contain; `None` matches any body.
    pub body_contains: Option<String>,
    /// Status returned to the caller; `None` keeps the upstream status.
    pub status: Option<u16>,
    /// Error type placed in the envelope; `None` keeps the default mapping.
    pub error_type: Option<String>,
    /// Message placed in the envelope; `None` passes the upstream body through.
    pub message: Option<String>,
    /// Exclude the incident from operational counters.
    pub skip_monitoring: bool,
}

/// One upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountEntry {
    pub id: String,
    pub name: Option<String>,
    /// Platform tag: `openai`, `anthropic` or `generic`.
    pub platform: String,
    pub groups: Vec<String>,
    pub max_concurrency: Option<u32>,
    pub schedulable: bool,
    pub api_key: String,
    pub base_url: String,
    pub proxy: Option<String>,
    /// Models the account serves; empty means all.
    pub models: Vec<String>,
}

impl Default for AccountEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            platform: "openai".into(),
            groups: Vec::new(),
            max_concurrency: None,
            schedulable: true,
            api_key: String::new(),
            base_url: String::new(),
            proxy: None,
            models: Vec::new(),
        }
    }
}

/// One end-user API key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    /// Stable key identifier used in logs; defaults to the user id.
    pub api_key_id: Option<String>,
    pub group: Option<String>,
    pub max_concurrency: Option<u32>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = FerryConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: FerryConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.server.port, 8790);
        assert_eq!(back.dispatch.max_account_switches, 3);
        assert_eq!(back.pool.connection_pool_isolation, PoolIsolation::Account);
    }

    #[test]
    fn task_timeout_is_clamped() {
        let mut cfg = UsageRecordConfig::default();
        cfg.task_timeout_seconds = 0;
        assert_eq!(cfg.task_timeout().as_secs(), 1);
        cfg.task_timeout_seconds = 60;
        assert_eq!(cfg.task_timeout().as_secs(), 10);
        cfg.task_timeout_seconds = 7;
        assert_eq!(cfg.task_timeout().as_secs(), 7);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: FerryConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [[accounts]]
            id = "acct-1"
            api_key = "sk-upstream"
            base_url = "https://api.openai.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.accounts.len(), 1);
        assert!(cfg.accounts[0].schedulable);
        assert_eq!(cfg.accounts[0].platform, "openai");
    }

    #[test]
    fn isolation_parses_snake_case() {
        let cfg: FerryConfig = toml::from_str(
            r#"
            [pool]
            connection_pool_isolation = "account_proxy"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.pool.connection_pool_isolation,
            PoolIsolation::AccountProxy
        );
    }
}

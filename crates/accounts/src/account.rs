use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use ferry_config::schema::AccountEntry;

/// Upstream platform tag, used for forced-platform filtering and for
/// selecting the protocol profile of pooled clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    OpenAi,
    Anthropic,
    Generic,
}

impl Platform {
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "openai" => Self::OpenAi,
            "anthropic" => Self::Anthropic,
            _ => Self::Generic,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Generic => "generic",
        }
    }
}

/// A credentialed upstream identity through which requests are forwarded.
///
/// Static fields come from config; the `*_until_ms` windows and the last-used
/// stamp are the only mutable state and are updated atomically.
pub struct Account {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub groups: Vec<String>,
    pub max_concurrency: u32,
    pub schedulable: bool,
    pub api_key: String,
    pub base_url: String,
    pub proxy: Option<String>,
    /// Models this account serves; empty means all.
    pub models: Vec<String>,

    last_used_ms: AtomicU64,
    rate_limited_until_ms: AtomicU64,
    overloaded_until_ms: AtomicU64,
    model_limited_until_ms: DashMap<String, u64>,
}

impl Account {
    #[must_use]
    pub fn from_entry(entry: &AccountEntry, default_concurrency: u32) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            platform: Platform::parse(&entry.platform),
            groups: entry.groups.clone(),
            max_concurrency: entry.max_concurrency.unwrap_or(default_concurrency),
            schedulable: entry.schedulable,
            api_key: entry.api_key.clone(),
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            proxy: entry.proxy.clone(),
            models: entry.models.clone(),
            last_used_ms: AtomicU64::new(0),
            rate_limited_until_ms: AtomicU64::new(0),
            overloaded_until_ms: AtomicU64::new(0),
            model_limited_until_ms: DashMap::new(),
        }
    }

    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Whether the account can take a request for `model` at `now_ms`.
    ///
    /// Active state, outside every transient window, and declaring support
    /// for the model.
    #[must_use]
    pub fn is_schedulable(&self, model: &str, now_ms: u64) -> bool {
        if !self.schedulable || !self.supports_model(model) {
            return false;
        }
        if self.rate_limited_until_ms.load(Ordering::Acquire) > now_ms {
            return false;
        }
        if self.overloaded_until_ms.load(Ordering::Acquire) > now_ms {
            return false;
        }
        if let Some(until) = self.model_limited_until_ms.get(model)
            && *until > now_ms
        {
            return false;
        }
        true
    }

    pub fn mark_rate_limited(&self, until_ms: u64) {
        self.rate_limited_until_ms.store(until_ms, Ordering::Release);
    }

    pub fn mark_overloaded(&self, until_ms: u64) {
        self.overloaded_until_ms.store(until_ms, Ordering::Release);
    }

    pub fn mark_model_rate_limited(&self, model: &str, until_ms: u64) {
        self.model_limited_until_ms.insert(model.to_string(), until_ms);
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_used_ms.store(now_ms, Ordering::Release);
    }

    #[must_use]
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // api_key deliberately omitted.
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("groups", &self.groups)
            .field("max_concurrency", &self.max_concurrency)
            .field("schedulable", &self.schedulable)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

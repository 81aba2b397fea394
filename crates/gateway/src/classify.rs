use {
    axum::http::StatusCode,
    serde_json::Value,
    tracing::debug,
};

use ferry_config::schema::PassthroughRule;

use crate::errors::{ApiError, ErrorType};

/// Upstream statuses that allow retrying the request on another account.
/// 401/403/429 implicate the account itself (auth or quota), so the next
/// account may well succeed.
const FAILOVER_STATUSES: &[u16] = &[401, 403, 429, 500, 502, 503, 504, 529];

/// Internal classification: never exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Blacklist the account and try the next one.
    Failover,
    /// Return to the caller now.
    Terminal,
}

/// What the dispatcher does with one upstream failure.
#[derive(Debug)]
pub struct Classified {
    pub disposition: Disposition,
    pub error: ApiError,
    /// The account's credentials are implicated; unbind its sticky session.
    pub implicates_auth: bool,
    /// Counts toward the account's rate-limit window.
    pub rate_limited: bool,
    /// Counts toward the account's overload window.
    pub overloaded: bool,
}

/// Maps upstream failures to the user-visible taxonomy and applies the
/// configured passthrough rules once failover is exhausted.
pub struct ErrorClassifier {
    rules: Vec<PassthroughRule>,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(rules: Vec<PassthroughRule>) -> Self {
        Self { rules }
    }

    /// Default status mapping, used mid-loop. Passthrough rules are never
    /// consulted here.
    #[must_use]
    pub fn classify(&self, upstream_status: u16) -> Classified {
        let failover = FAILOVER_STATUSES.contains(&upstream_status);
        let (out_status, error_type) = default_mapping(upstream_status);
        Classified {
            disposition: if failover {
                Disposition::Failover
            } else {
                Disposition::Terminal
            },
            error: ApiError {
                status: out_status,
                error_type,
                message: format!("upstream returned status {upstream_status}"),
            },
            implicates_auth: matches!(upstream_status, 401 | 403),
            rate_limited: upstream_status == 429,
            overloaded: upstream_status == 529,
        }
    }

    /// Resolve the response for an exhausted failover: the passthrough
    /// rules are matched against the last upstream response, and the first
    /// hit overrides status and body. Returns `(status, body,
    /// skip_monitoring)`.
    #[must_use]
    pub fn finalize(
        &self,
        provider: &str,
        upstream_status: u16,
        body: &str,
    ) -> (StatusCode, Value, bool) {
        for rule in &self.rules {
            if !rule_matches(rule, provider, upstream_status, body) {
                continue;
            }
            debug!(provider, upstream_status, "passthrough rule matched");
            let status = rule
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .or_else(|| StatusCode::from_u16(upstream_status).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let (_, default_type) = default_mapping(upstream_status);
            let error_type = rule
                .error_type
                .clone()
                .unwrap_or_else(|| default_type.as_str().to_string());
            let payload = match &rule.message {
                Some(message) => envelope_with(&error_type, message),
                // No message override: the upstream body passes through
                // unchanged (kept as a string when it is not JSON).
                None => serde_json::from_str(body)
                    .unwrap_or_else(|_| envelope_with(&error_type, body)),
            };
            return (status, payload, rule.skip_monitoring);
        }

        let classified = self.classify(upstream_status);
        let mut error = classified.error;
        error.message = failure_summary(upstream_status, body);
        (error.status, error.envelope(), false)
    }
}

fn rule_matches(rule: &PassthroughRule, provider: &str, status: u16, body: &str) -> bool {
    if rule.upstream_status != status {
        return false;
    }
    if let Some(rule_provider) = &rule.provider
        && rule_provider != provider
    {
        return false;
    }
    if let Some(needle) = &rule.body_contains
        && !body.contains(needle.as_str())
    {
        return false;
    }
    true
}

fn default_mapping(upstream_status: u16) -> (StatusCode, ErrorType) {
    match upstream_status {
        429 => (StatusCode::TOO_MANY_REQUESTS, ErrorType::RateLimit),
        529 => (StatusCode::SERVICE_UNAVAILABLE, ErrorType::Upstream),
        _ => (StatusCode::BAD_GATEWAY, ErrorType::Upstream),
    }
}

fn envelope_with(error_type: &str, message: &str) -> Value {
    serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    })
}

fn failure_summary(upstream_status: u16, body: &str) -> String {
    let snippet: String = body.chars().take(256).collect();
    if snippet.is_empty() {
        format!("upstream returned status {upstream_status}")
    } else {
        format!("upstream returned status {upstream_status}: {snippet}")
    }
}

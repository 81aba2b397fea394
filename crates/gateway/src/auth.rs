use std::collections::HashMap;

use axum::http::{HeaderMap, header};

use ferry_config::schema::ApiKeyEntry;

use crate::{context::Caller, errors::ApiError};

/// Static API-key table resolving bearer keys to caller identities.
///
/// Credential issuance and rotation are owned by an external system; the
/// gateway only needs key → identity resolution.
pub struct ApiKeyring {
    keys: HashMap<String, Caller>,
}

impl ApiKeyring {
    #[must_use]
    pub fn from_entries(entries: &[ApiKeyEntry], default_user_concurrency: u32) -> Self {
        let mut keys = HashMap::new();
        for entry in entries {
            keys.entry(entry.key.clone()).or_insert_with(|| Caller {
                user_id: entry.user_id.clone(),
                api_key_id: entry
                    .api_key_id
                    .clone()
                    .unwrap_or_else(|| entry.user_id.clone()),
                group: entry.group.clone(),
                max_concurrency: entry.max_concurrency.unwrap_or(default_user_concurrency),
            });
        }
        Self { keys }
    }

    /// Resolve the caller from `Authorization: Bearer` or `x-api-key`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let key = bearer_token(headers)
            .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
            .ok_or_else(|| ApiError::authentication("missing API key"))?;

        self.keys
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::authentication("invalid API key"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    fn keyring() -> ApiKeyring {
        ApiKeyring::from_entries(
            &[ApiKeyEntry {
                key: "fk-alpha".into(),
                user_id: "u1".into(),
                api_key_id: Some("key-1".into()),
                group: Some("team".into()),
                max_concurrency: Some(2),
            }],
            4,
        )
    }

    #[test]
    fn bearer_header_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer fk-alpha"),
        );
        let caller = keyring().authenticate(&headers).unwrap();
        assert_eq!(caller.user_id, "u1");
        assert_eq!(caller.api_key_id, "key-1");
        assert_eq!(caller.max_concurrency, 2);
    }

    #[test]
    fn x_api_key_header_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("fk-alpha"));
        assert!(keyring().authenticate(&headers).is_ok());
    }

    #[test]
    fn missing_key_is_authentication_error() {
        let err = keyring().authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(err.error_type, crate::errors::ErrorType::Authentication);
    }

    #[test]
    fn unknown_key_is_authentication_error() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer fk-wrong"),
        );
        assert!(keyring().authenticate(&headers).is_err());
    }

    #[test]
    fn default_concurrency_applies_when_unset() {
        let keyring = ApiKeyring::from_entries(
            &[ApiKeyEntry {
                key: "fk-b".into(),
                user_id: "u2".into(),
                ..ApiKeyEntry::default()
            }],
            4,
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("fk-b"));
        let caller = keyring.authenticate(&headers).unwrap();
        assert_eq!(caller.max_concurrency, 4);
        assert_eq!(caller.api_key_id, "u2");
    }
}

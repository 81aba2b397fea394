use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::{Value, json},
};

/// User-visible error taxonomy. Serialized as the `type` field of the
/// OpenAI error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    InvalidRequest,
    Authentication,
    Api,
    RateLimit,
    Upstream,
}

impl ErrorType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::Api => "api_error",
            Self::RateLimit => "rate_limit_error",
            Self::Upstream => "upstream_error",
        }
    }
}

/// An error ready to be shown to the caller: status code plus envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: ErrorType,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: ErrorType::InvalidRequest,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn payload_too_large(limit: usize) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            error_type: ErrorType::InvalidRequest,
            message: format!("request body exceeds the {limit}-byte limit"),
        }
    }

    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error_type: ErrorType::Authentication,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            error_type: ErrorType::RateLimit,
            message: message.into(),
        }
    }

    /// Configuration or dependency-missing failures.
    #[must_use]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error_type: ErrorType::Api,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: ErrorType::Upstream,
            message: message.into(),
        }
    }

    /// The OpenAI-style `{"error":{"type","message"}}` envelope.
    #[must_use]
    pub fn envelope(&self) -> Value {
        json!({
            "error": {
                "type": self.error_type.as_str(),
                "message": self.message,
            }
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let err = ApiError::invalid_request("model is required");
        let v = err.envelope();
        assert_eq!(v["error"]["type"], "invalid_request_error");
        assert_eq!(v["error"]["message"], "model is required");
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            ApiError::authentication("no key").status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::rate_limited("busy").status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::service_unavailable("no accounts").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::payload_too_large(1024).status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}

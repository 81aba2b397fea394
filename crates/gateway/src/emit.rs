use {
    axum::{
        body::Body,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    },
    bytes::Bytes,
    serde_json::json,
};

use crate::errors::{ApiError, ErrorType};

/// An error encoded in-band as an SSE `error` event, used once the stream
/// has started and the status code is committed.
#[must_use]
pub fn sse_error_event(error_type: ErrorType, message: &str) -> Bytes {
    let payload = json!({
        "error": {
            "type": error_type.as_str(),
            "message": message,
        }
    });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

/// Panic responder for the catch-panic layer. A panicking handler has not
/// written a response yet, so a JSON 502 is always the right shape here;
/// panics after stream start are handled in-band by the relay.
#[must_use]
pub fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");

    ApiError {
        status: StatusCode::BAD_GATEWAY,
        error_type: ErrorType::Upstream,
        message: "internal gateway failure".into(),
    }
    .into_response()
}

/// A committed streaming response wrapping the given body stream.
#[must_use]
pub fn sse_response<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

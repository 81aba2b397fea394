use {
    axum::{
        Json, Router,
        body::Body,
        extract::{Request, State, WebSocketUpgrade},
        http::{HeaderMap, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    tower_http::{
        catch_panic::CatchPanicLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        sensitive_headers::SetSensitiveHeadersLayer,
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{
    context::{RequestContext, Transport, derive_fingerprint},
    dispatch::dispatch,
    emit,
    errors::ApiError,
    state::AppState,
    validate::validate_create_payload,
    ws,
};

/// Caller-supplied session fingerprint header.
const SESSION_HEADER: &str = "x-session-id";

/// Build the gateway router (shared between production startup and tests).
#[must_use]
pub fn build_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/openai/v1/responses",
            post(responses_handler).get(responses_ws_handler),
        )
        .route("/openai/v1/videos", post(videos_handler))
        .with_state(state);

    // Innermost first; the panic catcher wraps everything.
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION]))
        .layer(CatchPanicLayer::custom(emit::panic_response))
}

/// Serve until the state's shutdown token fires, then drain the usage pool.
pub async fn serve(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(component = "server", %addr, "gateway listening");

    let app = build_app(state.clone());
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    state.usage.shutdown().await;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn responses_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    ingest(state, parts.headers, body, Transport::Http, "/v1/responses").await
}

/// Asynchronous generation jobs share the admission and dispatch path;
/// the job envelope is relayed without streaming.
async fn videos_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    ingest(state, parts.headers, body, Transport::AsyncJob, "/v1/videos").await
}

async fn ingest(
    state: AppState,
    headers: HeaderMap,
    body: Body,
    transport: Transport,
    upstream_path: &'static str,
) -> Response {
    // Enforce the cap against the declared length first, then against the
    // actual read, so both cases get the proper envelope.
    let cap = state.config.server.max_body_bytes;
    if content_length(&headers).is_some_and(|len| len > cap) {
        return ApiError::payload_too_large(cap).into_response();
    }
    let body = match axum::body::to_bytes(body, cap).await {
        Ok(body) => body,
        Err(_) => return ApiError::payload_too_large(cap).into_response(),
    };

    let caller = match state.keyring.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return ApiError::invalid_request("request body is not valid JSON").into_response();
        },
    };
    let mut validated = match validate_create_payload(&parsed) {
        Ok(validated) => validated,
        Err(err) => return err.into_response(),
    };
    if transport == Transport::AsyncJob {
        // Job envelopes are polled, never streamed.
        validated.stream = false;
    }

    let fingerprint = derive_fingerprint(
        header_str(&headers, SESSION_HEADER),
        validated.prompt_cache_key.as_deref(),
        None,
    );
    let ctx = RequestContext::new(
        request_id(&headers),
        caller,
        &validated,
        transport,
        fingerprint,
        state.shutdown.child_token(),
    );
    ctx.timings.mark_auth();

    dispatch(state, ctx, body, upstream_path).await
}

async fn responses_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let caller = match state.keyring.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let session_header = header_str(&headers, SESSION_HEADER).map(String::from);

    ws.max_message_size(ws::WS_READ_LIMIT)
        .max_frame_size(ws::WS_READ_LIMIT)
        .on_upgrade(move |socket| ws::handle_session(socket, state, caller, session_header))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The request id is minted by the middleware; fall back to a fresh UUID
/// for direct calls (tests, in-process dispatch).
fn request_id(headers: &HeaderMap) -> String {
    header_str(headers, "x-request-id")
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

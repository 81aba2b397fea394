use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{SinkExt, stream::{SplitSink, StreamExt}},
    tokio_tungstenite::tungstenite::{
        client::IntoClientRequest, protocol::Message as UpstreamMessage,
    },
    tracing::{debug, info, warn},
};

use {
    ferry_common::time::epoch_ms,
    ferry_concurrency::SlotPermit,
    ferry_scheduler::{ScheduleRequest, select::effective_group},
};

use crate::{
    context::{Caller, RequestContext, Transport, derive_fingerprint},
    state::AppState,
    usage::UsageRecord,
    validate::validate_create_payload,
};

/// Per-frame read limit on the WS ingress.
pub const WS_READ_LIMIT: usize = 16 * 1024 * 1024;

/// Deadline for the first (create) message after the upgrade.
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unconsumed tool-call correlation ids expire after this long.
const PENDING_CALL_TTL: Duration = Duration::from_secs(600);

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Slots held for the current turn. Account releases before user; both
/// release at most once.
#[derive(Default)]
struct TurnSlots {
    user: Option<SlotPermit>,
    account: Option<SlotPermit>,
}

impl TurnSlots {
    fn release_all(&mut self) {
        if let Some(account) = self.account.take() {
            account.release();
        }
        if let Some(user) = self.user.take() {
            user.release();
        }
    }
}

/// What an upstream event means for the turn lifecycle.
enum TurnEvent {
    Progress,
    Completed { ok: bool },
}

/// Handle one WebSocket session: first-turn admission, bidirectional
/// relay with per-turn re-admission, and exactly-once slot release on
/// every close path.
pub async fn handle_session(
    mut socket: WebSocket,
    state: AppState,
    caller: Caller,
    session_header: Option<String>,
) {
    // ── First message: the create payload ───────────────────────────────
    let first_text = match tokio::time::timeout(FIRST_MESSAGE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
        Ok(Some(Ok(_)) | None) => {
            close_whole(socket, CLOSE_POLICY_VIOLATION, "expected a create payload").await;
            return;
        },
        Ok(Some(Err(err))) => {
            debug!(error = %err, "ws: read error before create payload");
            return;
        },
        Err(_) => {
            close_whole(socket, CLOSE_POLICY_VIOLATION, "timed out waiting for create payload")
                .await;
            return;
        },
    };

    let parsed: serde_json::Value = match serde_json::from_str(&first_text) {
        Ok(parsed) => parsed,
        Err(_) => {
            close_whole(socket, CLOSE_POLICY_VIOLATION, "create payload is not valid JSON").await;
            return;
        },
    };
    let validated = match validate_create_payload(&parsed) {
        Ok(validated) => validated,
        Err(err) => {
            close_whole(socket, CLOSE_POLICY_VIOLATION, &err.message).await;
            return;
        },
    };

    // Fallback seed from the caller identity guarantees WS sessions always
    // carry a fingerprint.
    let fingerprint = derive_fingerprint(
        session_header.as_deref(),
        validated.prompt_cache_key.as_deref(),
        Some(&caller),
    );
    let ctx = RequestContext::new(
        uuid::Uuid::new_v4().to_string(),
        caller,
        &validated,
        Transport::Ws,
        fingerprint,
        state.shutdown.child_token(),
    );

    // ── Turn 1 admission (WS callers never queue) ───────────────────────
    let selection = match state.scheduler.select(&ScheduleRequest {
        group: ctx.caller.group.as_deref(),
        forced_platform: state.forced_platform(),
        model: &ctx.model,
        fingerprint: ctx.fingerprint.as_deref(),
        previous_response_id: ctx.previous_response_id.as_deref(),
        blacklist: &ctx.blacklist,
    }) {
        Ok(selection) => selection,
        Err(_) => {
            close_whole(socket, CLOSE_TRY_AGAIN_LATER, "no available account").await;
            return;
        },
    };
    let account = selection.account;
    ctx.timings.mark_routing();

    let mut slots = TurnSlots::default();
    match state.admission.try_admit_user(&ctx) {
        Ok(Some(permit)) => slots.user = Some(permit),
        _ => {
            close_whole(socket, CLOSE_TRY_AGAIN_LATER, "user concurrency exhausted").await;
            return;
        },
    }
    match state
        .admission
        .try_admit_account(&ctx, &account.id, account.max_concurrency)
    {
        Ok(Some(permit)) => slots.account = Some(permit),
        _ => {
            slots.release_all();
            close_whole(socket, CLOSE_TRY_AGAIN_LATER, "account concurrency exhausted").await;
            return;
        },
    }

    state.rpm.incr(&account.id);
    account.touch(epoch_ms());

    // ── Upstream leg ────────────────────────────────────────────────────
    let upstream = match connect_upstream(&account.base_url, &account.api_key).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(
                component = "ws",
                request_id = %ctx.request_id,
                account_id = %account.id,
                error = %err,
                "upstream websocket connect failed"
            );
            slots.release_all();
            close_whole(socket, CLOSE_INTERNAL_ERROR, "upstream connection failed").await;
            return;
        },
    };
    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = socket.split();

    if up_tx
        .send(UpstreamMessage::Text(first_text.as_str().into()))
        .await
        .is_err()
    {
        slots.release_all();
        close_split(&mut client_tx, CLOSE_INTERNAL_ERROR, "upstream write failed").await;
        return;
    }

    info!(
        component = "ws",
        request_id = %ctx.request_id,
        user_id = %ctx.caller.user_id,
        api_key_id = %ctx.caller.api_key_id,
        group_id = ctx.caller.group.as_deref(),
        account_id = %account.id,
        model = %ctx.model,
        transport = ctx.transport.as_str(),
        schedule_layer = selection.layer.as_str(),
        candidate_count = selection.candidate_count,
        "ws: session started"
    );

    // ── Relay loop with per-turn re-admission ───────────────────────────
    let mut turn: u32 = 1;
    let mut turn_active = true;
    let mut last_response_id: Option<String> = None;
    let mut pending_calls: HashMap<String, Instant> = HashMap::new();
    let sticky_ttl = Duration::from_secs(state.config.concurrency.sticky_ttl_seconds);

    let (close_status, close_reason): (u16, &str) = loop {
        tokio::select! {
            client_msg = client_rx.next() => match client_msg {
                None | Some(Err(_)) => {
                    // Client went away; nothing left to write to.
                    slots.release_all();
                    log_close(&ctx, &account.id, turn, 0, "client disconnected");
                    return;
                },
                Some(Ok(Message::Close(_))) => break (CLOSE_NORMAL, "bye"),
                Some(Ok(Message::Text(text))) => {
                    if turn_active {
                        break (CLOSE_POLICY_VIOLATION, "previous turn still in flight");
                    }
                    let text = text.to_string();
                    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
                        break (CLOSE_POLICY_VIOLATION, "turn payload is not valid JSON");
                    };
                    let turn_request = match validate_create_payload(&payload) {
                        Ok(v) => v,
                        Err(_) => break (CLOSE_POLICY_VIOLATION, "invalid turn payload"),
                    };
                    // Server-assisted correlation: a quoted previous response
                    // must be the one this session last produced.
                    if let Some(prev) = &turn_request.previous_response_id
                        && last_response_id.as_deref() != Some(prev.as_str())
                    {
                        break (CLOSE_POLICY_VIOLATION, "unknown previous_response_id");
                    }
                    if let Some(reason) = check_tool_outputs(&payload, &mut pending_calls) {
                        break (CLOSE_POLICY_VIOLATION, reason);
                    }

                    // before_turn: release prior slots, then re-acquire
                    // without queueing.
                    turn += 1;
                    slots.release_all();
                    match state.admission.try_admit_user(&ctx) {
                        Ok(Some(permit)) => slots.user = Some(permit),
                        _ => break (CLOSE_TRY_AGAIN_LATER, "user concurrency exhausted"),
                    }
                    match state
                        .admission
                        .try_admit_account(&ctx, &account.id, account.max_concurrency)
                    {
                        Ok(Some(permit)) => slots.account = Some(permit),
                        _ => {
                            slots.release_all();
                            break (CLOSE_TRY_AGAIN_LATER, "account concurrency exhausted");
                        },
                    }
                    if let Some(fp) = &ctx.fingerprint {
                        state.sticky.refresh_ttl(
                            effective_group(ctx.caller.group.as_deref()),
                            fp,
                            sticky_ttl,
                        );
                    }
                    state.rpm.incr(&account.id);
                    account.touch(epoch_ms());

                    if up_tx
                        .send(UpstreamMessage::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        break (CLOSE_INTERNAL_ERROR, "upstream write failed");
                    }
                    turn_active = true;
                },
                // Pings are answered by the stack; binary frames are not
                // part of the protocol.
                Some(Ok(_)) => {},
            },
            upstream_msg = up_rx.next() => match upstream_msg {
                None | Some(Err(_)) => break (CLOSE_INTERNAL_ERROR, "upstream closed"),
                Some(Ok(UpstreamMessage::Text(text))) => {
                    let event = inspect_event(
                        text.as_str(),
                        &mut last_response_id,
                        &mut pending_calls,
                    );
                    if client_tx
                        .send(Message::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        slots.release_all();
                        log_close(&ctx, &account.id, turn, 0, "client write failed");
                        return;
                    }
                    if let TurnEvent::Completed { ok } = event {
                        // after_turn: slots go back, usage is recorded on
                        // success, stale correlation ids age out.
                        turn_active = false;
                        slots.release_all();
                        sweep_pending(&mut pending_calls);
                        if ok {
                            state
                                .scheduler
                                .report_outcome(&account.id, true, ctx.timings.first_token());
                            state
                                .usage
                                .submit_or_run(turn_usage(&ctx, &account.id))
                                .await;
                        } else {
                            state.scheduler.report_outcome(&account.id, false, None);
                        }
                    }
                },
                Some(Ok(UpstreamMessage::Close(_))) => break (CLOSE_NORMAL, "upstream finished"),
                Some(Ok(_)) => {},
            },
            () = ctx.cancel.cancelled() => break (CLOSE_NORMAL, "server shutting down"),
        }
    };

    slots.release_all();
    close_split(&mut client_tx, close_status, close_reason).await;
    log_close(&ctx, &account.id, turn, close_status, close_reason);
}

async fn connect_upstream(
    base_url: &str,
    api_key: &str,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let ws_url = to_ws_url(base_url);
    let mut request = format!("{ws_url}/v1/responses").into_client_request()?;
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        http::HeaderValue::from_str(&format!("Bearer {api_key}"))?,
    );
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

fn to_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

/// Track turn lifecycle events and tool-call correlation ids carried by
/// upstream frames.
fn inspect_event(
    text: &str,
    last_response_id: &mut Option<String>,
    pending_calls: &mut HashMap<String, Instant>,
) -> TurnEvent {
    let Ok(event) = serde_json::from_str::<serde_json::Value>(text) else {
        return TurnEvent::Progress;
    };
    match event["type"].as_str() {
        Some("response.completed") => {
            if let Some(id) = event["response"]["id"].as_str() {
                *last_response_id = Some(id.to_string());
            }
            TurnEvent::Completed { ok: true }
        },
        Some("response.failed") | Some("error") => TurnEvent::Completed { ok: false },
        Some("response.output_item.done") => {
            let item = &event["item"];
            if item["type"].as_str() == Some("function_call")
                && let Some(call_id) = item["call_id"].as_str()
            {
                pending_calls.insert(call_id.to_string(), Instant::now());
            }
            TurnEvent::Progress
        },
        _ => TurnEvent::Progress,
    }
}

/// Function-call outputs must answer a call this session actually saw.
fn check_tool_outputs(
    payload: &serde_json::Value,
    pending_calls: &mut HashMap<String, Instant>,
) -> Option<&'static str> {
    let items = payload.get("input")?.as_array()?;
    for item in items {
        if item["type"].as_str() != Some("function_call_output") {
            continue;
        }
        let Some(call_id) = item["call_id"].as_str() else {
            return Some("function_call_output without call_id");
        };
        if pending_calls.remove(call_id).is_none() {
            return Some("unknown tool call_id");
        }
    }
    None
}

fn sweep_pending(pending_calls: &mut HashMap<String, Instant>) {
    sweep_pending_at(pending_calls, Instant::now());
}

fn sweep_pending_at(pending_calls: &mut HashMap<String, Instant>, now: Instant) {
    pending_calls.retain(|_, seen| now.duration_since(*seen) < PENDING_CALL_TTL);
}

fn turn_usage(ctx: &RequestContext, account_id: &str) -> UsageRecord {
    UsageRecord {
        request_id: ctx.request_id.clone(),
        user_id: ctx.caller.user_id.clone(),
        api_key_id: ctx.caller.api_key_id.clone(),
        account_id: account_id.to_string(),
        model: ctx.model.clone(),
        transport: ctx.transport.as_str(),
        input_tokens: None,
        output_tokens: None,
        upstream_ms: ctx.timings.upstream_ms(),
        first_token_ms: match ctx.timings.first_token_ms() {
            0 => None,
            ms => Some(ms),
        },
    }
}

async fn close_whole(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn close_split(
    tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn log_close(
    ctx: &RequestContext,
    account_id: &str,
    turn: u32,
    close_status: u16,
    close_reason: &str,
) {
    info!(
        component = "ws",
        request_id = %ctx.request_id,
        user_id = %ctx.caller.user_id,
        account_id = %account_id,
        model = %ctx.model,
        turn,
        close_status,
        close_reason,
        "ws: session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn completed_event_updates_last_response_id() {
        let mut last = None;
        let mut pending = HashMap::new();
        let event = inspect_event(
            &json!({"type": "response.completed", "response": {"id": "resp_7"}}).to_string(),
            &mut last,
            &mut pending,
        );
        assert!(matches!(event, TurnEvent::Completed { ok: true }));
        assert_eq!(last.as_deref(), Some("resp_7"));
    }

    #[test]
    fn failed_and_error_events_end_the_turn_unsuccessfully() {
        let mut last = None;
        let mut pending = HashMap::new();
        for kind in ["response.failed", "error"] {
            let event = inspect_event(
                &json!({"type": kind}).to_string(),
                &mut last,
                &mut pending,
            );
            assert!(matches!(event, TurnEvent::Completed { ok: false }));
        }
        assert!(last.is_none());
    }

    #[test]
    fn function_call_items_register_pending_ids() {
        let mut last = None;
        let mut pending = HashMap::new();
        inspect_event(
            &json!({
                "type": "response.output_item.done",
                "item": {"type": "function_call", "call_id": "call_9", "name": "lookup"},
            })
            .to_string(),
            &mut last,
            &mut pending,
        );
        assert!(pending.contains_key("call_9"));
    }

    #[test]
    fn tool_outputs_must_answer_pending_calls() {
        let mut pending = HashMap::new();
        pending.insert("call_9".to_string(), Instant::now());

        let ok_payload = json!({
            "model": "gpt-4.1",
            "input": [{"type": "function_call_output", "call_id": "call_9", "output": "{}"}],
        });
        assert_eq!(check_tool_outputs(&ok_payload, &mut pending), None);
        // Consumed: answering the same call twice is a violation.
        assert!(check_tool_outputs(&ok_payload, &mut pending).is_some());

        let unknown = json!({
            "model": "gpt-4.1",
            "input": [{"type": "function_call_output", "call_id": "call_404", "output": "{}"}],
        });
        assert!(check_tool_outputs(&unknown, &mut pending).is_some());
    }

    #[test]
    fn sweep_drops_expired_correlation_ids() {
        let seen = Instant::now();
        let mut pending = HashMap::new();
        pending.insert("old".to_string(), seen);
        pending.insert("fresh".to_string(), seen + PENDING_CALL_TTL);
        sweep_pending_at(&mut pending, seen + PENDING_CALL_TTL + Duration::from_secs(1));
        assert!(!pending.contains_key("old"));
        assert!(pending.contains_key("fresh"));
    }

    #[test]
    fn base_urls_convert_to_ws_schemes() {
        assert_eq!(to_ws_url("https://api.example"), "wss://api.example");
        assert_eq!(to_ws_url("http://localhost:9000"), "ws://localhost:9000");
    }
}

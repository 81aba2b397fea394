use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use {
    axum::{
        Json,
        body::Body,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    },
    bytes::Bytes,
    futures::StreamExt,
    tracing::{info, warn},
};

use {
    ferry_common::time::epoch_ms,
    ferry_scheduler::{ScheduleRequest, Selection, select::effective_group},
    ferry_upstream::is_http2_error,
};

use crate::{
    classify::Disposition,
    context::RequestContext,
    emit,
    errors::{ApiError, ErrorType},
    state::AppState,
    usage::UsageRecord,
};

/// Rate-limit window applied when the upstream does not send Retry-After.
const RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const OVERLOAD_WINDOW_MS: u64 = 30_000;
/// How long a response id stays resolvable for previous-response affinity.
const RESPONSE_ID_TTL: Duration = Duration::from_secs(3600);

/// The last upstream failure, kept for the passthrough rules once
/// failover is exhausted.
struct LastFailure {
    status: u16,
    body: String,
    platform: &'static str,
}

/// Run one request through admission, selection, forwarding and failover.
///
/// `upstream_path` is appended to the account base URL (`/v1/responses`
/// for chat, `/v1/videos` for async generation jobs).
pub async fn dispatch(
    state: AppState,
    mut ctx: RequestContext,
    body: Bytes,
    upstream_path: &'static str,
) -> Response {
    let user_permit = match state.admission.admit_user(&ctx).await {
        Ok(permit) => permit,
        Err(err) => return err.into_response(),
    };

    let mut last_failure: Option<LastFailure> = None;
    let mut switch_count = 0u32;

    // At most max_account_switches + 1 upstream attempts.
    for _attempt in 0..=state.config.dispatch.max_account_switches {
        let selection = match state.scheduler.select(&ScheduleRequest {
            group: ctx.caller.group.as_deref(),
            forced_platform: state.forced_platform(),
            model: &ctx.model,
            fingerprint: ctx.fingerprint.as_deref(),
            previous_response_id: ctx.previous_response_id.as_deref(),
            blacklist: &ctx.blacklist,
        }) {
            Ok(selection) => selection,
            Err(_) => return exhausted_response(&state, &ctx, last_failure, switch_count),
        };
        ctx.timings.mark_routing();

        let account_permit = match state.admission.admit_account(&ctx, &selection).await {
            Ok(permit) => permit,
            Err(err) => {
                info!(
                    component = "dispatch",
                    request_id = %ctx.request_id,
                    account_id = %selection.account.id,
                    schedule_layer = selection.layer.as_str(),
                    "account admission rejected"
                );
                return err.into_response();
            },
        };

        state.rpm.incr(&selection.account.id);
        selection.account.touch(epoch_ms());

        let lease = match state.pool.acquire(&selection.account) {
            Ok(lease) => lease,
            Err(err) => {
                warn!(
                    component = "dispatch",
                    request_id = %ctx.request_id,
                    account_id = %selection.account.id,
                    error = %err,
                    "upstream client unavailable"
                );
                return ApiError::service_unavailable("upstream client unavailable")
                    .into_response();
            },
        };

        let url = format!("{}{}", selection.account.base_url, upstream_path);
        let send_result = lease
            .client()
            .post(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", selection.account.api_key),
            )
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;
        ctx.timings.mark_upstream();

        let resp = match send_result {
            Ok(resp) => resp,
            Err(err) => {
                if is_http2_error(&err) && state.pool.record_http2_error(&lease) {
                    warn!(proxy = lease.proxy_key(), "proxy downgraded to http/1.1");
                }
                warn!(
                    component = "dispatch",
                    request_id = %ctx.request_id,
                    account_id = %selection.account.id,
                    switch_count,
                    error = %err,
                    "upstream send failed, failing over"
                );
                metrics::counter!("ferry_failovers_total").increment(1);
                state
                    .scheduler
                    .report_outcome(&selection.account.id, false, None);
                ctx.blacklist.insert(selection.account.id.clone());
                switch_count += 1;
                drop(lease);
                account_permit.release();
                continue;
            },
        };

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            let classified = state.classifier.classify(status.as_u16());

            if classified.implicates_auth
                && let Some(fingerprint) = &ctx.fingerprint
            {
                state
                    .sticky
                    .unbind(effective_group(ctx.caller.group.as_deref()), fingerprint);
            }

            let now = epoch_ms();
            if classified.rate_limited {
                let until = now + retry_after.map_or(RATE_LIMIT_WINDOW_MS, |s| s * 1000);
                // A body naming the model implicates only that model.
                if text.contains(ctx.model.as_str()) {
                    selection.account.mark_model_rate_limited(&ctx.model, until);
                } else {
                    selection.account.mark_rate_limited(until);
                }
            }
            if classified.overloaded {
                selection.account.mark_overloaded(now + OVERLOAD_WINDOW_MS);
            }

            state
                .scheduler
                .report_outcome(&selection.account.id, false, None);

            match classified.disposition {
                Disposition::Failover => {
                    info!(
                        component = "dispatch",
                        request_id = %ctx.request_id,
                        account_id = %selection.account.id,
                        upstream_status = status.as_u16(),
                        switch_count,
                        "failover"
                    );
                    metrics::counter!("ferry_failovers_total").increment(1);
                    ctx.blacklist.insert(selection.account.id.clone());
                    switch_count += 1;
                    last_failure = Some(LastFailure {
                        status: status.as_u16(),
                        body: text,
                        platform: selection.account.platform.as_str(),
                    });
                    drop(lease);
                    account_permit.release();
                    continue;
                },
                Disposition::Terminal => {
                    metrics::counter!("ferry_upstream_errors_total").increment(1);
                    log_outcome(&ctx, &selection, switch_count, status.as_u16());
                    drop(lease);
                    account_permit.release();
                    return classified.error.into_response();
                },
            }
        }

        // Success.
        state.pool.record_success(&lease);
        log_outcome(&ctx, &selection, switch_count, status.as_u16());

        return if ctx.stream {
            relay_stream(
                &state,
                &ctx,
                &selection,
                resp,
                lease,
                account_permit,
                user_permit,
            )
        } else {
            buffered_response(
                &state,
                &ctx,
                &selection,
                resp,
                lease,
                account_permit,
                user_permit,
            )
            .await
        };
    }

    exhausted_response(&state, &ctx, last_failure, switch_count)
}

/// No schedulable account is left: 503 when nothing was attempted, the
/// (passthrough-resolved) last upstream failure otherwise.
fn exhausted_response(
    state: &AppState,
    ctx: &RequestContext,
    last_failure: Option<LastFailure>,
    switch_count: u32,
) -> Response {
    let Some(failure) = last_failure else {
        info!(
            component = "dispatch",
            request_id = %ctx.request_id,
            user_id = %ctx.caller.user_id,
            model = %ctx.model,
            "no available account"
        );
        return ApiError::service_unavailable("no available account").into_response();
    };

    let (status, payload, skip_monitoring) =
        state
            .classifier
            .finalize(failure.platform, failure.status, &failure.body);
    if !skip_monitoring {
        metrics::counter!("ferry_upstream_errors_total").increment(1);
    }
    info!(
        component = "dispatch",
        request_id = %ctx.request_id,
        user_id = %ctx.caller.user_id,
        model = %ctx.model,
        upstream_status = failure.status,
        switch_count,
        "failover exhausted"
    );
    (status, Json(payload)).into_response()
}

/// Buffered (non-streaming) success path.
async fn buffered_response(
    state: &AppState,
    ctx: &RequestContext,
    selection: &Selection,
    resp: reqwest::Response,
    lease: ferry_upstream::ClientLease,
    account_permit: ferry_concurrency::SlotPermit,
    user_permit: ferry_concurrency::SlotPermit,
) -> Response {
    let status = resp.status();
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(
                component = "dispatch",
                request_id = %ctx.request_id,
                account_id = %selection.account.id,
                error = %err,
                "upstream body read failed"
            );
            state
                .scheduler
                .report_outcome(&selection.account.id, false, None);
            drop(lease);
            account_permit.release();
            user_permit.release();
            return ApiError::upstream(
                StatusCode::BAD_GATEWAY,
                "upstream connection failed while reading the response",
            )
            .into_response();
        },
    };
    ctx.timings.mark_response();

    if let Some(response_id) = find_response_id(&bytes) {
        state
            .sticky
            .bind_response(&response_id, &selection.account.id, RESPONSE_ID_TTL);
    }
    state
        .scheduler
        .report_outcome(&selection.account.id, true, None);

    drop(lease);
    account_permit.release();

    let (input_tokens, output_tokens) = extract_usage(&bytes);
    state
        .usage
        .submit_or_run(usage_record(ctx, &selection.account.id, input_tokens, output_tokens))
        .await;
    user_permit.release();

    info!(
        component = "dispatch",
        request_id = %ctx.request_id,
        account_id = %selection.account.id,
        response_ms = ctx.timings.response_ms(),
        "response delivered"
    );

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming success path: the upstream body is relayed with backpressure
/// (each chunk is yielded only as the client drains), keepalive pings
/// cover idle gaps, and a mid-stream failure becomes an in-band SSE
/// `error` event since the 200 is already committed.
fn relay_stream(
    state: &AppState,
    ctx: &RequestContext,
    selection: &Selection,
    resp: reqwest::Response,
    lease: ferry_upstream::ClientLease,
    account_permit: ferry_concurrency::SlotPermit,
    user_permit: ferry_concurrency::SlotPermit,
) -> Response {
    let account_id = selection.account.id.clone();
    let stream_started = Arc::clone(&ctx.stream_started);
    let timings = Arc::clone(&ctx.timings);
    let scheduler = Arc::clone(&state.scheduler);
    let sticky = Arc::clone(&state.sticky);
    let usage = Arc::clone(&state.usage);
    let record = usage_record(ctx, &account_id, None, None);
    let request_id = ctx.request_id.clone();
    let ping_interval =
        Duration::from_secs(state.config.concurrency.ping_interval_seconds.max(1));
    let ping_bytes = Bytes::from(state.config.concurrency.sse_ping_format.clone());

    let stream = async_stream::stream! {
        let mut upstream = resp.bytes_stream();
        let mut failed = false;
        let mut response_id: Option<String> = None;
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = upstream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if !stream_started.swap(true, Ordering::AcqRel) {
                            timings.mark_first_token();
                        }
                        if response_id.is_none() {
                            response_id = find_response_id(&bytes);
                        }
                        yield Ok::<Bytes, std::io::Error>(bytes);
                    },
                    Some(Err(err)) => {
                        warn!(
                            component = "dispatch",
                            request_id = %request_id,
                            account_id = %account_id,
                            error = %err,
                            "upstream failed mid-stream"
                        );
                        failed = true;
                        yield Ok(emit::sse_error_event(
                            ErrorType::Upstream,
                            "upstream connection failed mid-stream",
                        ));
                        break;
                    },
                    None => break,
                },
                _ = ping.tick() => {
                    // Keepalives only once the stream is committed; before
                    // that, errors must still be able to pick a status code.
                    if stream_started.load(Ordering::Acquire) {
                        yield Ok(ping_bytes.clone());
                    }
                },
            }
        }

        timings.mark_response();
        // Client lease first, account slot next, user slot last.
        drop(lease);
        account_permit.release();
        if failed {
            scheduler.report_outcome(&account_id, false, timings.first_token());
        } else {
            scheduler.report_outcome(&account_id, true, timings.first_token());
            if let Some(id) = &response_id {
                sticky.bind_response(id, &account_id, RESPONSE_ID_TTL);
            }
            let mut record = record;
            record.upstream_ms = timings.upstream_ms();
            record.first_token_ms = match timings.first_token_ms() {
                0 => None,
                ms => Some(ms),
            };
            usage.submit_or_run(record).await;
        }
        user_permit.release();
        info!(
            component = "dispatch",
            request_id = %request_id,
            account_id = %account_id,
            response_ms = timings.response_ms(),
            time_to_first_token_ms = timings.first_token_ms(),
            "stream finished"
        );
    };

    emit::sse_response(stream)
}

fn usage_record(
    ctx: &RequestContext,
    account_id: &str,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
) -> UsageRecord {
    UsageRecord {
        request_id: ctx.request_id.clone(),
        user_id: ctx.caller.user_id.clone(),
        api_key_id: ctx.caller.api_key_id.clone(),
        account_id: account_id.to_string(),
        model: ctx.model.clone(),
        transport: ctx.transport.as_str(),
        input_tokens,
        output_tokens,
        upstream_ms: ctx.timings.upstream_ms(),
        first_token_ms: match ctx.timings.first_token_ms() {
            0 => None,
            ms => Some(ms),
        },
    }
}

fn log_outcome(ctx: &RequestContext, selection: &Selection, switch_count: u32, status: u16) {
    info!(
        component = "dispatch",
        request_id = %ctx.request_id,
        user_id = %ctx.caller.user_id,
        api_key_id = %ctx.caller.api_key_id,
        group_id = ctx.caller.group.as_deref(),
        account_id = %selection.account.id,
        model = %ctx.model,
        stream = ctx.stream,
        transport = ctx.transport.as_str(),
        schedule_layer = selection.layer.as_str(),
        candidate_count = selection.candidate_count,
        switch_count,
        upstream_status = status,
        auth_ms = ctx.timings.auth_ms(),
        routing_ms = ctx.timings.routing_ms(),
        upstream_ms = ctx.timings.upstream_ms(),
        "dispatch attempt settled"
    );
}

/// Scan a response body (or the first streamed chunk that carries it) for
/// the server-issued response id.
fn find_response_id(bytes: &[u8]) -> Option<String> {
    const NEEDLE: &[u8] = br#""id":"resp"#;
    const PREFIX_LEN: usize = br#""id":""#.len();
    let pos = bytes.windows(NEEDLE.len()).position(|w| w == NEEDLE)?;
    let rest = &bytes[pos + PREFIX_LEN..];
    let end = rest.iter().position(|&b| b == b'"')?;
    std::str::from_utf8(&rest[..end]).ok().map(String::from)
}

/// Pull token counts out of a buffered response body.
fn extract_usage(bytes: &[u8]) -> (Option<u64>, Option<u64>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return (None, None);
    };
    let usage = &value["usage"];
    (
        usage["input_tokens"].as_u64(),
        usage["output_tokens"].as_u64(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_id_is_found_in_json_bodies() {
        let body = br#"{"id":"resp_6873ab","object":"response","status":"completed"}"#;
        assert_eq!(find_response_id(body).as_deref(), Some("resp_6873ab"));
    }

    #[test]
    fn response_id_is_found_in_sse_chunks() {
        let chunk =
            b"event: response.created\ndata: {\"response\":{\"id\":\"resp_99\",\"object\":\"response\"}}\n\n";
        assert_eq!(find_response_id(chunk).as_deref(), Some("resp_99"));
    }

    #[test]
    fn message_ids_are_not_response_ids() {
        let body = br#"{"id":"msg_123","content":"hi"}"#;
        assert_eq!(find_response_id(body), None);
    }

    #[test]
    fn usage_tokens_are_extracted() {
        let body = br#"{"id":"resp_1","usage":{"input_tokens":12,"output_tokens":34}}"#;
        assert_eq!(extract_usage(body), (Some(12), Some(34)));
    }

    #[test]
    fn missing_usage_yields_none() {
        assert_eq!(extract_usage(br#"{"id":"resp_1"}"#), (None, None));
        assert_eq!(extract_usage(b"not json"), (None, None));
    }
}

//! Dispatcher: admission output in, client response out.
//!
//! Orchestrates pre-charge, channel selection, the plugin chain, upstream
//! dispatch and response relay, with bounded retries and failure
//! classification. Settlement and consumption submission happen exactly
//! once per request, including partial streams and full failures.

use std::collections::HashSet;
use std::future::Future;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;

use crate::adaptor::{
    self, adaptor_for, bedrock::EventStreamDecoder, do_request, read_completion, relay_stream,
    renderer_for_mode, render_completion, ClientRequest, RelayOutcome, StreamTransport,
};
use crate::model::log::RequestLog;
use crate::model::usage::Usage;
use crate::protocol::{self, Completion, CompletionCollector};
use crate::relay::client::{drain_sse_lines, parse_sse_data, retry_delay};
use crate::{config, consume, logger, plugin, text};

use super::error::{FaultClass, RelayError, RelayResult};
use super::meta::RelayMeta;
use super::{precharge, selector};

/// Captured client-request detail for the log writer.
#[derive(Debug, Clone, Default)]
pub struct RequestDetail {
    pub request_body: Option<String>,
}

/// What one successful upstream exchange handed back.
pub enum AttemptSuccess {
    /// Upstream SSE handle, to be wrapped for the streaming client.
    Streamed(reqwest::Response),
    /// Parsed canonical completion (buffered upstream or coalesced stream).
    Buffered(Completion),
    /// Raw passthrough body for the OpenAI-shaped auxiliary modes.
    RawBody(Value, Usage),
}

// ============================================================================
// Retry loop
// ============================================================================

/// Run attempts until success, terminal failure, retry-budget exhaustion,
/// or channel exhaustion. At most `retry_times + 1` attempts. The
/// returned count is the number of retries performed (attempts - 1).
pub async fn run_with_retries<T, F, Fut>(
    meta: &mut RelayMeta,
    retry_times: u32,
    mut attempt: F,
) -> Result<(T, u32), (RelayError, u32)>
where
    F: FnMut(RelayMeta) -> Fut,
    Fut: Future<Output = (RelayMeta, RelayResult<T>)>,
{
    let mut excluded: HashSet<i64> = HashSet::new();
    let mut attempts: u32 = 0;
    let mut last_error: Option<RelayError> = None;

    loop {
        let channel = match selector::select(&meta.original_model, &excluded) {
            Ok(channel) => channel,
            Err(e) => {
                // Prefer the real upstream failure over "no channel" once
                // at least one attempt happened.
                return Err((last_error.unwrap_or(e), attempts.saturating_sub(1)));
            }
        };
        if attempts > 0 {
            meta.retry_at = Some(Utc::now());
            tokio::time::sleep(retry_delay(attempts)).await;
        }
        meta.set_channel(channel.clone());
        attempts += 1;

        let (returned, result) = attempt(meta.clone()).await;
        *meta = returned;
        match result {
            Ok(value) => return Ok((value, attempts - 1)),
            Err(e) => {
                match e.classify() {
                    FaultClass::RetryableChannel => {
                        selector::mark_auto_disabled(channel.id, &e.message());
                    }
                    FaultClass::RetryableRequest => {}
                    _ => return Err((e, attempts - 1)),
                }
                log_retry_attempt(meta, &e, attempts - 1);
                excluded.insert(channel.id);
                last_error = Some(e);
                if attempts > retry_times {
                    return Err((last_error.take().expect("error recorded"), attempts - 1));
                }
            }
        }
    }
}

fn log_retry_attempt(meta: &RelayMeta, error: &RelayError, retries: u32) {
    logger::warn(
        "dispatch",
        &format!(
            "attempt {} on channel {} failed for {}: {}",
            retries + 1,
            meta.channel_id(),
            meta.original_model,
            error.message()
        ),
    );
    if !config::load().log_retry_attempts {
        return;
    }
    let log = RequestLog {
        request_id: format!("{}#{}", meta.request_id, retries),
        group_id: meta.group.id.clone(),
        token_id: meta.token.id,
        token_name: meta.token.name.clone(),
        channel_id: meta.channel_id(),
        model: meta.original_model.clone(),
        actual_model: meta.actual_model.clone(),
        mode: meta.mode,
        code: error.status(),
        created_at: meta
            .retry_at
            .unwrap_or(meta.request_at)
            .timestamp_millis(),
        ttfb_ms: 0,
        latency_ms: 0,
        usage: Usage::default(),
        amount: 0.0,
        retry_count: 0,
        downstream_result: false,
        upstream_id: None,
        request_detail: None,
        response_detail: None,
        client_ip: meta.client_ip.clone(),
    };
    consume::submit(log);
}

// ============================================================================
// Attempt body
// ============================================================================

async fn execute_attempt(
    meta: &RelayMeta,
    request: &ClientRequest,
    upstream_stream: bool,
    client_stream: bool,
) -> RelayResult<AttemptSuccess> {
    let channel = meta.channel.as_ref().expect("channel bound");
    let adaptor = adaptor_for(channel.kind);
    if !adaptor.support_mode(meta.mode) {
        return Err(RelayError::UpstreamStatus {
            status: 503,
            message: format!(
                "channel kind {} cannot serve mode {}",
                channel.kind.as_str(),
                meta.mode.as_str()
            ),
        });
    }

    let mut body = adaptor.convert_request(meta, request).await?;
    plugin::apply_after_convert(meta, &mut body)?;
    let response = do_request(adaptor, meta, &body, upstream_stream).await?;

    if upstream_stream && client_stream {
        return Ok(AttemptSuccess::Streamed(response));
    }
    if upstream_stream {
        // Client wants a buffered reply (stream-fake or raw mismatch):
        // coalesce the whole event stream before anything reaches the
        // client, so decode failures here remain retryable.
        let completion = collect_stream(adaptor, response, meta).await?;
        return Ok(AttemptSuccess::Buffered(completion));
    }
    match request {
        ClientRequest::Raw(_) => {
            let body_text = response
                .text()
                .await
                .map_err(|e| RelayError::Decode(e.to_string()))?;
            let value: Value = serde_json::from_str(&body_text)
                .map_err(|e| RelayError::Decode(format!("bad upstream JSON: {}", e)))?;
            let usage = value
                .get("usage")
                .map(protocol::openai::parse_usage)
                .unwrap_or_default();
            Ok(AttemptSuccess::RawBody(value, usage))
        }
        ClientRequest::Canonical(_) => {
            let completion =
                read_completion(adaptor, response, meta.estimated_usage.input_tokens).await?;
            Ok(AttemptSuccess::Buffered(completion))
        }
    }
}

async fn collect_stream(
    adaptor: &dyn adaptor::Adaptor,
    response: reqwest::Response,
    meta: &RelayMeta,
) -> RelayResult<Completion> {
    let transport = adaptor.stream_transport();
    let mut parser = adaptor.stream_parser();
    let mut collector = CompletionCollector::new();
    let mut byte_stream = response.bytes_stream();
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut frame_decoder = EventStreamDecoder::new();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = chunk.map_err(|e| RelayError::Decode(format!("stream read failed: {}", e)))?;
        let payloads: Vec<String> = match transport {
            StreamTransport::Sse => drain_sse_lines(&mut line_buffer, &bytes)
                .iter()
                .filter_map(|line| parse_sse_data(line).map(|d| d.to_string()))
                .collect(),
            StreamTransport::AwsEventStream => frame_decoder.feed(&bytes),
        };
        for payload in payloads {
            for event in parser.feed(&payload) {
                collector.on_event(&event);
            }
        }
    }
    for event in parser.finish() {
        collector.on_event(&event);
    }
    let mut completion = collector.into_completion();
    if completion.usage.input_tokens == 0 {
        completion.usage.input_tokens = meta.estimated_usage.input_tokens;
        completion.usage.total_tokens = 0;
        completion.usage.finalize_total();
    }
    if completion.usage.output_tokens == 0 && !completion.text.is_empty() {
        completion.usage.output_tokens = text::estimate_tokens_cfg(&completion.text);
        completion.usage.total_tokens = 0;
        completion.usage.finalize_total();
    }
    Ok(completion)
}

// ============================================================================
// Settlement and submission
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn finish_request(
    meta: &RelayMeta,
    settlement: precharge::Settlement,
    usage: Usage,
    code: u16,
    downstream_result: bool,
    retries: u32,
    upstream_id: Option<String>,
    response_detail: Option<String>,
    detail: &RequestDetail,
) {
    let cfg = config::load();
    let now = Utc::now();
    let raw_amount = if (200..300).contains(&code) {
        meta.model_config.price.amount(&usage, now)
    } else {
        0.0
    };
    let ratio = config::consume_level_ratio(&cfg.group_consume_level_ratio, meta.group.used_amount);
    let amount = raw_amount * ratio;
    settlement.commit();

    let log = RequestLog {
        request_id: meta.request_id.clone(),
        group_id: meta.group.id.clone(),
        token_id: meta.token.id,
        token_name: meta.token.name.clone(),
        channel_id: meta.channel_id(),
        model: meta.original_model.clone(),
        actual_model: meta.actual_model.clone(),
        mode: meta.mode,
        code,
        created_at: meta.request_at.timestamp_millis(),
        ttfb_ms: meta.ttfb_ms(),
        latency_ms: (now - meta.request_at).num_milliseconds().max(0),
        usage,
        amount,
        retry_count: retries,
        downstream_result,
        upstream_id,
        request_detail: detail.request_body.clone(),
        response_detail,
        client_ip: meta.client_ip.clone(),
    };
    consume::submit(log);

    if let Some(threshold) = meta.group.balance_alert_threshold {
        let remaining = meta.group.balance - amount;
        if remaining < threshold {
            crate::alert::notify(
                &format!("balance:{}", meta.group.id),
                &format!(
                    "group {} balance {:.4} below alert threshold {:.4}",
                    meta.group.id, remaining, threshold
                ),
            );
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Relay one admitted request to completion.
pub async fn relay(mut meta: RelayMeta, request: ClientRequest, detail: RequestDetail) -> Response {
    let mode = meta.mode;
    let client_stream = request.is_stream();
    let client_max_tokens = match &request {
        ClientRequest::Canonical(req) => req.max_tokens,
        ClientRequest::Raw(body) => body.get("max_tokens").and_then(|v| v.as_i64()),
    };

    let settlement = match precharge::reserve(&meta, client_max_tokens) {
        Ok(settlement) => settlement,
        Err(e) => return e.into_response_for(mode),
    };

    let mut request = request;
    if let Err(e) = plugin::apply_before_convert(&mut meta, &mut request) {
        settlement.refund();
        return e.into_response_for(mode);
    }
    let upstream_stream = request.is_stream();

    let retry_times = config::load().retry_times;
    let request_shared = request.clone();
    let result = run_with_retries(&mut meta, retry_times, move |attempt_meta| {
        let request = request_shared.clone();
        async move {
            let result =
                execute_attempt(&attempt_meta, &request, upstream_stream, client_stream).await;
            (attempt_meta, result)
        }
    })
    .await;

    match result {
        Ok((AttemptSuccess::Streamed(upstream), retries)) => {
            meta.first_byte_at = Some(Utc::now());
            let channel_kind = meta.channel.as_ref().expect("channel bound").kind;
            let adaptor = adaptor_for(channel_kind);
            let meta_done = meta.clone();
            let detail_done = detail.clone();
            let on_complete = Box::new(move |outcome: RelayOutcome| {
                // Bytes reached the client, so even scan errors and
                // partial streams settle as a downstream success.
                finish_request(
                    &meta_done,
                    settlement,
                    outcome.usage,
                    200,
                    true,
                    retries,
                    outcome.upstream_id,
                    Some(outcome.text),
                    &detail_done,
                );
            });
            relay_stream(
                upstream,
                adaptor.stream_transport(),
                adaptor.stream_parser(),
                renderer_for_mode(mode),
                meta.estimated_usage.input_tokens,
                on_complete,
            )
        }
        Ok((AttemptSuccess::Buffered(mut completion), retries)) => {
            meta.first_byte_at = Some(Utc::now());
            plugin::apply_on_completion(&meta, &mut completion);
            let usage = completion.usage;
            let upstream_id = if completion.id.is_empty() {
                None
            } else {
                Some(completion.id.clone())
            };
            let body = render_completion(mode, &completion);
            finish_request(
                &meta,
                settlement,
                usage,
                200,
                true,
                retries,
                upstream_id,
                Some(text::truncate(&completion.text, 4096).to_string()),
                &detail,
            );
            json_response(body)
        }
        Ok((AttemptSuccess::RawBody(body, usage), retries)) => {
            meta.first_byte_at = Some(Utc::now());
            finish_request(&meta, settlement, usage, 200, true, retries, None, None, &detail);
            json_response(body)
        }
        Err((error, retries)) => {
            settlement.refund();
            finish_request_failed(&meta, &error, retries, &detail);
            error.into_response_for(mode)
        }
    }
}

fn finish_request_failed(
    meta: &RelayMeta,
    error: &RelayError,
    retries: u32,
    detail: &RequestDetail,
) {
    let now = Utc::now();
    let log = RequestLog {
        request_id: meta.request_id.clone(),
        group_id: meta.group.id.clone(),
        token_id: meta.token.id,
        token_name: meta.token.name.clone(),
        channel_id: meta.channel_id(),
        model: meta.original_model.clone(),
        actual_model: meta.actual_model.clone(),
        mode: meta.mode,
        code: error.status(),
        created_at: meta.request_at.timestamp_millis(),
        ttfb_ms: meta.ttfb_ms(),
        latency_ms: (now - meta.request_at).num_milliseconds().max(0),
        usage: Usage::default(),
        amount: 0.0,
        retry_count: retries,
        downstream_result: false,
        upstream_id: None,
        request_detail: detail.request_body.clone(),
        response_detail: Some(text::truncate(&error.message(), 2048).to_string()),
        client_ip: meta.client_ip.clone(),
    };
    consume::submit(log);
}

fn json_response(body: Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use crate::model::entity::{ChannelKind, Mode};
    use crate::relay::admission::test_support;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    // The cache is process-global and install() replaces it wholesale, so
    // the tests that use it must not interleave.
    static CACHE_GATE: Mutex<()> = Mutex::new(());

    fn hold_cache() -> MutexGuard<'static, ()> {
        CACHE_GATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install_channels(model: &str, ids: &[i64]) {
        let channels = ids
            .iter()
            .map(|id| test_support::channel(*id, ChannelKind::OpenAi, "https://example.com", model))
            .collect();
        cache::install(channels, vec![(*test_support::model_config(model, Mode::ChatCompletions)).clone()]);
    }

    fn meta_for_model(model: &str) -> RelayMeta {
        RelayMeta::new(
            test_support::group("g-dispatch"),
            test_support::token("g-dispatch"),
            model,
            Mode::ChatCompletions,
            test_support::model_config(model, Mode::ChatCompletions),
            "/v1/chat/completions",
            None,
        )
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts() {
        let _cache = hold_cache();
        selector::reset_auto_disabled();
        let model = "retry-budget-model";
        install_channels(model, &[11, 12, 13, 14, 15]);
        let mut meta = meta_for_model(model);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<((), u32), _> = run_with_retries(&mut meta, 2, move |m| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (
                    m,
                    Err(RelayError::UpstreamStatus {
                        status: 500,
                        message: "boom".to_string(),
                    }),
                )
            }
        })
        .await;
        let (error, retries) = result.unwrap_err();
        // RetryTimes = 2 means exactly 3 attempts.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
        assert!(matches!(error, RelayError::UpstreamStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn channel_faults_auto_disable_and_move_on() {
        let _cache = hold_cache();
        selector::reset_auto_disabled();
        let model = "auto-disable-model";
        install_channels(model, &[21, 22]);
        let mut meta = meta_for_model(model);
        let result: Result<(i64, u32), _> = run_with_retries(&mut meta, 3, |m| async move {
            let channel_id = m.channel_id();
            if channel_id == 21 {
                return (m, Err(RelayError::ConnectFailed("refused".to_string())));
            }
            (m, Ok(channel_id))
        })
        .await;
        let (served, retries) = result.unwrap();
        assert_eq!(served, 22);
        // The selector may have drawn 22 first; only a retried run proves
        // the auto-disable side effect.
        if retries == 1 {
            assert!(selector::is_auto_disabled(21));
        }
        selector::reset_auto_disabled();
    }

    #[tokio::test]
    async fn terminal_errors_stop_immediately() {
        let _cache = hold_cache();
        selector::reset_auto_disabled();
        let model = "terminal-model";
        install_channels(model, &[31, 32, 33]);
        let mut meta = meta_for_model(model);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<((), u32), _> = run_with_retries(&mut meta, 5, move |m| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (
                    m,
                    Err(RelayError::UpstreamStatus {
                        status: 422,
                        message: "bad schema".to_string(),
                    }),
                )
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_channels_surfaces_last_upstream_error() {
        let _cache = hold_cache();
        selector::reset_auto_disabled();
        let model = "exhaust-model";
        install_channels(model, &[41, 42]);
        let mut meta = meta_for_model(model);
        let result: Result<((), u32), _> = run_with_retries(&mut meta, 9, |m| async move {
            (
                m,
                Err(RelayError::UpstreamStatus {
                    status: 503,
                    message: "down".to_string(),
                }),
            )
        })
        .await;
        let (error, retries) = result.unwrap_err();
        // Two channels, both tried and excluded; the 503 survives rather
        // than a generic no-channel error.
        assert_eq!(retries, 1);
        assert!(matches!(error, RelayError::UpstreamStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn no_channel_at_all_reports_no_channel() {
        let _cache = hold_cache();
        selector::reset_auto_disabled();
        let model = "empty-model";
        cache::install(Vec::new(), Vec::new());
        let mut meta = meta_for_model(model);
        let result: Result<((), u32), _> =
            run_with_retries(&mut meta, 2, |m| async move { (m, Ok(())) }).await;
        // No channels configured: the attempt closure never runs.
        let (error, retries) = result.unwrap_err();
        assert_eq!(retries, 0);
        assert!(matches!(error, RelayError::NoChannelAvailable(_)));
    }
}

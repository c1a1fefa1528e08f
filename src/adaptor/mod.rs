//! Upstream adaptors.
//!
//! Each adaptor covers one upstream kind: URL construction, credentials,
//! request conversion from the canonical form, and the response side
//! (buffered parse or streaming transport + scanner). The response relay
//! driver here is shared: it pumps upstream bytes through the adaptor's
//! scanner and the client-mode renderer, accounts usage, and reports a
//! summary when the stream ends.

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod openai;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::model::entity::{ChannelKind, Mode};
use crate::model::usage::Usage;
use crate::protocol::{
    self, Completion, FinishReason, MessagePart, RelayRequest, SseParser, SseRenderer, StreamEvent,
};
use crate::relay::client::{
    default_client, drain_sse_lines, map_transport_error, parse_sse_data, streaming_client,
};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::RelayMeta;
use crate::{logger, text};

/// Client request as the dispatcher carries it: canonical for chat-like
/// modes, raw passthrough for the OpenAI-shaped auxiliary endpoints.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Canonical(RelayRequest),
    Raw(Value),
}

impl ClientRequest {
    pub fn is_stream(&self) -> bool {
        match self {
            ClientRequest::Canonical(req) => req.stream,
            ClientRequest::Raw(body) => body
                .get("stream")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }
}

/// How the upstream frames its streaming body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransport {
    Sse,
    /// AWS event-stream binary framing (Bedrock).
    AwsEventStream,
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn support_mode(&self, mode: Mode) -> bool;

    /// Full request URL for this attempt.
    fn request_url(&self, meta: &RelayMeta, stream: bool) -> String;

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap);

    /// Convert the client request into this upstream's body. Async because
    /// remote image URLs may need fetching.
    async fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &ClientRequest,
    ) -> RelayResult<Value>;

    fn stream_transport(&self) -> StreamTransport {
        StreamTransport::Sse
    }

    fn stream_parser(&self) -> Box<dyn SseParser>;

    fn parse_completion(&self, body: &Value) -> Completion;

    /// Map a non-success upstream status into the relay taxonomy. 401/403
    /// are channel credential faults.
    fn upstream_error(&self, status: u16, body: &str) -> RelayError {
        match status {
            401 | 403 => RelayError::UpstreamAuth(body.to_string()),
            _ => RelayError::UpstreamStatus {
                status,
                message: body.to_string(),
            },
        }
    }
}

static OPENAI: openai::OpenAiAdaptor = openai::OpenAiAdaptor;
static ANTHROPIC: anthropic::AnthropicAdaptor = anthropic::AnthropicAdaptor;
static GEMINI: gemini::GeminiAdaptor = gemini::GeminiAdaptor;
static BEDROCK: bedrock::BedrockAdaptor = bedrock::BedrockAdaptor;

pub fn adaptor_for(kind: ChannelKind) -> &'static dyn Adaptor {
    match kind {
        ChannelKind::OpenAi => &OPENAI,
        ChannelKind::Anthropic => &ANTHROPIC,
        ChannelKind::Gemini => &GEMINI,
        ChannelKind::BedrockClaude => &BEDROCK,
    }
}

// ============================================================================
// Client-mode dispatch
// ============================================================================

/// Parse a client body into the canonical request. Gemini carries model
/// and stream flag in the URL rather than the body.
pub fn parse_client_request(
    mode: Mode,
    body: &Value,
    url_model: Option<&str>,
    url_stream: bool,
) -> RelayResult<RelayRequest> {
    let parsed = match mode {
        Mode::ChatCompletions => protocol::openai::parse_request(body),
        Mode::Anthropic => protocol::anthropic::parse_request(body),
        Mode::Gemini => {
            protocol::gemini::parse_request(body, url_model.unwrap_or_default(), url_stream)
        }
        Mode::Responses => protocol::responses::parse_request(body),
        other => Err(format!("mode {} is not canonical", other.as_str())),
    };
    parsed.map_err(RelayError::InvalidRequest)
}

pub fn renderer_for_mode(mode: Mode) -> Box<dyn SseRenderer> {
    match mode {
        Mode::Anthropic => Box::new(protocol::anthropic::StreamRenderer::new()),
        Mode::Gemini => Box::new(protocol::gemini::StreamRenderer::new()),
        Mode::Responses => Box::new(protocol::responses::StreamRenderer::new()),
        _ => Box::new(protocol::openai::StreamRenderer::new()),
    }
}

pub fn render_completion(mode: Mode, completion: &Completion) -> Value {
    match mode {
        Mode::Anthropic => protocol::anthropic::render_response(completion),
        Mode::Gemini => protocol::gemini::render_response(completion),
        Mode::Responses => protocol::responses::render_response(completion),
        _ => protocol::openai::render_response(completion),
    }
}

// ============================================================================
// Image resolution
// ============================================================================

/// At most three image fetches in flight across all requests.
static IMAGE_FETCH: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(3)));

/// Replace remote image URLs with data URLs for upstreams that need
/// inline bytes. Fetch failures fail the request with a descriptive 400.
pub async fn resolve_images(request: &mut RelayRequest) -> RelayResult<()> {
    for message in &mut request.messages {
        for part in &mut message.parts {
            let MessagePart::ImageUrl(url) = part else {
                continue;
            };
            if !url.starts_with("http://") && !url.starts_with("https://") {
                continue;
            }
            let data_url = fetch_image_as_data_url(url).await?;
            *part = MessagePart::ImageUrl(data_url);
        }
    }
    Ok(())
}

async fn fetch_image_as_data_url(url: &str) -> RelayResult<String> {
    use base64::Engine;
    let _permit = IMAGE_FETCH
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| RelayError::Internal("image fetch semaphore closed".to_string()))?;
    let client = default_client()?;
    let response = client.get(url).send().await.map_err(|e| {
        RelayError::InvalidRequest(format!("failed to fetch image {}: {}", url, e))
    })?;
    if !response.status().is_success() {
        return Err(RelayError::InvalidRequest(format!(
            "failed to fetch image {}: upstream returned {}",
            url,
            response.status()
        )));
    }
    let media_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    let bytes = response.bytes().await.map_err(|e| {
        RelayError::InvalidRequest(format!("failed to read image {}: {}", url, e))
    })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", media_type, encoded))
}

// ============================================================================
// Upstream dispatch
// ============================================================================

/// POST the converted body. Non-success statuses become relay errors with
/// a truncated body excerpt; nothing has been sent to the client yet.
pub async fn do_request(
    adaptor: &dyn Adaptor,
    meta: &RelayMeta,
    body: &Value,
    stream: bool,
) -> RelayResult<reqwest::Response> {
    let client = if stream {
        streaming_client()?
    } else {
        default_client()?
    };
    let url = adaptor.request_url(meta, stream);
    let mut headers = HeaderMap::new();
    adaptor.setup_headers(meta, &mut headers);
    logger::debug(
        "adaptor",
        &format!("dispatch {} {} (stream={})", adaptor.kind().as_str(), url, stream),
    );
    let response = client
        .post(&url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(map_transport_error)?;
    let status = response.status();
    if !status.is_success() {
        let text_body = response.text().await.unwrap_or_default();
        let excerpt = text::truncate(&text_body, 500).to_string();
        return Err(adaptor.upstream_error(status.as_u16(), &excerpt));
    }
    Ok(response)
}

// ============================================================================
// Response relay
// ============================================================================

/// What one upstream exchange produced, reported after the response body
/// is fully relayed (or cut short).
#[derive(Debug, Clone, Default)]
pub struct RelayOutcome {
    pub usage: Usage,
    pub finish: FinishReason,
    pub upstream_id: Option<String>,
    /// Accumulated visible text, used for detail capture and estimation.
    pub text: String,
    /// The scanner hit an error after bytes had been forwarded.
    pub scan_error: bool,
    /// The client went away before the stream completed.
    pub client_gone: bool,
}

struct StreamAccounting {
    outcome: RelayOutcome,
    reasoning: String,
    estimated_input: i64,
    saw_usage: bool,
}

impl StreamAccounting {
    fn new(estimated_input: i64) -> Self {
        Self {
            outcome: RelayOutcome::default(),
            reasoning: String::new(),
            estimated_input,
            saw_usage: false,
        }
    }

    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Start { id, input_tokens, .. } => {
                if !id.is_empty() {
                    self.outcome.upstream_id = Some(id.clone());
                }
                if *input_tokens > 0 {
                    self.outcome.usage.input_tokens = *input_tokens;
                }
            }
            StreamEvent::TextDelta(text) => self.outcome.text.push_str(text),
            StreamEvent::ReasoningDelta(text) => self.reasoning.push_str(text),
            StreamEvent::Finish { reason, usage } => {
                self.outcome.finish = *reason;
                if let Some(usage) = usage {
                    let input = self.outcome.usage.input_tokens;
                    self.outcome.usage = *usage;
                    if self.outcome.usage.input_tokens == 0 {
                        self.outcome.usage.input_tokens = input;
                    }
                    self.saw_usage = true;
                }
            }
            _ => {}
        }
    }

    /// Fill estimation fallbacks for anything upstream never reported.
    fn finalize(mut self) -> RelayOutcome {
        if self.outcome.usage.input_tokens == 0 {
            self.outcome.usage.input_tokens = self.estimated_input;
        }
        if !self.saw_usage && self.outcome.usage.output_tokens == 0 {
            let mut visible = self.outcome.text.clone();
            visible.push_str(&self.reasoning);
            self.outcome.usage.output_tokens = text::estimate_tokens_cfg(&visible);
        }
        self.outcome.usage.total_tokens = 0;
        self.outcome.usage.finalize_total();
        self.outcome
    }
}

/// Relay an upstream streaming body to the client.
///
/// Spawns a pump task so client disconnects propagate: when the receiver
/// side is dropped, the pump stops and the upstream connection is dropped
/// with it. `on_complete` always runs exactly once with the final
/// accounting, including partial results.
pub fn relay_stream(
    upstream: reqwest::Response,
    transport: StreamTransport,
    mut parser: Box<dyn SseParser>,
    mut renderer: Box<dyn SseRenderer>,
    estimated_input: i64,
    on_complete: Box<dyn FnOnce(RelayOutcome) + Send>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(32);

    tokio::spawn(async move {
        let mut accounting = StreamAccounting::new(estimated_input);
        let mut byte_stream = upstream.bytes_stream();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut frame_decoder = bedrock::EventStreamDecoder::new();
        let mut client_gone = false;

        'pump: while let Some(chunk) = byte_stream.next().await {
            let payloads: Vec<String> = match chunk {
                Ok(bytes) => match transport {
                    StreamTransport::Sse => drain_sse_lines(&mut line_buffer, &bytes)
                        .iter()
                        .filter_map(|line| parse_sse_data(line).map(|d| d.to_string()))
                        .collect(),
                    StreamTransport::AwsEventStream => frame_decoder.feed(&bytes),
                },
                Err(e) => {
                    // Mid-stream upstream fault: surface one protocol-shaped
                    // error frame, then terminate. Bytes already sent count
                    // as a partial success.
                    logger::error("adaptor", &format!("stream read error: {}", e));
                    accounting.outcome.scan_error = true;
                    for frame in renderer.render_error(502, &format!("upstream stream error: {}", e))
                    {
                        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    break 'pump;
                }
            };
            for payload in payloads {
                for event in parser.feed(&payload) {
                    accounting.observe(&event);
                    for frame in renderer.render(&event) {
                        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            client_gone = true;
                            break 'pump;
                        }
                    }
                }
            }
        }

        if !client_gone {
            for event in parser.finish() {
                accounting.observe(&event);
                for frame in renderer.render(&event) {
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
            }
        }

        let mut outcome = accounting.finalize();
        outcome.client_gone = client_gone;
        on_complete(outcome);
    });

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|e| {
            logger::error("adaptor", &format!("failed to build stream response: {}", e));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

use axum::response::IntoResponse;

/// Read and parse a buffered upstream response into canonical form, with
/// estimation fallbacks applied.
pub async fn read_completion(
    adaptor: &dyn Adaptor,
    response: reqwest::Response,
    estimated_input: i64,
) -> RelayResult<Completion> {
    let body_text = response
        .text()
        .await
        .map_err(|e| RelayError::Decode(format!("failed to read upstream body: {}", e)))?;
    let body: Value = serde_json::from_str(&body_text).map_err(|e| {
        RelayError::Decode(format!(
            "failed to parse upstream body: {} ({})",
            e,
            text::truncate(&body_text, 200)
        ))
    })?;
    let mut completion = adaptor.parse_completion(&body);
    if completion.usage.input_tokens == 0 {
        completion.usage.input_tokens = estimated_input;
    }
    if completion.usage.output_tokens == 0 && !completion.text.is_empty() {
        completion.usage.output_tokens = text::estimate_tokens_cfg(&completion.text);
    }
    completion.usage.total_tokens = 0;
    completion.usage.finalize_total();
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptor_registry_covers_all_kinds() {
        for kind in [
            ChannelKind::OpenAi,
            ChannelKind::Anthropic,
            ChannelKind::Gemini,
            ChannelKind::BedrockClaude,
        ] {
            assert_eq!(adaptor_for(kind).kind(), kind);
        }
    }

    #[test]
    fn accounting_falls_back_to_estimates() {
        let mut accounting = StreamAccounting::new(42);
        accounting.observe(&StreamEvent::Start {
            id: "u1".to_string(),
            model: "m".to_string(),
            input_tokens: 0,
        });
        accounting.observe(&StreamEvent::TextDelta("hello world".to_string()));
        accounting.observe(&StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: None,
        });
        let outcome = accounting.finalize();
        assert_eq!(outcome.usage.input_tokens, 42);
        assert!(outcome.usage.output_tokens > 0);
        assert_eq!(
            outcome.usage.total_tokens,
            outcome.usage.input_tokens + outcome.usage.output_tokens
        );
        assert_eq!(outcome.upstream_id.as_deref(), Some("u1"));
    }

    #[test]
    fn accounting_prefers_upstream_usage() {
        let mut accounting = StreamAccounting::new(42);
        accounting.observe(&StreamEvent::Finish {
            reason: FinishReason::Stop,
            usage: Some(Usage::new(10, 5)),
        });
        let outcome = accounting.finalize();
        assert_eq!(outcome.usage.input_tokens, 10);
        assert_eq!(outcome.usage.output_tokens, 5);
        assert_eq!(outcome.usage.total_tokens, 15);
    }
}

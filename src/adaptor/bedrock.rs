//! Bedrock-hosted Claude upstream adaptor.
//!
//! The body is the Anthropic shape with `anthropic_version` pinned to the
//! Bedrock revision and the `model`/`stream` fields moved into the URL.
//! Auth uses a Bedrock API key as a bearer token; SigV4 signing is out of
//! scope. Streaming responses use AWS event-stream binary framing whose
//! payloads are base64-wrapped Anthropic SSE events, so the scanner is the
//! Anthropic one behind a frame decoder.

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::model::entity::{ChannelKind, Mode};
use crate::protocol::{self, Completion, SseParser};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::RelayMeta;

use super::{resolve_images, Adaptor, ClientRequest, StreamTransport};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub struct BedrockAdaptor;

fn base_url(meta: &RelayMeta) -> String {
    meta.channel
        .as_ref()
        .map(|c| c.base_url.trim_end_matches('/').to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Adaptor for BedrockAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::BedrockClaude
    }

    fn support_mode(&self, mode: Mode) -> bool {
        matches!(
            mode,
            Mode::ChatCompletions | Mode::Anthropic | Mode::Gemini | Mode::Responses
        )
    }

    fn request_url(&self, meta: &RelayMeta, stream: bool) -> String {
        let action = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        format!("{}/model/{}/{}", base_url(meta), meta.actual_model, action)
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) {
        if let Some(channel) = &meta.channel {
            if !channel.key.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", channel.key)) {
                    headers.insert("authorization", value);
                }
            }
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
    }

    async fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &ClientRequest,
    ) -> RelayResult<Value> {
        let ClientRequest::Canonical(req) = request else {
            return Err(RelayError::InvalidRequest(
                "bedrock upstream only serves chat-shaped requests".to_string(),
            ));
        };
        let mut req = req.clone();
        req.scrub_capabilities(meta.model_config.max_output_tokens.max(1));
        resolve_images(&mut req).await?;
        let mut body = protocol::anthropic::render_request(&req, &meta.actual_model);
        if let Some(obj) = body.as_object_mut() {
            // Model and stream flag travel in the URL on Bedrock.
            obj.remove("model");
            obj.remove("stream");
            obj.insert(
                "anthropic_version".to_string(),
                Value::String(BEDROCK_ANTHROPIC_VERSION.to_string()),
            );
        }
        Ok(body)
    }

    fn stream_transport(&self) -> StreamTransport {
        StreamTransport::AwsEventStream
    }

    fn stream_parser(&self) -> Box<dyn SseParser> {
        Box::new(protocol::anthropic::StreamParser::new())
    }

    fn parse_completion(&self, body: &Value) -> Completion {
        protocol::anthropic::parse_response(body)
    }
}

// ============================================================================
// AWS event-stream framing
// ============================================================================

/// Incremental decoder for AWS event-stream frames.
///
/// Frame layout: 4B total length (BE), 4B headers length (BE), 4B prelude
/// CRC, headers, payload, 4B message CRC. The payload is JSON whose
/// `bytes` field holds a base64-encoded Anthropic event. CRCs are not
/// validated; a malformed frame ends the stream (partial success).
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    poisoned: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            poisoned: false,
        }
    }

    /// Feed raw bytes; returns the decoded event payloads (JSON text of
    /// the inner Anthropic events) for every complete frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.poisoned {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buffer.len() < 16 {
                break;
            }
            let total_len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            let headers_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if total_len < 16 + headers_len || total_len > 16 * 1024 * 1024 {
                self.poisoned = true;
                break;
            }
            if self.buffer.len() < total_len {
                break;
            }
            let payload_start = 12 + headers_len;
            let payload_end = total_len - 4;
            if payload_start <= payload_end {
                let payload = &self.buffer[payload_start..payload_end];
                if let Some(event) = decode_frame_payload(payload) {
                    out.push(event);
                }
            }
            self.buffer.drain(..total_len);
        }
        out
    }
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_frame_payload(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let encoded = value.get("bytes")?.as_str()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one event-stream frame around an inner JSON event.
    pub fn frame_for(event: &str) -> Vec<u8> {
        let inner = base64::engine::general_purpose::STANDARD.encode(event.as_bytes());
        let payload = format!("{{\"bytes\":\"{}\"}}", inner);
        let headers: &[u8] = &[];
        let total_len = 16 + headers.len() + payload.len();
        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(headers);
        frame.extend_from_slice(payload.as_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame
    }

    #[test]
    fn decoder_handles_split_frames() {
        let event = r#"{"type":"message_stop"}"#;
        let frame = frame_for(event);
        let mut decoder = EventStreamDecoder::new();
        let (head, tail) = frame.split_at(7);
        assert!(decoder.feed(head).is_empty());
        let decoded = decoder.feed(tail);
        assert_eq!(decoded, vec![event.to_string()]);
    }

    #[test]
    fn decoder_handles_back_to_back_frames() {
        let a = r#"{"type":"message_start","message":{}}"#;
        let b = r#"{"type":"message_stop"}"#;
        let mut bytes = frame_for(a);
        bytes.extend_from_slice(&frame_for(b));
        let mut decoder = EventStreamDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], a);
        assert_eq!(decoded[1], b);
    }

    #[test]
    fn decoder_poisons_on_garbage() {
        let mut decoder = EventStreamDecoder::new();
        let garbage = [0xFFu8; 32];
        assert!(decoder.feed(&garbage).is_empty());
        assert!(decoder.feed(&frame_for("{}")).is_empty());
    }

    #[tokio::test]
    async fn convert_strips_model_and_adds_version() {
        let adaptor = BedrockAdaptor;
        let meta = crate::relay::admission::test_support::meta_for(
            Mode::Gemini,
            ChannelKind::BedrockClaude,
            "https://bedrock-runtime.us-east-1.amazonaws.com",
        );
        let req = crate::protocol::RelayRequest {
            model: "claude-3-5".to_string(),
            stream: true,
            messages: vec![crate::protocol::Message {
                role: crate::protocol::Role::User,
                parts: vec![crate::protocol::MessagePart::Text("ping".to_string())],
                reasoning: None,
            }],
            ..Default::default()
        };
        let body = adaptor
            .convert_request(&meta, &ClientRequest::Canonical(req))
            .await
            .unwrap();
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["anthropic_version"], BEDROCK_ANTHROPIC_VERSION);
        assert_eq!(body["max_tokens"], protocol::anthropic::DEFAULT_MAX_TOKENS);
    }
}

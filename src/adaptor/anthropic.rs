//! Anthropic Messages upstream adaptor.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::model::entity::{ChannelKind, Mode};
use crate::protocol::{self, Completion, SseParser};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::RelayMeta;

use super::{resolve_images, Adaptor, ClientRequest};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdaptor;

fn base_url(meta: &RelayMeta) -> String {
    meta.channel
        .as_ref()
        .map(|c| c.base_url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "https://api.anthropic.com".to_string())
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Anthropic
    }

    fn support_mode(&self, mode: Mode) -> bool {
        matches!(
            mode,
            Mode::ChatCompletions | Mode::Anthropic | Mode::Gemini | Mode::Responses
        )
    }

    fn request_url(&self, meta: &RelayMeta, _stream: bool) -> String {
        format!("{}/v1/messages", base_url(meta))
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) {
        if let Some(channel) = &meta.channel {
            if !channel.key.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&channel.key) {
                    headers.insert("x-api-key", value);
                }
            }
        }
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }

    async fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &ClientRequest,
    ) -> RelayResult<Value> {
        let ClientRequest::Canonical(req) = request else {
            return Err(RelayError::InvalidRequest(
                "anthropic upstream only serves chat-shaped requests".to_string(),
            ));
        };
        let mut req = req.clone();
        req.scrub_capabilities(meta.model_config.max_output_tokens.max(1));
        resolve_images(&mut req).await?;
        Ok(protocol::anthropic::render_request(&req, &meta.actual_model))
    }

    fn stream_parser(&self) -> Box<dyn SseParser> {
        Box::new(protocol::anthropic::StreamParser::new())
    }

    fn parse_completion(&self, body: &Value) -> Completion {
        protocol::anthropic::parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, MessagePart, RelayRequest, Role, ThinkingOptions};

    #[tokio::test]
    async fn convert_scrubs_thinking_temperature() {
        let adaptor = AnthropicAdaptor;
        let meta = crate::relay::admission::test_support::meta_for(
            Mode::Anthropic,
            ChannelKind::Anthropic,
            "https://api.anthropic.com",
        );
        let req = RelayRequest {
            model: "claude-3-5".to_string(),
            temperature: Some(0.9),
            max_tokens: Some(8192),
            thinking: Some(ThinkingOptions {
                enabled: true,
                budget_tokens: Some(2048),
            }),
            messages: vec![Message {
                role: Role::User,
                parts: vec![MessagePart::Text("hi".to_string())],
                reasoning: None,
            }],
            ..Default::default()
        };
        let body = adaptor
            .convert_request(&meta, &ClientRequest::Canonical(req))
            .await
            .unwrap();
        assert!(body.get("temperature").is_none());
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert_eq!(body["model"], meta.actual_model);
    }
}

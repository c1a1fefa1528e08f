//! Gemini (Generative Language API) upstream adaptor.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::model::entity::{ChannelKind, Mode};
use crate::protocol::{self, Completion, SseParser};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::RelayMeta;

use super::{resolve_images, Adaptor, ClientRequest};

pub struct GeminiAdaptor;

fn base_url(meta: &RelayMeta) -> String {
    meta.channel
        .as_ref()
        .map(|c| c.base_url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Gemini
    }

    fn support_mode(&self, mode: Mode) -> bool {
        matches!(
            mode,
            Mode::ChatCompletions | Mode::Anthropic | Mode::Gemini | Mode::Responses
        )
    }

    fn request_url(&self, meta: &RelayMeta, stream: bool) -> String {
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/v1beta/models/{}:{}",
            base_url(meta),
            meta.actual_model,
            action
        )
    }

    fn setup_headers(&self, meta: &RelayMeta, headers: &mut HeaderMap) {
        if let Some(channel) = &meta.channel {
            if !channel.key.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&channel.key) {
                    headers.insert("x-goog-api-key", value);
                }
            }
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
    }

    async fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &ClientRequest,
    ) -> RelayResult<Value> {
        let ClientRequest::Canonical(req) = request else {
            return Err(RelayError::InvalidRequest(
                "gemini upstream only serves chat-shaped requests".to_string(),
            ));
        };
        let mut req = req.clone();
        req.scrub_capabilities(meta.model_config.max_output_tokens.max(1));
        resolve_images(&mut req).await?;
        Ok(protocol::gemini::render_request(&req))
    }

    fn stream_parser(&self) -> Box<dyn SseParser> {
        Box::new(protocol::gemini::StreamParser::new())
    }

    fn parse_completion(&self, body: &Value) -> Completion {
        protocol::gemini::parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_switches_on_stream() {
        let adaptor = GeminiAdaptor;
        let meta = crate::relay::admission::test_support::meta_for(
            Mode::Gemini,
            ChannelKind::Gemini,
            "https://generativelanguage.googleapis.com",
        );
        let buffered = adaptor.request_url(&meta, false);
        let streaming = adaptor.request_url(&meta, true);
        assert!(buffered.ends_with(":generateContent"));
        assert!(streaming.ends_with(":streamGenerateContent?alt=sse"));
    }
}

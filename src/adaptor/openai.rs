//! OpenAI-compatible upstream adaptor. Also carries the OpenAI-shaped
//! auxiliary endpoints (embeddings, images, audio, rerank) as passthrough
//! bodies with the model name rewritten.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::model::entity::{ChannelKind, Mode};
use crate::protocol::{self, Completion, SseParser};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::RelayMeta;

use super::{Adaptor, ClientRequest};

pub struct OpenAiAdaptor;

fn base_url(meta: &RelayMeta) -> String {
    meta.channel
        .as_ref()
        .map(|c| c.base_url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "https://api.openai.com".to_string())
}

fn path_for_mode(mode: Mode) -> &'static str {
    match mode {
        Mode::Embeddings => "/v1/embeddings",
        Mode::Image => "/v1/images/generations",
        Mode::Audio => "/v1/audio/speech",
        Mode::Rerank => "/v1/rerank",
        Mode::Completions => "/v1/completions",
        _ => "/v1/chat/completions",
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::OpenAi
    }

    fn support_mode(&self, _mode: Mode) -> bool {
        // Every client shape converts to (or passes through as) an
        // OpenAI-compatible body.
        true
    }

    fn request_url(&self, meta: &RelayMeta, _stream: bool) -> String {
        format!("{}{}", base_url(meta), path_for_mode(meta.mode))
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
    }

    async fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &ClientRequest,
    ) -> RelayResult<Value> {
        match request {
            ClientRequest::Canonical(req) => {
                let mut req = req.clone();
                req.scrub_capabilities(meta.model_config.max_output_tokens.max(1));
                Ok(protocol::openai::render_request(&req, &meta.actual_model))
            }
            ClientRequest::Raw(body) => {
                let mut body = body.clone();
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(meta.actual_model.clone()));
                }
                Ok(body)
            }
        }
    }

    fn stream_parser(&self) -> Box<dyn SseParser> {
        Box::new(protocol::openai::StreamParser::new())
    }

    fn parse_completion(&self, body: &Value) -> Completion {
        protocol::openai::parse_response(body)
    }

    fn upstream_error(&self, status: u16, body: &str) -> RelayError {
        match status {
            401 => RelayError::UpstreamAuth(body.to_string()),
            _ => RelayError::UpstreamStatus {
                status,
                message: body.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{Channel, ChannelStatus};
    use crate::model::price::Price;
    use crate::model::entity::ModelConfig;
    use crate::relay::meta::RelayMeta;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn meta_with_channel(mode: Mode) -> RelayMeta {
        let config = Arc::new(ModelConfig {
            model: "gpt-4o".to_string(),
            mode,
            price: Price::default(),
            max_context_tokens: 0,
            max_output_tokens: 4096,
            plugin: Value::Null,
        });
        let mut meta = RelayMeta::new(
            crate::relay::admission::test_support::group("g"),
            crate::relay::admission::test_support::token("g"),
            "gpt-4o",
            mode,
            config,
            "/v1/chat/completions",
            None,
        );
        meta.set_channel(Arc::new(Channel {
            id: 1,
            name: "oa".to_string(),
            kind: ChannelKind::OpenAi,
            status: ChannelStatus::Enabled,
            base_url: "https://gateway.example.com/".to_string(),
            key: "sk-up".to_string(),
            priority: 0,
            weight: 1,
            models: vec!["gpt-4o".to_string()],
            model_mapping: HashMap::new(),
            plugin: Value::Null,
        }));
        meta
    }

    #[test]
    fn url_per_mode() {
        let adaptor = OpenAiAdaptor;
        assert_eq!(
            adaptor.request_url(&meta_with_channel(Mode::ChatCompletions), true),
            "https://gateway.example.com/v1/chat/completions"
        );
        assert_eq!(
            adaptor.request_url(&meta_with_channel(Mode::Embeddings), false),
            "https://gateway.example.com/v1/embeddings"
        );
    }

    #[tokio::test]
    async fn raw_passthrough_rewrites_model() {
        let adaptor = OpenAiAdaptor;
        let meta = meta_with_channel(Mode::Embeddings);
        let body = adaptor
            .convert_request(
                &meta,
                &ClientRequest::Raw(serde_json::json!({"model": "alias", "input": "x"})),
            )
            .await
            .unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["input"], "x");
    }
}

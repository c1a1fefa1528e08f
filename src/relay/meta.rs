//! Per-request relay context.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::entity::{Channel, Group, Mode, ModelConfig, Token};
use crate::model::usage::Usage;

/// Context for exactly one relayed request. Built by admission, enriched
/// by the dispatcher as a channel is selected, consumed by settlement and
/// the consumption pipeline.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub request_id: String,
    pub group: Group,
    pub token: Token,
    /// Model name as the client requested it.
    pub original_model: String,
    /// After channel alias resolution; equals `original_model` until a
    /// channel is selected.
    pub actual_model: String,
    pub mode: Mode,
    pub channel: Option<Arc<Channel>>,
    pub model_config: Arc<ModelConfig>,
    pub endpoint_path: String,
    pub request_at: DateTime<Utc>,
    /// Arrival time of the current attempt; differs from `request_at` once
    /// the dispatcher retries.
    pub retry_at: Option<DateTime<Utc>>,
    pub first_byte_at: Option<DateTime<Utc>>,
    /// Worst-case usage estimated at admission, used for TPM accounting
    /// and as the streaming fallback when the upstream reports nothing.
    pub estimated_usage: Usage,
    pub client_ip: Option<String>,
    /// Small typed scratchpad shared across the plugin chain.
    scratch: HashMap<&'static str, Value>,
}

impl RelayMeta {
    pub fn new(
        group: Group,
        token: Token,
        model: &str,
        mode: Mode,
        model_config: Arc<ModelConfig>,
        endpoint_path: &str,
        client_ip: Option<String>,
    ) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            group,
            token,
            original_model: model.to_string(),
            actual_model: model.to_string(),
            mode,
            channel: None,
            model_config,
            endpoint_path: endpoint_path.to_string(),
            request_at: Utc::now(),
            retry_at: None,
            first_byte_at: None,
            estimated_usage: Usage::default(),
            client_ip,
            scratch: HashMap::new(),
        }
    }

    /// Bind the selected channel and resolve the model alias.
    pub fn set_channel(&mut self, channel: Arc<Channel>) {
        self.actual_model = channel.actual_model(&self.original_model).to_string();
        self.channel = Some(channel);
    }

    pub fn channel_id(&self) -> i64 {
        self.channel.as_ref().map(|c| c.id).unwrap_or(0)
    }

    pub fn scratch_set(&mut self, key: &'static str, value: Value) {
        self.scratch.insert(key, value);
    }

    pub fn scratch_get(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    pub fn ttfb_ms(&self) -> i64 {
        match self.first_byte_at {
            Some(at) => (at - self.request_at).num_milliseconds().max(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{
        ChannelKind, ChannelStatus, GroupStatus, TokenStatus,
    };
    use crate::model::price::Price;

    pub fn test_group(id: &str) -> Group {
        Group {
            id: id.to_string(),
            status: GroupStatus::Enabled,
            used_amount: 0.0,
            request_count: 0,
            balance: 100.0,
            max_input_tokens: 0,
            rpm: 0,
            tpm: 0,
            balance_alert_threshold: None,
            allowed_models: Vec::new(),
        }
    }

    pub fn test_token(group_id: &str) -> Token {
        Token {
            id: 1,
            group_id: group_id.to_string(),
            key: "sk-test".to_string(),
            name: "default".to_string(),
            status: TokenStatus::Enabled,
            quota: 0.0,
            used_amount: 0.0,
            request_count: 0,
            allowed_models: Vec::new(),
            allowed_subnets: Vec::new(),
            expires_at: None,
        }
    }

    #[test]
    fn channel_binding_resolves_alias() {
        let config = Arc::new(ModelConfig {
            model: "claude-3-5".to_string(),
            mode: Mode::ChatCompletions,
            price: Price::default(),
            max_context_tokens: 0,
            max_output_tokens: 4096,
            plugin: Value::Null,
        });
        let mut meta = RelayMeta::new(
            test_group("g"),
            test_token("g"),
            "claude-3-5",
            Mode::ChatCompletions,
            config,
            "/v1/chat/completions",
            None,
        );
        let mut mapping = HashMap::new();
        mapping.insert("claude-3-5".to_string(), "claude-3-5-sonnet-latest".to_string());
        meta.set_channel(Arc::new(Channel {
            id: 9,
            name: "primary".to_string(),
            kind: ChannelKind::Anthropic,
            status: ChannelStatus::Enabled,
            base_url: "https://api.anthropic.com".to_string(),
            key: String::new(),
            priority: 0,
            weight: 1,
            models: vec!["claude-3-5".to_string()],
            model_mapping: mapping,
            plugin: Value::Null,
        }));
        assert_eq!(meta.actual_model, "claude-3-5-sonnet-latest");
        assert_eq!(meta.channel_id(), 9);
    }
}

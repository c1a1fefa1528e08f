//! Gateway entities: groups, tokens, channels, model configs.
//!
//! Relations are by id only; snapshots taken from the cache are immutable
//! and nothing holds pointers between entities.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::price::Price;

// ============================================================================
// Statuses and tags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Enabled,
    Disabled,
    /// Internal groups bypass billing alerts but still account usage.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    /// Set by the dispatcher on hard channel faults; cleared only by the
    /// background probe task.
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::AutoDisabled => "auto_disabled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(ChannelStatus::Enabled),
            "disabled" => Some(ChannelStatus::Disabled),
            "auto_disabled" => Some(ChannelStatus::AutoDisabled),
            _ => None,
        }
    }
}

/// Upstream adaptor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    OpenAi,
    Anthropic,
    Gemini,
    BedrockClaude,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::OpenAi => "openai",
            ChannelKind::Anthropic => "anthropic",
            ChannelKind::Gemini => "gemini",
            ChannelKind::BedrockClaude => "bedrock-claude",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ChannelKind::OpenAi),
            "anthropic" | "claude" => Some(ChannelKind::Anthropic),
            "gemini" => Some(ChannelKind::Gemini),
            "bedrock-claude" | "bedrock" => Some(ChannelKind::BedrockClaude),
            _ => None,
        }
    }
}

/// Client-side wire shape of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ChatCompletions,
    Completions,
    Anthropic,
    Gemini,
    Responses,
    Embeddings,
    Image,
    Audio,
    Rerank,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ChatCompletions => "chat_completions",
            Mode::Completions => "completions",
            Mode::Anthropic => "anthropic",
            Mode::Gemini => "gemini",
            Mode::Responses => "responses",
            Mode::Embeddings => "embeddings",
            Mode::Image => "image",
            Mode::Audio => "audio",
            Mode::Rerank => "rerank",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat_completions" | "chat" => Some(Mode::ChatCompletions),
            "completions" => Some(Mode::Completions),
            "anthropic" => Some(Mode::Anthropic),
            "gemini" => Some(Mode::Gemini),
            "responses" => Some(Mode::Responses),
            "embeddings" | "embedding" => Some(Mode::Embeddings),
            "image" => Some(Mode::Image),
            "audio" => Some(Mode::Audio),
            "rerank" => Some(Mode::Rerank),
            _ => None,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Billing and quota owner. Owns tokens; referenced everywhere by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub status: GroupStatus,
    pub used_amount: f64,
    pub request_count: i64,
    /// Remaining balance the pre-charge ledger draws from.
    pub balance: f64,
    /// 0 = unlimited.
    pub max_input_tokens: i64,
    /// Requests per minute, 0 = unlimited.
    pub rpm: i64,
    /// Tokens per minute, 0 = unlimited.
    pub tpm: i64,
    pub balance_alert_threshold: Option<f64>,
    /// Empty = all models allowed.
    pub allowed_models: Vec<String>,
}

impl Group {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Authentication credential tied to one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub group_id: String,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    /// 0 = unlimited.
    pub quota: f64,
    pub used_amount: f64,
    pub request_count: i64,
    /// Empty = all models allowed.
    pub allowed_models: Vec<String>,
    /// IPv4 CIDR allow-list; empty = any source.
    pub allowed_subnets: Vec<String>,
    /// Unix seconds; absent = never expires.
    pub expires_at: Option<i64>,
}

impl Token {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn expired(&self, now_unix: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_unix)
    }

    /// Remaining quota; `None` when unlimited.
    pub fn remaining_quota(&self) -> Option<f64> {
        if self.quota <= 0.0 {
            None
        } else {
            Some((self.quota - self.used_amount).max(0.0))
        }
    }
}

/// A configured upstream endpoint with credentials and a model list.
/// Negative ids are config-file-only channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub base_url: String,
    pub key: String,
    /// Tiebreak: only the highest-priority partition is drawn from.
    pub priority: i64,
    /// Weighted-random selection weight, >= 1.
    pub weight: u32,
    pub models: Vec<String>,
    /// Requested model name -> upstream model name.
    pub model_mapping: HashMap<String, String>,
    /// Per-channel plugin overrides, opaque to the core.
    pub plugin: serde_json::Value,
}

impl Channel {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Upstream model name after alias resolution.
    pub fn actual_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .map(|m| m.as_str())
            .unwrap_or(requested)
    }
}

/// Per-model pricing, bounds and plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub mode: Mode,
    pub price: Price,
    /// 0 = unlimited.
    pub max_context_tokens: i64,
    /// Upper bound for output tokens; also the pre-charge worst case.
    pub max_output_tokens: i64,
    /// Plugin configuration blob keyed by plugin name.
    pub plugin: serde_json::Value,
}

impl ModelConfig {
    pub fn plugin_config(&self, name: &str) -> Option<&serde_json::Value> {
        self.plugin.get(name).filter(|v| !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_allow_lists() {
        let mut group = Group {
            id: "g1".to_string(),
            status: GroupStatus::Enabled,
            used_amount: 0.0,
            request_count: 0,
            balance: 10.0,
            max_input_tokens: 0,
            rpm: 0,
            tpm: 0,
            balance_alert_threshold: None,
            allowed_models: Vec::new(),
        };
        assert!(group.allows_model("gpt-4o"));
        group.allowed_models = vec!["claude-3-5".to_string()];
        assert!(!group.allows_model("gpt-4o"));
        assert!(group.allows_model("claude-3-5"));
    }

    #[test]
    fn channel_alias_resolution() {
        let mut mapping = HashMap::new();
        mapping.insert("claude-3-5".to_string(), "claude-3-5-sonnet-20241022".to_string());
        let ch = Channel {
            id: 1,
            name: "anthropic-primary".to_string(),
            kind: ChannelKind::Anthropic,
            status: ChannelStatus::Enabled,
            base_url: "https://api.anthropic.com".to_string(),
            key: "sk".to_string(),
            priority: 0,
            weight: 1,
            models: vec!["claude-3-5".to_string()],
            model_mapping: mapping,
            plugin: serde_json::Value::Null,
        };
        assert_eq!(ch.actual_model("claude-3-5"), "claude-3-5-sonnet-20241022");
        assert_eq!(ch.actual_model("other"), "other");
    }

    #[test]
    fn token_expiry() {
        let token = Token {
            id: 1,
            group_id: "g1".to_string(),
            key: "k".to_string(),
            name: "t".to_string(),
            status: TokenStatus::Enabled,
            quota: 100.0,
            used_amount: 40.0,
            request_count: 0,
            allowed_models: Vec::new(),
            allowed_subnets: Vec::new(),
            expires_at: Some(1_000),
        };
        assert!(token.expired(1_000));
        assert!(!token.expired(999));
        assert_eq!(token.remaining_quota(), Some(60.0));
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            ChannelKind::OpenAi,
            ChannelKind::Anthropic,
            ChannelKind::Gemini,
            ChannelKind::BedrockClaude,
        ] {
            assert_eq!(ChannelKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::from_str("claude"), Some(ChannelKind::Anthropic));
    }
}

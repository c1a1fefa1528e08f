//! Admission: token resolution and request gating.
//!
//! Order of checks: token lookup and status, subnet allow-list, group
//! lookup and status, IP blocklist, model allow-lists (group first, then
//! token, against the original model name), input-size cap, then RPM/TPM
//! buckets at both token and group scope.

use axum::http::HeaderMap;
use chrono::Utc;

use crate::model::entity::{GroupStatus, Mode, TokenStatus};
use crate::model::usage::Usage;
use crate::{cache, store};

use super::blocklist;
use super::error::{RelayError, RelayResult};
use super::meta::RelayMeta;
use super::ratelimit;

/// Extract the credential from the request headers. Accepts the OpenAI,
/// Anthropic and Gemini conventions.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = auth.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// IPv4 CIDR containment. Malformed subnets never match.
pub fn ip_in_subnet(ip: &str, subnet: &str) -> bool {
    fn parse_v4(raw: &str) -> Option<u32> {
        let mut out: u32 = 0;
        let mut octets = 0;
        for part in raw.split('.') {
            let octet: u32 = part.parse().ok()?;
            if octet > 255 {
                return None;
            }
            out = (out << 8) | octet;
            octets += 1;
        }
        if octets == 4 {
            Some(out)
        } else {
            None
        }
    }
    let Some(ip_bits) = parse_v4(ip) else {
        return false;
    };
    let (net, len) = match subnet.split_once('/') {
        Some((net, len)) => {
            let Ok(len) = len.parse::<u32>() else {
                return false;
            };
            (net, len.min(32))
        }
        None => (subnet, 32),
    };
    let Some(net_bits) = parse_v4(net) else {
        return false;
    };
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    (ip_bits & mask) == (net_bits & mask)
}

/// Resolve the caller's token and group with status and expiry checks
/// only. The model listing and billing endpoints use this; the relay path
/// goes through [`admit`].
pub fn resolve_identity(
    headers: &HeaderMap,
) -> RelayResult<(crate::model::entity::Token, crate::model::entity::Group)> {
    let key = extract_key(headers)
        .ok_or_else(|| RelayError::Unauthorized("missing credentials".to_string()))?;
    let token = store::global()
        .find_token_by_key(&key)
        .map_err(|e| RelayError::Internal(format!("token lookup failed: {}", e)))?
        .ok_or_else(|| RelayError::Unauthorized("unknown token".to_string()))?;
    if token.status != TokenStatus::Enabled {
        return Err(RelayError::TokenDisabled);
    }
    if token.expired(Utc::now().timestamp()) {
        return Err(RelayError::Unauthorized("token expired".to_string()));
    }
    let group = store::global()
        .get_group(&token.group_id)
        .map_err(|e| RelayError::Internal(format!("group lookup failed: {}", e)))?
        .ok_or_else(|| RelayError::Unauthorized("token has no group".to_string()))?;
    if group.status == GroupStatus::Disabled {
        return Err(RelayError::GroupDisabled);
    }
    Ok((token, group))
}

/// Run every admission check and seed the per-request context.
///
/// `estimated_input_tokens` is the admission-time token estimate used for
/// TPM accounting and the input-size cap.
pub fn admit(
    headers: &HeaderMap,
    model: &str,
    mode: Mode,
    endpoint_path: &str,
    client_ip: Option<String>,
    estimated_input_tokens: i64,
) -> RelayResult<RelayMeta> {
    let key = extract_key(headers)
        .ok_or_else(|| RelayError::Unauthorized("missing credentials".to_string()))?;

    let token = store::global()
        .find_token_by_key(&key)
        .map_err(|e| RelayError::Internal(format!("token lookup failed: {}", e)))?
        .ok_or_else(|| RelayError::Unauthorized("unknown token".to_string()))?;

    let now = Utc::now();
    if token.status != TokenStatus::Enabled {
        return Err(RelayError::TokenDisabled);
    }
    if token.expired(now.timestamp()) {
        return Err(RelayError::Unauthorized("token expired".to_string()));
    }
    if !token.allowed_subnets.is_empty() {
        let allowed = client_ip
            .as_deref()
            .map(|ip| token.allowed_subnets.iter().any(|s| ip_in_subnet(ip, s)))
            .unwrap_or(false);
        if !allowed {
            return Err(RelayError::Unauthorized(
                "source address not allowed for this token".to_string(),
            ));
        }
    }

    let group = store::global()
        .get_group(&token.group_id)
        .map_err(|e| RelayError::Internal(format!("group lookup failed: {}", e)))?
        .ok_or_else(|| RelayError::Unauthorized("token has no group".to_string()))?;
    if group.status == GroupStatus::Disabled {
        return Err(RelayError::GroupDisabled);
    }

    if let Some(ip) = client_ip.as_deref() {
        if blocklist::is_blocked(ip, now.timestamp()) {
            return Err(RelayError::IpBlocked(ip.to_string()));
        }
    }

    // Allow-lists run against the original model name; channel aliasing
    // happens after selection.
    if !group.allows_model(model) || !token.allows_model(model) {
        return Err(RelayError::ModelNotAllowed(model.to_string()));
    }

    let model_config = cache::model_config_for(model)
        .ok_or_else(|| RelayError::InvalidRequest(format!("model '{}' is not configured", model)))?;

    if group.max_input_tokens > 0 && estimated_input_tokens > group.max_input_tokens {
        return Err(RelayError::InvalidRequest(format!(
            "input exceeds the group limit of {} tokens",
            group.max_input_tokens
        )));
    }

    let now_ms = now.timestamp_millis();
    check_rates(&group, &token, model, estimated_input_tokens, now_ms)?;

    let mut meta = RelayMeta::new(
        group,
        token,
        model,
        mode,
        model_config,
        endpoint_path,
        client_ip,
    );
    meta.estimated_usage = Usage {
        input_tokens: estimated_input_tokens,
        ..Default::default()
    };
    Ok(meta)
}

fn check_rates(
    group: &crate::model::entity::Group,
    token: &crate::model::entity::Token,
    model: &str,
    tokens: i64,
    now_ms: i64,
) -> RelayResult<()> {
    let token_key = format!("token:{}:{}", token.id, model);
    let group_key = format!("group:{}:{}", group.id, model);
    if !ratelimit::allow_request(&token_key, group.rpm, now_ms) {
        return Err(RelayError::RateLimited(format!(
            "token request rate exceeded for model '{}'",
            model
        )));
    }
    if !ratelimit::allow_request(&group_key, group.rpm, now_ms) {
        return Err(RelayError::RateLimited(format!(
            "group request rate exceeded for model '{}'",
            model
        )));
    }
    if !ratelimit::allow_tokens(&token_key, tokens, group.tpm, now_ms) {
        return Err(RelayError::RateLimited(format!(
            "token throughput exceeded for model '{}'",
            model
        )));
    }
    if !ratelimit::allow_tokens(&group_key, tokens, group.tpm, now_ms) {
        return Err(RelayError::RateLimited(format!(
            "group throughput exceeded for model '{}'",
            model
        )));
    }
    Ok(())
}

/// Shared fixtures for relay tests.
#[cfg(test)]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::Value;

    use crate::model::entity::{
        Channel, ChannelKind, ChannelStatus, Group, GroupStatus, Mode, ModelConfig, Token,
        TokenStatus,
    };
    use crate::model::price::Price;
    use crate::relay::meta::RelayMeta;

    pub fn group(id: &str) -> Group {
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

    pub fn token(group_id: &str) -> Token {
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

    pub fn channel(id: i64, kind: ChannelKind, base_url: &str, model: &str) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            kind,
            status: ChannelStatus::Enabled,
            base_url: base_url.to_string(),
            key: "upstream-key".to_string(),
            priority: 0,
            weight: 1,
            models: vec![model.to_string()],
            model_mapping: HashMap::new(),
            plugin: Value::Null,
        }
    }

    pub fn model_config(model: &str, mode: Mode) -> Arc<ModelConfig> {
        Arc::new(ModelConfig {
            model: model.to_string(),
            mode,
            price: Price::default(),
            max_context_tokens: 128_000,
            max_output_tokens: 4096,
            plugin: Value::Null,
        })
    }

    pub fn meta_for(mode: Mode, kind: ChannelKind, base_url: &str) -> RelayMeta {
        let mut meta = RelayMeta::new(
            group("g-test"),
            token("g-test"),
            "claude-3-5",
            mode,
            model_config("claude-3-5", mode),
            "/v1/chat/completions",
            None,
        );
        meta.set_channel(Arc::new(channel(1, kind, base_url, "claude-3-5")));
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_key_extraction_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-abc".parse().unwrap());
        headers.insert("x-api-key", "other".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("sk-abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "gk-1".parse().unwrap());
        assert_eq!(extract_key(&headers).as_deref(), Some("gk-1"));

        assert_eq!(extract_key(&HeaderMap::new()), None);
    }

    #[test]
    fn subnet_matching() {
        assert!(ip_in_subnet("10.1.2.3", "10.0.0.0/8"));
        assert!(ip_in_subnet("192.168.1.77", "192.168.1.0/24"));
        assert!(!ip_in_subnet("192.168.2.1", "192.168.1.0/24"));
        assert!(ip_in_subnet("1.2.3.4", "1.2.3.4"));
        assert!(!ip_in_subnet("1.2.3.5", "1.2.3.4/32"));
        assert!(ip_in_subnet("8.8.8.8", "0.0.0.0/0"));
        assert!(!ip_in_subnet("not-an-ip", "10.0.0.0/8"));
        assert!(!ip_in_subnet("10.0.0.1", "garbage"));
    }
}

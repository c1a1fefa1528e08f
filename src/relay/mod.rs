//! Relay pipeline: the client-facing endpoints and the request path
//! behind them.
//!
//! ```text
//! request -> admission -> pre-charge -> { select -> convert -> dispatch
//!   -> relay response }* -> settle -> consumption pipeline
//! ```
//!
//! Endpoints:
//! - `POST /v1/chat/completions` (OpenAI), `POST /v1/responses`
//! - `POST /v1/messages` (Anthropic)
//! - `POST /v1beta/models/{model}:{generate|streamGenerateContent}` (Gemini)
//! - OpenAI-shaped embeddings / images / audio / rerank passthrough
//! - `GET /v1/models`, `GET /v1/dashboard/billing/{subscription,usage}`

pub mod admission;
pub mod blocklist;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod meta;
pub mod precharge;
pub mod ratelimit;
pub mod selector;

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::adaptor::ClientRequest;
use crate::model::entity::Mode;
use crate::{cache, config, text};

use dispatch::RequestDetail;
use error::RelayError;

fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn capture_detail(body: &Value) -> RequestDetail {
    let cfg = config::load();
    if cfg.log_detail_storage_hours == 0 {
        return RequestDetail::default();
    }
    let raw = body.to_string();
    RequestDetail {
        request_body: Some(
            text::truncate(&raw, cfg.log_detail_request_body_max_size).to_string(),
        ),
    }
}

/// Shared path for the chat-shaped client modes.
async fn relay_canonical(
    mode: Mode,
    endpoint: &str,
    headers: HeaderMap,
    body: Value,
    url_model: Option<&str>,
    url_stream: bool,
) -> Response {
    let parsed = match crate::adaptor::parse_client_request(mode, &body, url_model, url_stream) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response_for(mode),
    };
    let estimated = text::estimate_tokens_cfg(&parsed.text_for_estimation());
    let meta = match admission::admit(
        &headers,
        &parsed.model,
        mode,
        endpoint,
        client_ip(&headers),
        estimated,
    ) {
        Ok(meta) => meta,
        Err(e) => return e.into_response_for(mode),
    };
    let detail = capture_detail(&body);
    dispatch::relay(meta, ClientRequest::Canonical(parsed), detail).await
}

/// Shared path for the OpenAI-shaped passthrough modes.
async fn relay_raw(mode: Mode, endpoint: &str, headers: HeaderMap, body: Value) -> Response {
    let Some(model) = body.get("model").and_then(|v| v.as_str()).map(String::from) else {
        return RelayError::InvalidRequest("missing model".to_string()).into_response_for(mode);
    };
    let estimated = text::estimate_tokens_cfg(&body.to_string());
    let meta = match admission::admit(
        &headers,
        &model,
        mode,
        endpoint,
        client_ip(&headers),
        estimated,
    ) {
        Ok(meta) => meta,
        Err(e) => return e.into_response_for(mode),
    };
    let detail = capture_detail(&body);
    dispatch::relay(meta, ClientRequest::Raw(body), detail).await
}

// ============================================================================
// Chat-shaped endpoints
// ============================================================================

pub async fn chat_completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_canonical(
        Mode::ChatCompletions,
        "/v1/chat/completions",
        headers,
        body,
        None,
        false,
    )
    .await
}

pub async fn anthropic_messages(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_canonical(Mode::Anthropic, "/v1/messages", headers, body, None, false).await
}

pub async fn responses_create(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_canonical(Mode::Responses, "/v1/responses", headers, body, None, false).await
}

pub async fn gemini_generate(
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return RelayError::InvalidRequest(format!(
            "expected model:action, got '{}'",
            model_action
        ))
        .into_response_for(Mode::Gemini);
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return RelayError::InvalidRequest(format!("unsupported action '{}'", other))
                .into_response_for(Mode::Gemini)
        }
    };
    let endpoint = format!("/v1beta/models/{}:{}", model, action);
    relay_canonical(Mode::Gemini, &endpoint, headers, body, Some(model), stream).await
}

// ============================================================================
// Passthrough endpoints
// ============================================================================

pub async fn completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_raw(Mode::Completions, "/v1/completions", headers, body).await
}

pub async fn embeddings(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_raw(Mode::Embeddings, "/v1/embeddings", headers, body).await
}

pub async fn images_generations(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_raw(Mode::Image, "/v1/images/generations", headers, body).await
}

pub async fn audio_speech(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_raw(Mode::Audio, "/v1/audio/speech", headers, body).await
}

pub async fn rerank(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    relay_raw(Mode::Rerank, "/v1/rerank", headers, body).await
}

// ============================================================================
// Model listing and billing
// ============================================================================

fn model_item(model: &str) -> Value {
    json!({
        "id": model,
        "object": "model",
        "created": 1_700_000_000,
        "owned_by": "airelay",
        "root": model,
        "parent": null,
    })
}

pub async fn list_models(headers: HeaderMap) -> Response {
    let (token, group) = match admission::resolve_identity(&headers) {
        Ok(pair) => pair,
        Err(e) => return e.into_response_for(Mode::ChatCompletions),
    };
    let models: Vec<Value> = cache::known_models()
        .into_iter()
        .filter(|m| group.allows_model(m) && token.allows_model(m))
        .map(|m| model_item(&m))
        .collect();
    Json(json!({"object": "list", "data": models})).into_response()
}

pub async fn get_model(Path(model_id): Path<String>, headers: HeaderMap) -> Response {
    let (token, group) = match admission::resolve_identity(&headers) {
        Ok(pair) => pair,
        Err(e) => return e.into_response_for(Mode::ChatCompletions),
    };
    let known = cache::model_config_for(&model_id).is_some();
    if known && group.allows_model(&model_id) && token.allows_model(&model_id) {
        Json(model_item(&model_id)).into_response()
    } else {
        RelayError::ModelNotAllowed(model_id).into_response_for(Mode::ChatCompletions)
    }
}

pub async fn billing_subscription(headers: HeaderMap) -> Response {
    let (token, group) = match admission::resolve_identity(&headers) {
        Ok(pair) => pair,
        Err(e) => return e.into_response_for(Mode::ChatCompletions),
    };
    let hard_limit = if token.quota > 0.0 {
        token.quota
    } else {
        group.balance + group.used_amount
    };
    Json(json!({
        "object": "billing_subscription",
        "has_payment_method": true,
        "soft_limit_usd": hard_limit,
        "hard_limit_usd": hard_limit,
        "system_hard_limit_usd": hard_limit,
        "access_until": 0,
    }))
    .into_response()
}

pub async fn billing_usage(headers: HeaderMap) -> Response {
    let (token, _group) = match admission::resolve_identity(&headers) {
        Ok(pair) => pair,
        Err(e) => return e.into_response_for(Mode::ChatCompletions),
    };
    Json(json!({
        "object": "list",
        // Dashboard convention: hundredths of a cent.
        "total_usage": token.used_amount * 100.0,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.9, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "192.168.0.5".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.0.5".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("192.168.0.5"));

        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}

//! Relay error taxonomy.
//!
//! Kinds map onto the retry policy: client errors surface verbatim and are
//! never retried; connect/DNS/auth faults are channel faults that retry on
//! a different channel and auto-disable the failing one; upstream 5xx and
//! 429 retry without auto-disabling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::model::entity::Mode;
use crate::protocol;

#[derive(Debug, Clone)]
pub enum RelayError {
    Unauthorized(String),
    GroupDisabled,
    TokenDisabled,
    ModelNotAllowed(String),
    RateLimited(String),
    IpBlocked(String),
    InsufficientQuota(String),
    InvalidRequest(String),
    NoChannelAvailable(String),
    /// Upstream returned a non-success status with this body excerpt.
    UpstreamStatus { status: u16, message: String },
    /// Connection refused, reset, or DNS failure.
    ConnectFailed(String),
    /// Upstream rejected our channel credentials.
    UpstreamAuth(String),
    Timeout(String),
    /// Upstream body could not be decoded before any client byte was sent.
    Decode(String),
    Internal(String),
}

/// Dispatch decision derived from an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Surfaced to the client as-is; no retry.
    ClientError,
    /// Retry on another channel; the current one stays enabled.
    RetryableRequest,
    /// Retry on another channel and auto-disable the current one.
    RetryableChannel,
    /// Well-formed upstream failure; synthesized provider-shaped error.
    UpstreamTerminal,
    Internal,
}

impl RelayError {
    pub fn classify(&self) -> FaultClass {
        match self {
            RelayError::Unauthorized(_)
            | RelayError::GroupDisabled
            | RelayError::TokenDisabled
            | RelayError::ModelNotAllowed(_)
            | RelayError::RateLimited(_)
            | RelayError::IpBlocked(_)
            | RelayError::InsufficientQuota(_)
            | RelayError::InvalidRequest(_)
            | RelayError::NoChannelAvailable(_) => FaultClass::ClientError,
            RelayError::UpstreamStatus { status, .. } => match status {
                429 | 408 | 500 | 502 | 503 | 504 => FaultClass::RetryableRequest,
                _ => FaultClass::UpstreamTerminal,
            },
            RelayError::ConnectFailed(_) | RelayError::UpstreamAuth(_) => {
                FaultClass::RetryableChannel
            }
            RelayError::Timeout(_) | RelayError::Decode(_) => FaultClass::RetryableRequest,
            RelayError::Internal(_) => FaultClass::Internal,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RelayError::Unauthorized(_) => 401,
            RelayError::GroupDisabled | RelayError::TokenDisabled => 403,
            RelayError::ModelNotAllowed(_) => 403,
            RelayError::RateLimited(_) => 429,
            RelayError::IpBlocked(_) => 403,
            RelayError::InsufficientQuota(_) => 402,
            RelayError::InvalidRequest(_) => 400,
            RelayError::NoChannelAvailable(_) => 503,
            RelayError::UpstreamStatus { status, .. } => *status,
            RelayError::ConnectFailed(_) => 502,
            RelayError::UpstreamAuth(_) => 502,
            RelayError::Timeout(_) => 504,
            RelayError::Decode(_) => 502,
            RelayError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RelayError::Unauthorized(m) => format!("unauthorized: {}", m),
            RelayError::GroupDisabled => "group is disabled".to_string(),
            RelayError::TokenDisabled => "token is disabled".to_string(),
            RelayError::ModelNotAllowed(model) => {
                format!("model '{}' is not allowed for this token", model)
            }
            RelayError::RateLimited(m) => m.clone(),
            RelayError::IpBlocked(ip) => format!("requests from {} are blocked", ip),
            RelayError::InsufficientQuota(m) => m.clone(),
            RelayError::InvalidRequest(m) => m.clone(),
            RelayError::NoChannelAvailable(model) => {
                format!("no available channel for model '{}'", model)
            }
            RelayError::UpstreamStatus { status, message } => {
                format!("upstream returned {}: {}", status, message)
            }
            RelayError::ConnectFailed(m) => format!("upstream connection failed: {}", m),
            RelayError::UpstreamAuth(m) => format!("upstream rejected credentials: {}", m),
            RelayError::Timeout(m) => format!("upstream timeout: {}", m),
            RelayError::Decode(m) => format!("upstream response decode failed: {}", m),
            RelayError::Internal(m) => m.clone(),
        }
    }

    /// Error body in the client's protocol shape.
    pub fn body_for_mode(&self, mode: Mode) -> Value {
        let code = self.status();
        let message = self.message();
        match mode {
            Mode::Anthropic => protocol::anthropic::render_error_body(code, &message),
            Mode::Gemini => protocol::gemini::render_error_body(code, &message),
            Mode::Responses => protocol::responses::render_error_body(code, &message),
            _ => protocol::openai::render_error_body(code, &message),
        }
    }

    pub fn into_response_for(self, mode: Mode) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        crate::logger::warn(
            "relay",
            &format!("returning {} to client: {}", status.as_u16(), self.message()),
        );
        (status, axum::Json(self.body_for_mode(mode))).into_response()
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for RelayError {}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_policy() {
        assert_eq!(
            RelayError::Unauthorized("x".to_string()).classify(),
            FaultClass::ClientError
        );
        assert_eq!(
            RelayError::UpstreamStatus {
                status: 429,
                message: String::new()
            }
            .classify(),
            FaultClass::RetryableRequest
        );
        assert_eq!(
            RelayError::UpstreamStatus {
                status: 503,
                message: String::new()
            }
            .classify(),
            FaultClass::RetryableRequest
        );
        assert_eq!(
            RelayError::UpstreamStatus {
                status: 422,
                message: String::new()
            }
            .classify(),
            FaultClass::UpstreamTerminal
        );
        assert_eq!(
            RelayError::ConnectFailed("refused".to_string()).classify(),
            FaultClass::RetryableChannel
        );
        assert_eq!(
            RelayError::UpstreamAuth("bad key".to_string()).classify(),
            FaultClass::RetryableChannel
        );
        assert_eq!(
            RelayError::Timeout("t".to_string()).classify(),
            FaultClass::RetryableRequest
        );
    }

    #[test]
    fn error_bodies_take_protocol_shape() {
        let err = RelayError::RateLimited("slow down".to_string());
        let openai = err.body_for_mode(Mode::ChatCompletions);
        assert_eq!(openai["error"]["type"], "rate_limit_error");
        let anthropic = err.body_for_mode(Mode::Anthropic);
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["type"], "rate_limit_error");
        let gemini = err.body_for_mode(Mode::Gemini);
        assert_eq!(gemini["error"]["status"], "RESOURCE_EXHAUSTED");
    }
}

//! Immutable per-request log record.

use serde::{Deserialize, Serialize};

use super::entity::Mode;
use super::usage::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    /// Original model name as requested; aliased name goes in `actual_model`.
    pub model: String,
    pub actual_model: String,
    pub mode: Mode,
    /// HTTP status class of the outcome (upstream or synthesized).
    pub code: u16,
    /// Unix milliseconds at request arrival.
    pub created_at: i64,
    /// Milliseconds to first upstream byte; 0 when never reached.
    pub ttfb_ms: i64,
    pub latency_ms: i64,
    pub usage: Usage,
    pub amount: f64,
    pub retry_count: u32,
    /// True when the client received a usable response (including partial
    /// streams cut off mid-flight).
    pub downstream_result: bool,
    pub upstream_id: Option<String>,
    /// Truncated request body, when detail retention is enabled.
    pub request_detail: Option<String>,
    /// Truncated response body or accumulated stream text.
    pub response_detail: Option<String>,
    pub client_ip: Option<String>,
}

impl RequestLog {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

//! HTTP client utilities for upstream dispatch.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;

use super::error::{RelayError, RelayResult};

/// Create an HTTP client with the standard connect timeout.
pub fn create_client(timeout_secs: u64) -> RelayResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// Client for buffered requests.
pub fn default_client() -> RelayResult<Client> {
    create_client(120)
}

/// Client for streaming requests; the overall timeout covers the full
/// body, so it is much longer.
pub fn streaming_client() -> RelayResult<Client> {
    create_client(300)
}

/// Map a reqwest transport error into the relay taxonomy.
pub fn map_transport_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout(e.to_string())
    } else if e.is_connect() {
        RelayError::ConnectFailed(e.to_string())
    } else {
        RelayError::UpstreamStatus {
            status: 502,
            message: e.to_string(),
        }
    }
}

/// Retry delay with exponential backoff and up-to-25% jitter.
pub fn retry_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 300;
    const MAX_MS: u64 = 3000;
    let exp = (1u64 << attempt.min(10)) * BASE_MS;
    let delay = exp.min(MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=delay / 4);
    Duration::from_millis(delay + jitter)
}

/// Parse a `data:` SSE line, stripping the optional space.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Drain complete lines from an SSE byte buffer. Handles chunk boundaries
/// that split lines and CRLF endings.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_data_variants() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert_eq!(parse_sse_data("hello"), None);
    }

    #[test]
    fn drain_handles_split_lines() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_handles_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\ndata: two\n");
        assert_eq!(lines, vec!["data: ok", "data: two"]);
    }

    #[test]
    fn retry_delay_is_bounded() {
        for attempt in 0..20 {
            let delay = retry_delay(attempt);
            assert!(delay.as_millis() <= (3000 + 3000 / 4) as u128);
        }
        assert!(retry_delay(1) >= Duration::from_millis(300));
    }
}

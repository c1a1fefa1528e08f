//! Request log persistence with retention knobs.
//!
//! Skips 429s and everything when retention is off; truncates detail
//! bodies to the configured byte caps on character boundaries.

use crate::model::log::RequestLog;
use crate::{config, logger, store, text};

/// Apply retention policy and persist. Never fails the request path.
pub fn persist(log: &RequestLog) {
    let cfg = config::load();
    if cfg.log_storage_hours == 0 {
        return;
    }
    if log.code == 429 {
        return;
    }
    let mut record = log.clone();
    apply_detail_policy(&mut record, &cfg);
    if let Err(e) = store::global().insert_log(&record) {
        logger::error("log_writer", &format!("failed to persist request log: {}", e));
    }
}

fn apply_detail_policy(log: &mut RequestLog, cfg: &config::Settings) {
    let keep_detail =
        cfg.log_detail_storage_hours != 0 && (cfg.save_all_log_detail || !log.is_success());
    if !keep_detail {
        log.request_detail = None;
        log.response_detail = None;
        return;
    }
    if let Some(detail) = &log.request_detail {
        log.request_detail = Some(
            text::truncate(detail, cfg.log_detail_request_body_max_size).to_string(),
        );
    }
    if let Some(detail) = &log.response_detail {
        log.response_detail = Some(
            text::truncate(detail, cfg.log_detail_response_body_max_size).to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::Mode;
    use crate::model::usage::Usage;

    fn sample(code: u16) -> RequestLog {
        RequestLog {
            request_id: "r".to_string(),
            group_id: "g".to_string(),
            token_id: 1,
            token_name: "t".to_string(),
            channel_id: 1,
            model: "m".to_string(),
            actual_model: "m".to_string(),
            mode: Mode::ChatCompletions,
            code,
            created_at: 0,
            ttfb_ms: 0,
            latency_ms: 0,
            usage: Usage::default(),
            amount: 0.0,
            retry_count: 0,
            downstream_result: true,
            upstream_id: None,
            request_detail: Some("中中中中".to_string()),
            response_detail: Some("abcdef".to_string()),
            client_ip: None,
        }
    }

    #[test]
    fn detail_truncates_on_char_boundary() {
        let mut cfg = config::Settings::default();
        cfg.save_all_log_detail = true;
        cfg.log_detail_request_body_max_size = 7;
        cfg.log_detail_response_body_max_size = 3;
        let mut log = sample(200);
        apply_detail_policy(&mut log, &cfg);
        // 7 bytes of 3-byte chars keeps two whole chars.
        assert_eq!(log.request_detail.as_deref(), Some("中中"));
        assert_eq!(log.response_detail.as_deref(), Some("abc"));
    }

    #[test]
    fn detail_dropped_for_successes_by_default() {
        let cfg = config::Settings::default();
        let mut log = sample(200);
        apply_detail_policy(&mut log, &cfg);
        assert!(log.request_detail.is_none());
        let mut failed = sample(502);
        apply_detail_policy(&mut failed, &cfg);
        assert!(failed.request_detail.is_some());
    }

    #[test]
    fn detail_disabled_entirely_when_retention_zero() {
        let mut cfg = config::Settings::default();
        cfg.log_detail_storage_hours = 0;
        cfg.save_all_log_detail = true;
        let mut log = sample(500);
        apply_detail_policy(&mut log, &cfg);
        assert!(log.request_detail.is_none());
        assert!(log.response_detail.is_none());
    }
}

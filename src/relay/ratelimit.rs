//! Sliding-window rate buckets.
//!
//! Buckets are keyed by caller-chosen strings, one per (token, model) and
//! (group, model) pair, and store unix-millisecond timestamps. A request
//! at time `t` is rejected iff the bucket already holds `limit` entries
//! newer than `t - 60_000`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use once_cell::sync::Lazy;

const WINDOW_MS: i64 = 60_000;

static RPM_BUCKETS: Lazy<Mutex<HashMap<String, VecDeque<i64>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TPM_BUCKETS: Lazy<Mutex<HashMap<String, VecDeque<(i64, i64)>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn trim_window<T>(window: &mut VecDeque<(i64, T)>, now_ms: i64) {
    while matches!(window.front(), Some((ts, _)) if *ts <= now_ms - WINDOW_MS) {
        window.pop_front();
    }
}

/// Record one request against `key` iff it stays within `limit` per
/// minute. `limit <= 0` means unlimited. Returns false on rejection
/// (nothing recorded).
pub fn allow_request(key: &str, limit: i64, now_ms: i64) -> bool {
    if limit <= 0 {
        return true;
    }
    let mut buckets = RPM_BUCKETS.lock().expect("rpm lock");
    let window = buckets.entry(key.to_string()).or_default();
    while matches!(window.front(), Some(ts) if *ts <= now_ms - WINDOW_MS) {
        window.pop_front();
    }
    if window.len() as i64 >= limit {
        return false;
    }
    window.push_back(now_ms);
    true
}

/// Record `tokens` against `key` iff the window total stays within
/// `limit` tokens per minute.
pub fn allow_tokens(key: &str, tokens: i64, limit: i64, now_ms: i64) -> bool {
    if limit <= 0 {
        return true;
    }
    let mut buckets = TPM_BUCKETS.lock().expect("tpm lock");
    let window = buckets.entry(key.to_string()).or_default();
    trim_window(window, now_ms);
    let in_window: i64 = window.iter().map(|(_, n)| n).sum();
    if in_window + tokens > limit {
        return false;
    }
    window.push_back((now_ms, tokens));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_window_slides_with_ms_precision() {
        let key = "rpm-slide";
        let t0 = 1_000_000;
        assert!(allow_request(key, 2, t0));
        assert!(allow_request(key, 2, t0 + 1));
        assert!(!allow_request(key, 2, t0 + 2));
        // Exactly at the window edge the first entry has expired.
        assert!(allow_request(key, 2, t0 + WINDOW_MS));
        // One ms earlier it has not.
        assert!(!allow_request(key, 2, t0 + WINDOW_MS - 1));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        for i in 0..100 {
            assert!(allow_request("unlimited", 0, i));
        }
    }

    #[test]
    fn tpm_sums_tokens_in_window() {
        let key = "tpm";
        let t0 = 5_000_000;
        assert!(allow_tokens(key, 600, 1000, t0));
        assert!(!allow_tokens(key, 600, 1000, t0 + 10));
        assert!(allow_tokens(key, 400, 1000, t0 + 10));
        // First entry expires at t0 + window.
        assert!(allow_tokens(key, 600, 1000, t0 + WINDOW_MS));
    }

    #[test]
    fn buckets_are_independent() {
        assert!(allow_request("a", 1, 0));
        assert!(allow_request("b", 1, 0));
        assert!(!allow_request("a", 1, 1));
    }
}

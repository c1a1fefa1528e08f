//! Oncall alert state.
//!
//! A keyed map of `{first_seen, alerted_at}` with two TTLs: error state
//! expires an hour after first sighting, and a 30-minute cooldown gates
//! repeat alerts per key. Phone-grade delivery is additionally throttled
//! by a single global key so a burst across many keys cannot dial out
//! more than once per cooldown.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::logger;

pub const ERROR_TTL_SECS: i64 = 3600;
pub const COOLDOWN_SECS: i64 = 1800;
/// How long an error must persist before it is escalated to phone grade.
pub const PERSISTENCE_SECS: i64 = 120;

const PHONE_KEY: &str = "__phone_global__";

#[derive(Debug, Clone, Copy)]
struct AlertState {
    first_seen: i64,
    alerted_at: Option<i64>,
}

static STATES: Lazy<Mutex<HashMap<String, AlertState>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Record a sighting of `key` and decide whether to alert now. Returns
/// true at most once per cooldown window per key.
pub fn mark_alerted_at(key: &str, now: i64) -> bool {
    let mut states = STATES.lock().expect("alert lock");
    let state = states.entry(key.to_string()).or_insert(AlertState {
        first_seen: now,
        alerted_at: None,
    });
    if now - state.first_seen > ERROR_TTL_SECS {
        // Stale error state: start a fresh episode.
        state.first_seen = now;
        state.alerted_at = None;
    }
    match state.alerted_at {
        Some(at) if now - at < COOLDOWN_SECS => false,
        _ => {
            state.alerted_at = Some(now);
            true
        }
    }
}

pub fn mark_alerted(key: &str) -> bool {
    mark_alerted_at(key, now_unix())
}

/// Seconds the error behind `key` has persisted, if it is being tracked.
pub fn persisted_secs_at(key: &str, now: i64) -> Option<i64> {
    STATES
        .lock()
        .expect("alert lock")
        .get(key)
        .map(|s| now - s.first_seen)
}

/// Whether a phone-grade delivery may go out now; shared across all keys.
pub fn phone_allowed_at(now: i64) -> bool {
    mark_alerted_at(PHONE_KEY, now)
}

pub fn clear(key: &str) {
    STATES.lock().expect("alert lock").remove(key);
}

/// Emit an alert for `key` unless its cooldown is active. Delivery here
/// is the log stream; an external notifier consumes the same gate.
pub fn notify(key: &str, message: &str) {
    if mark_alerted(key) {
        logger::error("alert", message);
    }
}

/// Escalation path for persistent faults: fires only after the error has
/// been seen continuously for the persistence window AND the global phone
/// throttle allows it.
pub fn notify_urgent_at(key: &str, message: &str, now: i64) -> bool {
    {
        let mut states = STATES.lock().expect("alert lock");
        states.entry(key.to_string()).or_insert(AlertState {
            first_seen: now,
            alerted_at: None,
        });
    }
    let persisted = persisted_secs_at(key, now).unwrap_or(0);
    if persisted < PERSISTENCE_SECS {
        return false;
    }
    if !phone_allowed_at(now) {
        return false;
    }
    logger::error("alert", &format!("URGENT: {}", message));
    true
}

pub fn notify_urgent(key: &str, message: &str) -> bool {
    notify_urgent_at(key, message, now_unix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_repeat_alerts() {
        let t0 = 1_000_000;
        assert!(mark_alerted_at("t-cooldown", t0));
        assert!(!mark_alerted_at("t-cooldown", t0 + 1));
        assert!(!mark_alerted_at("t-cooldown", t0 + COOLDOWN_SECS - 1));
        assert!(mark_alerted_at("t-cooldown", t0 + COOLDOWN_SECS));
    }

    #[test]
    fn clear_resets_the_key() {
        let t0 = 2_000_000;
        assert!(mark_alerted_at("t-clear", t0));
        clear("t-clear");
        assert!(mark_alerted_at("t-clear", t0 + 1));
    }

    #[test]
    fn error_state_expires_after_ttl() {
        let t0 = 3_000_000;
        assert!(mark_alerted_at("t-ttl", t0));
        // Past the error TTL the episode restarts and may alert again.
        assert!(mark_alerted_at("t-ttl", t0 + ERROR_TTL_SECS + 1));
    }

    #[test]
    fn phone_throttle_is_global_across_keys() {
        clear(PHONE_KEY);
        let t0 = 4_000_000;
        // Two different keys persist long enough.
        assert!(!notify_urgent_at("db-a", "a down", t0));
        assert!(!notify_urgent_at("db-b", "b down", t0));
        let later = t0 + PERSISTENCE_SECS;
        assert!(notify_urgent_at("db-a", "a down", later));
        // Second key is throttled by the shared phone gate.
        assert!(!notify_urgent_at("db-b", "b down", later + 1));
    }
}

//! IP blocklist with TTL entries.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// ip -> unix seconds the ban expires; `i64::MAX` for permanent bans.
static BLOCKED: Lazy<Mutex<HashMap<String, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn is_blocked(ip: &str, now_unix: i64) -> bool {
    let mut blocked = BLOCKED.lock().expect("blocklist lock");
    match blocked.get(ip) {
        Some(until) if *until > now_unix => true,
        Some(_) => {
            blocked.remove(ip);
            false
        }
        None => false,
    }
}

pub fn block(ip: &str, ttl_secs: i64, now_unix: i64) {
    let until = now_unix.saturating_add(ttl_secs.max(0));
    BLOCKED
        .lock()
        .expect("blocklist lock")
        .insert(ip.to_string(), until);
    crate::logger::warn("blocklist", &format!("blocked {} for {}s", ip, ttl_secs));
}

pub fn unblock(ip: &str) {
    BLOCKED.lock().expect("blocklist lock").remove(ip);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_expires() {
        block("10.1.2.3", 60, 1_000);
        assert!(is_blocked("10.1.2.3", 1_030));
        assert!(!is_blocked("10.1.2.3", 1_061));
        // Expired entry was evicted.
        assert!(!is_blocked("10.1.2.3", 1_000));
    }

    #[test]
    fn unblock_clears() {
        block("10.9.9.9", 600, 0);
        unblock("10.9.9.9");
        assert!(!is_blocked("10.9.9.9", 1));
    }
}

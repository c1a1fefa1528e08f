//! Channel selection: weighted random within the best priority tier.
//!
//! The auto-disable registry lives here. The dispatcher marks a channel
//! after a hard channel fault; only the background probe task clears it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;

use crate::model::entity::{Channel, ChannelStatus};
use crate::{cache, logger, store};

use super::error::{RelayError, RelayResult};

#[derive(Debug, Clone)]
pub struct DisabledEntry {
    pub reason: String,
    pub since_unix: i64,
}

static AUTO_DISABLED: Lazy<Mutex<HashMap<i64, DisabledEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn is_auto_disabled(channel_id: i64) -> bool {
    AUTO_DISABLED
        .lock()
        .expect("selector lock")
        .contains_key(&channel_id)
}

/// Record a hard channel fault. Persists the status for positive-id
/// channels so the admin surface reflects it.
pub fn mark_auto_disabled(channel_id: i64, reason: &str) {
    let mut disabled = AUTO_DISABLED.lock().expect("selector lock");
    if disabled.contains_key(&channel_id) {
        return;
    }
    disabled.insert(
        channel_id,
        DisabledEntry {
            reason: reason.to_string(),
            since_unix: Utc::now().timestamp(),
        },
    );
    drop(disabled);
    logger::warn(
        "selector",
        &format!("channel {} auto-disabled: {}", channel_id, reason),
    );
    if channel_id > 0 {
        if let Err(e) = store::global().set_channel_status(channel_id, ChannelStatus::AutoDisabled)
        {
            logger::error(
                "selector",
                &format!("failed to persist auto-disable for {}: {}", channel_id, e),
            );
        }
    }
    crate::alert::notify(
        &format!("channel:{}", channel_id),
        &format!("channel {} auto-disabled: {}", channel_id, reason),
    );
}

/// Clear the auto-disable record; only the probe task calls this.
pub fn re_enable(channel_id: i64) {
    let removed = AUTO_DISABLED
        .lock()
        .expect("selector lock")
        .remove(&channel_id)
        .is_some();
    if !removed {
        return;
    }
    logger::info("selector", &format!("channel {} re-enabled", channel_id));
    if channel_id > 0 {
        if let Err(e) = store::global().set_channel_status(channel_id, ChannelStatus::Enabled) {
            logger::error(
                "selector",
                &format!("failed to persist re-enable for {}: {}", channel_id, e),
            );
        }
    }
    crate::alert::clear(&format!("channel:{}", channel_id));
}

pub fn auto_disabled_channels() -> Vec<(i64, DisabledEntry)> {
    AUTO_DISABLED
        .lock()
        .expect("selector lock")
        .iter()
        .map(|(id, entry)| (*id, entry.clone()))
        .collect()
}

#[cfg(test)]
pub fn reset_auto_disabled() {
    AUTO_DISABLED.lock().expect("selector lock").clear();
}

/// Pick the next channel for `model`, excluding already-tried ids.
pub fn select(model: &str, excluded: &HashSet<i64>) -> RelayResult<Arc<Channel>> {
    let candidates = cache::channels_for_model(model);
    select_from(model, candidates, excluded, &mut rand::thread_rng())
}

/// Deterministic core: filter, partition by priority, weighted draw.
pub fn select_from<R: Rng>(
    model: &str,
    candidates: Vec<Arc<Channel>>,
    excluded: &HashSet<i64>,
    rng: &mut R,
) -> RelayResult<Arc<Channel>> {
    let disabled = AUTO_DISABLED.lock().expect("selector lock");
    let eligible: Vec<Arc<Channel>> = candidates
        .into_iter()
        .filter(|ch| ch.status == ChannelStatus::Enabled)
        .filter(|ch| !disabled.contains_key(&ch.id))
        .filter(|ch| !excluded.contains(&ch.id))
        .collect();
    drop(disabled);

    if eligible.is_empty() {
        return Err(RelayError::NoChannelAvailable(model.to_string()));
    }

    // Candidates arrive priority-descending from the cache; take the
    // highest-priority non-empty partition.
    let top_priority = eligible.iter().map(|ch| ch.priority).max().unwrap_or(0);
    let tier: Vec<&Arc<Channel>> = eligible
        .iter()
        .filter(|ch| ch.priority == top_priority)
        .collect();

    let total_weight: u64 = tier.iter().map(|ch| ch.weight.max(1) as u64).sum();
    let mut draw = rng.gen_range(0..total_weight);
    for channel in &tier {
        let weight = channel.weight.max(1) as u64;
        if draw < weight {
            return Ok(Arc::clone(channel));
        }
        draw -= weight;
    }
    // Unreachable with a correct cumulative sum; keep the last as a guard.
    Ok(Arc::clone(tier[tier.len() - 1]))
}

//! Pre-charge: worst-case cost reservation and settlement.
//!
//! Reservations live in a process-local ledger keyed by group id; the
//! durable balance moves only when the consumption flusher lands the
//! settled amounts, so the ledger bounds over-admission between flushes.
//! Settlement handles are one-shot: commit or refund, idempotent by
//! request id, with drop-refund as the safety net.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::logger;
use crate::model::entity::GroupStatus;

use super::error::{RelayError, RelayResult};
use super::meta::RelayMeta;

/// Outstanding reservation totals per group.
static RESERVED: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Recently settled request ids, for commit idempotence.
static SETTLED: Lazy<Mutex<SettledSet>> = Lazy::new(|| Mutex::new(SettledSet::new(10_000)));

struct SettledSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    cap: usize,
}

impl SettledSet {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    /// Returns false if the id was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// One-shot settlement handle for a reservation.
#[derive(Debug)]
pub struct Settlement {
    request_id: String,
    group_id: String,
    max_cost: f64,
    open: bool,
}

impl Settlement {
    pub fn max_cost(&self) -> f64 {
        self.max_cost
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut reserved = RESERVED.lock().expect("precharge lock");
        if let Some(total) = reserved.get_mut(&self.group_id) {
            *total -= self.max_cost;
            if *total <= 1e-12 {
                reserved.remove(&self.group_id);
            }
        }
    }

    /// Release the reservation after a settled request. Idempotent by
    /// request id: a second commit for the same id is a no-op. The actual
    /// amount reaches the stores through the consumption pipeline.
    pub fn commit(mut self) -> bool {
        let fresh = SETTLED
            .lock()
            .expect("settled lock")
            .insert(&self.request_id);
        self.release();
        if !fresh {
            logger::warn(
                "precharge",
                &format!("duplicate settlement for {}", self.request_id),
            );
        }
        fresh
    }

    /// Release the reservation with nothing charged.
    pub fn refund(mut self) {
        self.release();
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        // An unsettled handle going out of scope means the request died
        // before settlement; treat as refund.
        self.release();
    }
}

/// Worst-case cost for a request: flat rate plus the model's input bound
/// and the output bound capped by the client-specified max_tokens.
pub fn max_cost(meta: &RelayMeta, client_max_tokens: Option<i64>) -> f64 {
    let config = &meta.model_config;
    let input_bound = if meta.estimated_usage.input_tokens > 0 {
        meta.estimated_usage.input_tokens
    } else {
        config.max_context_tokens
    };
    let mut output_bound = config.max_output_tokens;
    if let Some(client_max) = client_max_tokens {
        if client_max > 0 {
            output_bound = if output_bound > 0 {
                output_bound.min(client_max)
            } else {
                client_max
            };
        }
    }
    config.price.max_cost(input_bound.max(0), output_bound.max(0))
}

/// Reserve `max_cost` against the group's balance and the token quota.
pub fn reserve(meta: &RelayMeta, client_max_tokens: Option<i64>) -> RelayResult<Settlement> {
    let cost = max_cost(meta, client_max_tokens);

    if let Some(remaining) = meta.token.remaining_quota() {
        if remaining < cost {
            return Err(RelayError::InsufficientQuota(format!(
                "token quota exhausted: {:.6} remaining, {:.6} required",
                remaining, cost
            )));
        }
    }

    if meta.group.status != GroupStatus::Internal {
        let mut reserved = RESERVED.lock().expect("precharge lock");
        let outstanding = reserved.get(&meta.group.id).copied().unwrap_or(0.0);
        let available = meta.group.balance - outstanding;
        if available < cost {
            return Err(RelayError::InsufficientQuota(format!(
                "group balance exhausted: {:.6} available, {:.6} required",
                available, cost
            )));
        }
        *reserved.entry(meta.group.id.clone()).or_insert(0.0) += cost;
    }

    Ok(Settlement {
        request_id: meta.request_id.clone(),
        group_id: meta.group.id.clone(),
        max_cost: cost,
        open: meta.group.status != GroupStatus::Internal,
    })
}

#[cfg(test)]
pub fn outstanding_for(group_id: &str) -> f64 {
    RESERVED
        .lock()
        .expect("precharge lock")
        .get(group_id)
        .copied()
        .unwrap_or(0.0)
}

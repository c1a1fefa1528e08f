//! Write-behind aggregation buffer.
//!
//! One mutex-guarded buffer accumulates per-entity counter deltas and
//! hour/minute summary updates; merging is commutative `add`, so records
//! can arrive in any order. The flusher snapshots the buffer, issues
//! upserts, and merges failed entries back for the next tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use crate::model::log::RequestLog;
use crate::model::summary::{
    hour_bucket, minute_bucket, GroupSummaryKey, RequestCounts, SummaryData, SummaryKey,
};
use crate::store::{Store, SummaryTable};
use crate::{alert, logger};

/// Per-entity counter deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityDelta {
    pub amount: f64,
    pub request_count: i64,
    pub retry_count: i64,
}

impl EntityDelta {
    fn add(&mut self, other: &EntityDelta) {
        self.amount += other.amount;
        self.request_count += other.request_count;
        self.retry_count += other.retry_count;
    }
}

#[derive(Debug, Default)]
pub struct Buffer {
    pub groups: HashMap<String, EntityDelta>,
    pub tokens: HashMap<i64, EntityDelta>,
    pub channels: HashMap<i64, EntityDelta>,
    pub summaries: HashMap<SummaryKey, SummaryData>,
    pub summaries_minute: HashMap<SummaryKey, SummaryData>,
    pub group_summaries: HashMap<GroupSummaryKey, SummaryData>,
    pub group_summaries_minute: HashMap<GroupSummaryKey, SummaryData>,
}

impl Buffer {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.tokens.is_empty()
            && self.channels.is_empty()
            && self.summaries.is_empty()
            && self.summaries_minute.is_empty()
            && self.group_summaries.is_empty()
            && self.group_summaries_minute.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
            + self.tokens.len()
            + self.channels.len()
            + self.summaries.len()
            + self.summaries_minute.len()
            + self.group_summaries.len()
            + self.group_summaries_minute.len()
    }

    fn merge(&mut self, other: Buffer) {
        for (key, delta) in other.groups {
            self.groups.entry(key).or_default().add(&delta);
        }
        for (key, delta) in other.tokens {
            self.tokens.entry(key).or_default().add(&delta);
        }
        for (key, delta) in other.channels {
            self.channels.entry(key).or_default().add(&delta);
        }
        for (key, data) in other.summaries {
            self.summaries.entry(key).or_default().add(&data);
        }
        for (key, data) in other.summaries_minute {
            self.summaries_minute.entry(key).or_default().add(&data);
        }
        for (key, data) in other.group_summaries {
            self.group_summaries.entry(key).or_default().add(&data);
        }
        for (key, data) in other.group_summaries_minute {
            self.group_summaries_minute.entry(key).or_default().add(&data);
        }
    }
}

pub struct Pipeline {
    buffer: Mutex<Buffer>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Buffer::default()),
        }
    }

    /// Merge one completed request into every applicable key. A single
    /// short critical section covers all of them so a record is never
    /// half-applied.
    pub fn batch_update(&self, log: &RequestLog) {
        let delta = EntityDelta {
            amount: log.amount,
            request_count: 1,
            retry_count: log.retry_count as i64,
        };
        let created = Utc
            .timestamp_millis_opt(log.created_at)
            .single()
            .unwrap_or_else(Utc::now);
        let data = SummaryData {
            usage: log.usage,
            counts: RequestCounts::classify(log.code, &log.usage),
            retry_count: log.retry_count as i64,
            ttfb_ms_total: log.ttfb_ms,
            latency_ms_total: log.latency_ms,
            used_amount: log.amount,
        };
        let hour = hour_bucket(created);
        let minute = minute_bucket(created);
        let channel_hour = SummaryKey {
            channel_id: log.channel_id,
            model: log.model.clone(),
            bucket: hour,
        };
        let channel_minute = SummaryKey {
            bucket: minute,
            ..channel_hour.clone()
        };
        let group_hour = GroupSummaryKey {
            group_id: log.group_id.clone(),
            token_name: log.token_name.clone(),
            model: log.model.clone(),
            bucket: hour,
        };
        let group_minute = GroupSummaryKey {
            bucket: minute,
            ..group_hour.clone()
        };

        let mut buffer = self.buffer.lock().expect("batch lock");
        buffer
            .groups
            .entry(log.group_id.clone())
            .or_default()
            .add(&delta);
        buffer.tokens.entry(log.token_id).or_default().add(&delta);
        buffer
            .channels
            .entry(log.channel_id)
            .or_default()
            .add(&delta);
        buffer.summaries.entry(channel_hour).or_default().add(&data);
        buffer
            .summaries_minute
            .entry(channel_minute)
            .or_default()
            .add(&data);
        buffer
            .group_summaries
            .entry(group_hour)
            .or_default()
            .add(&data);
        buffer
            .group_summaries_minute
            .entry(group_minute)
            .or_default()
            .add(&data);
    }

    pub fn depth(&self) -> usize {
        self.buffer.lock().expect("batch lock").len()
    }

    /// Swap the buffer out and upsert everything. Entries whose upsert
    /// fails are merged back and retried next tick; repeated failures
    /// raise a throttled alert.
    pub fn flush(&self, store: &Store) -> usize {
        let snapshot = {
            let mut buffer = self.buffer.lock().expect("batch lock");
            std::mem::take(&mut *buffer)
        };
        if snapshot.is_empty() {
            return 0;
        }

        let mut failed = Buffer::default();
        let mut flushed = 0usize;

        for (group_id, delta) in snapshot.groups {
            match store.add_group_consumption(&group_id, delta.amount, delta.request_count) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("group", &e);
                    failed.groups.insert(group_id, delta);
                }
            }
        }
        for (token_id, delta) in snapshot.tokens {
            match store.add_token_consumption(token_id, delta.amount, delta.request_count) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("token", &e);
                    failed.tokens.insert(token_id, delta);
                }
            }
        }
        for (channel_id, delta) in snapshot.channels {
            match store.add_channel_consumption(
                channel_id,
                delta.amount,
                delta.request_count,
                delta.retry_count,
            ) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("channel", &e);
                    failed.channels.insert(channel_id, delta);
                }
            }
        }
        for (key, data) in snapshot.summaries {
            match store.upsert_summary(SummaryTable::Hour, &key, &data) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("summary", &e);
                    failed.summaries.insert(key, data);
                }
            }
        }
        for (key, data) in snapshot.summaries_minute {
            match store.upsert_summary(SummaryTable::Minute, &key, &data) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("summary_minute", &e);
                    failed.summaries_minute.insert(key, data);
                }
            }
        }
        for (key, data) in snapshot.group_summaries {
            match store.upsert_group_summary(SummaryTable::Hour, &key, &data) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("group_summary", &e);
                    failed.group_summaries.insert(key, data);
                }
            }
        }
        for (key, data) in snapshot.group_summaries_minute {
            match store.upsert_group_summary(SummaryTable::Minute, &key, &data) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    report_failure("group_summary_minute", &e);
                    failed.group_summaries_minute.insert(key, data);
                }
            }
        }

        if !failed.is_empty() {
            let mut buffer = self.buffer.lock().expect("batch lock");
            buffer.merge(failed);
        } else {
            alert::clear("consume-flush");
        }
        flushed
    }

    /// Flush until empty or the deadline passes. Returns true when the
    /// buffer drained completely.
    pub async fn drain(&self, store: &Store, deadline: Duration) -> bool {
        let started = std::time::Instant::now();
        loop {
            self.flush(store);
            if self.depth() == 0 {
                return true;
            }
            if started.elapsed() >= deadline {
                logger::error(
                    "consume",
                    &format!("drain deadline passed with {} entries left", self.depth()),
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn report_failure(what: &str, e: &rusqlite::Error) {
    logger::error("consume", &format!("{} upsert failed: {}", what, e));
    // 10-minute throttle on the operator-facing alert.
    if alert::mark_alerted("consume-flush") {
        logger::error(
            "consume",
            "consumption flush failing; entries retained for retry",
        );
    }
    alert::notify_urgent("consume-flush-db", &format!("{} upserts failing: {}", what, e));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::Mode;
    use crate::model::usage::Usage;
    use crate::store::Store;

    fn log(request_id: &str, amount: f64, usage: Usage, code: u16) -> RequestLog {
        RequestLog {
            request_id: request_id.to_string(),
            group_id: "acme".to_string(),
            token_id: 1,
            token_name: "ci".to_string(),
            channel_id: 3,
            model: "claude-3-5".to_string(),
            actual_model: "claude-3-5".to_string(),
            mode: Mode::ChatCompletions,
            code,
            created_at: 1_756_700_000_000,
            ttfb_ms: 120,
            latency_ms: 900,
            usage,
            amount,
            retry_count: 1,
            downstream_result: true,
            upstream_id: None,
            request_detail: None,
            response_detail: None,
            client_ip: None,
        }
    }

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_group(&crate::relay::admission::test_support::group("acme"))
            .unwrap();
        let mut token = crate::relay::admission::test_support::token("acme");
        token.key = "sk-batch".to_string();
        store.insert_token(&token).unwrap();
        store
            .insert_channel(&crate::relay::admission::test_support::channel(
                1,
                crate::model::entity::ChannelKind::OpenAi,
                "https://x",
                "claude-3-5",
            ))
            .unwrap();
        store
    }

    #[test]
    fn aggregation_is_commutative() {
        let records = vec![
            log("r1", 0.5, Usage::new(10, 5), 200),
            log("r2", 0.25, Usage::new(3, 7), 500),
            log("r3", 0.1, Usage::new(1, 1), 429),
        ];
        let forward = Pipeline::new();
        for record in &records {
            forward.batch_update(record);
        }
        let reversed = Pipeline::new();
        for record in records.iter().rev() {
            reversed.batch_update(record);
        }
        let a = forward.buffer.lock().unwrap();
        let b = reversed.buffer.lock().unwrap();
        assert_eq!(a.groups, b.groups);
        assert_eq!(a.summaries, b.summaries);
        assert_eq!(a.group_summaries_minute, b.group_summaries_minute);
    }

    #[test]
    fn double_entry_deltas_match() {
        let pipeline = Pipeline::new();
        pipeline.batch_update(&log("r1", 0.5, Usage::new(10, 5), 200));
        pipeline.batch_update(&log("r2", 0.25, Usage::new(4, 4), 200));
        let buffer = pipeline.buffer.lock().unwrap();
        let group = buffer.groups.get("acme").unwrap();
        let token = buffer.tokens.get(&1).unwrap();
        let channel = buffer.channels.get(&3).unwrap();
        assert!((group.amount - 0.75).abs() < 1e-9);
        assert!((group.amount - token.amount).abs() < 1e-12);
        assert!((group.amount - channel.amount).abs() < 1e-12);
        assert_eq!(group.request_count, 2);
        assert_eq!(token.request_count, channel.request_count);
    }

    #[tokio::test]
    async fn drain_empties_buffer_and_lands_sums() {
        let store = seeded_store();
        let pipeline = Pipeline::new();
        pipeline.batch_update(&log("r1", 0.5, Usage::new(10, 5), 200));
        pipeline.batch_update(&log("r2", 0.25, Usage::new(2, 2), 200));
        assert!(pipeline.depth() > 0);
        assert!(pipeline.drain(&store, Duration::from_secs(5)).await);
        assert_eq!(pipeline.depth(), 0);

        let group = store.get_group("acme").unwrap().unwrap();
        assert!((group.used_amount - 0.75).abs() < 1e-9);
        // Balance moves by exactly the settled amount.
        assert!((group.balance - (100.0 - 0.75)).abs() < 1e-9);
        assert_eq!(group.request_count, 2);

        // Token-side delta equals the group-side delta.
        let token = store.get_token(1).unwrap().unwrap();
        assert!((token.used_amount - 0.75).abs() < 1e-9);

        let key = SummaryKey {
            channel_id: 3,
            model: "claude-3-5".to_string(),
            bucket: hour_bucket(Utc.timestamp_millis_opt(1_756_700_000_000).single().unwrap()),
        };
        let summary = store
            .get_summary(SummaryTable::Hour, &key)
            .unwrap()
            .unwrap();
        assert_eq!(summary.counts.total, 2);
        assert_eq!(summary.usage.input_tokens, 12);
        assert!((summary.used_amount - 0.75).abs() < 1e-9);
    }

    #[test]
    fn flush_is_exactly_once_per_key_sum() {
        let store = seeded_store();
        let pipeline = Pipeline::new();
        pipeline.batch_update(&log("r1", 0.5, Usage::new(10, 5), 200));
        pipeline.flush(&store);
        // Second flush with an empty buffer must not double-apply.
        pipeline.flush(&store);
        let group = store.get_group("acme").unwrap().unwrap();
        assert!((group.used_amount - 0.5).abs() < 1e-9);
    }
}

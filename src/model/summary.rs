//! Time-bucketed usage aggregates.
//!
//! Summaries are keyed by (channel, model, bucket) or
//! (group, token name, model, bucket), at hour and minute granularity.
//! `SummaryData::add` is commutative so the write-behind buffer can merge
//! contributions in any order.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::usage::Usage;

/// Aggregation key for per-channel summaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryKey {
    pub channel_id: i64,
    pub model: String,
    /// Unix seconds at the start of the bucket.
    pub bucket: i64,
}

/// Aggregation key for per-group summaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupSummaryKey {
    pub group_id: String,
    pub token_name: String,
    pub model: String,
    pub bucket: i64,
}

/// Request counts by status class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestCounts {
    pub total: i64,
    pub success: i64,
    pub c4xx: i64,
    pub c5xx: i64,
    pub c429: i64,
    pub c400: i64,
    pub c500: i64,
    pub cache_hit: i64,
    pub web_search: i64,
}

impl RequestCounts {
    pub fn add(&mut self, other: &RequestCounts) {
        self.total += other.total;
        self.success += other.success;
        self.c4xx += other.c4xx;
        self.c5xx += other.c5xx;
        self.c429 += other.c429;
        self.c400 += other.c400;
        self.c500 += other.c500;
        self.cache_hit += other.cache_hit;
        self.web_search += other.web_search;
    }

    /// Counts for one completed request.
    pub fn classify(code: u16, usage: &Usage) -> Self {
        let mut counts = RequestCounts {
            total: 1,
            ..Default::default()
        };
        match code {
            200..=299 => counts.success = 1,
            429 => {
                counts.c4xx = 1;
                counts.c429 = 1;
            }
            400 => {
                counts.c4xx = 1;
                counts.c400 = 1;
            }
            401..=499 => counts.c4xx = 1,
            500 => {
                counts.c5xx = 1;
                counts.c500 = 1;
            }
            501..=599 => counts.c5xx = 1,
            _ => {}
        }
        if usage.cached_tokens > 0 {
            counts.cache_hit = 1;
        }
        if usage.web_search_count > 0 {
            counts.web_search = 1;
        }
        counts
    }
}

/// Summed data for one bucket. Addition is field-wise and commutative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryData {
    pub usage: Usage,
    pub counts: RequestCounts,
    pub retry_count: i64,
    pub ttfb_ms_total: i64,
    pub latency_ms_total: i64,
    pub used_amount: f64,
}

impl SummaryData {
    pub fn add(&mut self, other: &SummaryData) {
        self.usage.add(&other.usage);
        self.counts.add(&other.counts);
        self.retry_count += other.retry_count;
        self.ttfb_ms_total += other.ttfb_ms_total;
        self.latency_ms_total += other.latency_ms_total;
        self.used_amount += other.used_amount;
    }
}

/// Start of the hour containing `ts`, unix seconds.
pub fn hour_bucket(ts: DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    secs - secs.rem_euclid(3600)
}

/// Start of the minute containing `ts`, unix seconds.
pub fn minute_bucket(ts: DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    secs - i64::from(ts.second())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_align() {
        let ts = "2026-03-01T10:17:42Z".parse::<DateTime<Utc>>().unwrap();
        let hour = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let minute = "2026-03-01T10:17:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(hour_bucket(ts), hour.timestamp());
        assert_eq!(minute_bucket(ts), minute.timestamp());
    }

    #[test]
    fn classify_codes() {
        let usage = Usage::default();
        assert_eq!(RequestCounts::classify(200, &usage).success, 1);
        let rl = RequestCounts::classify(429, &usage);
        assert_eq!((rl.c4xx, rl.c429), (1, 1));
        let bad = RequestCounts::classify(400, &usage);
        assert_eq!((bad.c4xx, bad.c400), (1, 1));
        let ise = RequestCounts::classify(500, &usage);
        assert_eq!((ise.c5xx, ise.c500), (1, 1));
        assert_eq!(RequestCounts::classify(502, &usage).c5xx, 1);
    }

    #[test]
    fn classify_cache_and_search() {
        let mut usage = Usage::new(10, 5);
        usage.cached_tokens = 4;
        usage.web_search_count = 1;
        let counts = RequestCounts::classify(200, &usage);
        assert_eq!(counts.cache_hit, 1);
        assert_eq!(counts.web_search, 1);
    }

    #[test]
    fn add_commutes() {
        let mut a = SummaryData {
            usage: Usage::new(10, 5),
            counts: RequestCounts::classify(200, &Usage::default()),
            retry_count: 1,
            ttfb_ms_total: 120,
            latency_ms_total: 900,
            used_amount: 0.5,
        };
        let mut b = SummaryData {
            usage: Usage::new(3, 7),
            counts: RequestCounts::classify(500, &Usage::default()),
            retry_count: 0,
            ttfb_ms_total: 40,
            latency_ms_total: 100,
            used_amount: 0.25,
        };
        let mut ab = a.clone();
        ab.add(&b);
        let b_then_a = {
            b.add(&a);
            b
        };
        a = ab;
        assert_eq!(a, b_then_a);
    }
}

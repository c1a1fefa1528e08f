//! Model pricing: flat per-token rates plus conditional tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usage::Usage;

/// Per-unit rates, USD per token (or per call for `per_request` and
/// `web_search`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rates {
    pub per_request: f64,
    pub input: f64,
    pub output: f64,
    pub image_input: f64,
    pub audio_input: f64,
    pub cached: f64,
    pub cache_creation: f64,
    pub web_search: f64,
}

impl Rates {
    /// Cost of a usage record at these rates.
    pub fn amount(&self, usage: &Usage) -> f64 {
        self.per_request
            + usage.input_tokens as f64 * self.input
            + usage.output_tokens as f64 * self.output
            + usage.image_input_tokens as f64 * self.image_input
            + usage.audio_input_tokens as f64 * self.audio_input
            + usage.cached_tokens as f64 * self.cached
            + usage.cache_creation_tokens as f64 * self.cache_creation
            + usage.web_search_count as f64 * self.web_search
    }
}

/// Bounds for one conditional tier. Zero means unbounded for token maxima
/// and missing means unbounded for times. Token bounds are inclusive; time
/// bounds are strict on the endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceCondition {
    pub input_token_min: i64,
    pub input_token_max: i64,
    pub output_token_min: i64,
    pub output_token_max: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl PriceCondition {
    fn input_max(&self) -> i64 {
        if self.input_token_max == 0 {
            i64::MAX
        } else {
            self.input_token_max
        }
    }

    fn output_max(&self) -> i64 {
        if self.output_token_max == 0 {
            i64::MAX
        } else {
            self.output_token_max
        }
    }

    pub fn matches(&self, usage: &Usage, now: DateTime<Utc>) -> bool {
        if usage.input_tokens < self.input_token_min || usage.input_tokens > self.input_max() {
            return false;
        }
        if usage.output_tokens < self.output_token_min || usage.output_tokens > self.output_max() {
            return false;
        }
        if let Some(start) = self.start_time {
            if now <= start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if now >= end {
                return false;
            }
        }
        true
    }

    fn input_overlaps(&self, other: &Self) -> bool {
        self.input_token_min <= other.input_max() && other.input_token_min <= self.input_max()
    }

    fn output_overlaps(&self, other: &Self) -> bool {
        self.output_token_min <= other.output_max() && other.output_token_min <= self.output_max()
    }

    fn time_overlaps(&self, other: &Self) -> bool {
        // Strict on endpoints: touching intervals do not overlap.
        let a_start = self.start_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let a_end = self.end_time.unwrap_or(DateTime::<Utc>::MAX_UTC);
        let b_start = other.start_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let b_end = other.end_time.unwrap_or(DateTime::<Utc>::MAX_UTC);
        a_start < b_end && b_start < a_end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionalPrice {
    pub condition: PriceCondition,
    pub rates: Rates,
}

/// Price of one model: base rates plus an ordered list of conditional
/// tiers. Validation guarantees at most one tier matches any
/// (usage, time) point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Price {
    #[serde(flatten)]
    pub base: Rates,
    pub conditional: Vec<ConditionalPrice>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PriceError {
    #[error("conditional prices {0} and {1} overlap on tokens and time")]
    Overlap(usize, usize),
    #[error("conditional prices must be non-decreasing on input_token_min then input_token_max (entry {0})")]
    Unordered(usize),
}

impl Price {
    /// Validate tier invariants: no pair may overlap on input tokens AND
    /// output tokens AND time simultaneously, and entries must be sorted
    /// non-decreasing on `input_token_min` then `input_token_max`
    /// (0 meaning unbounded sorts last).
    pub fn validate(&self) -> Result<(), PriceError> {
        for i in 1..self.conditional.len() {
            let prev = &self.conditional[i - 1].condition;
            let cur = &self.conditional[i].condition;
            let key = |c: &PriceCondition| (c.input_token_min, c.input_max());
            if key(prev) > key(cur) {
                return Err(PriceError::Unordered(i));
            }
        }
        for i in 0..self.conditional.len() {
            for j in (i + 1)..self.conditional.len() {
                let a = &self.conditional[i].condition;
                let b = &self.conditional[j].condition;
                if a.input_overlaps(b) && a.output_overlaps(b) && a.time_overlaps(b) {
                    return Err(PriceError::Overlap(i, j));
                }
            }
        }
        Ok(())
    }

    /// First tier containing (usage, now), else the base rates.
    pub fn select(&self, usage: &Usage, now: DateTime<Utc>) -> &Rates {
        self.conditional
            .iter()
            .find(|entry| entry.condition.matches(usage, now))
            .map(|entry| &entry.rates)
            .unwrap_or(&self.base)
    }

    /// Final amount for a settled request.
    pub fn amount(&self, usage: &Usage, now: DateTime<Utc>) -> f64 {
        self.select(usage, now).amount(usage)
    }

    /// Worst-case cost used by pre-charge: flat rate plus bounds times the
    /// base input/output rates.
    pub fn max_cost(&self, max_input_tokens: i64, max_output_tokens: i64) -> f64 {
        self.base.per_request
            + max_input_tokens as f64 * self.base.input
            + max_output_tokens as f64 * self.base.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(
        input_min: i64,
        input_max: i64,
        output_min: i64,
        output_max: i64,
        input_rate: f64,
        output_rate: f64,
    ) -> ConditionalPrice {
        ConditionalPrice {
            condition: PriceCondition {
                input_token_min: input_min,
                input_token_max: input_max,
                output_token_min: output_min,
                output_token_max: output_max,
                ..Default::default()
            },
            rates: Rates {
                input: input_rate,
                output: output_rate,
                ..Default::default()
            },
        }
    }

    /// Tiers from the long-context pricing scheme: short outputs, long
    /// outputs, then long inputs.
    fn tiered_price() -> Price {
        Price {
            base: Rates {
                input: 0.001,
                output: 0.004,
                ..Default::default()
            },
            conditional: vec![
                tier(0, 32_000, 0, 200, 0.0008, 0.002),
                tier(0, 32_000, 201, 16_000, 0.0008, 0.008),
                tier(32_001, 128_000, 0, 0, 0.0012, 0.016),
            ],
        }
    }

    #[test]
    fn tiered_price_is_valid() {
        assert_eq!(tiered_price().validate(), Ok(()));
    }

    #[test]
    fn select_long_input_tier() {
        let price = tiered_price();
        let rates = price.select(&Usage::new(40_000, 500), Utc::now());
        assert!((rates.input - 0.0012).abs() < 1e-12);
        assert!((rates.output - 0.016).abs() < 1e-12);
    }

    #[test]
    fn select_short_tier() {
        let price = tiered_price();
        let rates = price.select(&Usage::new(10_000, 50), Utc::now());
        assert!((rates.input - 0.0008).abs() < 1e-12);
        assert!((rates.output - 0.002).abs() < 1e-12);
    }

    #[test]
    fn select_falls_back_to_base() {
        let price = tiered_price();
        let rates = price.select(&Usage::new(500_000, 10), Utc::now());
        assert!((rates.input - 0.001).abs() < 1e-12);
    }

    #[test]
    fn at_most_one_tier_matches() {
        let price = tiered_price();
        let now = Utc::now();
        for (input, output) in [(0, 0), (32_000, 200), (32_000, 201), (32_001, 0), (128_000, 16_000)]
        {
            let usage = Usage::new(input, output);
            let matching = price
                .conditional
                .iter()
                .filter(|t| t.condition.matches(&usage, now))
                .count();
            assert!(matching <= 1, "({input},{output}) matched {matching} tiers");
        }
    }

    #[test]
    fn overlap_is_rejected() {
        let price = Price {
            base: Rates::default(),
            conditional: vec![tier(0, 100, 0, 0, 0.1, 0.1), tier(50, 200, 0, 0, 0.2, 0.2)],
        };
        assert_eq!(price.validate(), Err(PriceError::Overlap(0, 1)));
    }

    #[test]
    fn unordered_is_rejected() {
        let price = Price {
            base: Rates::default(),
            conditional: vec![tier(100, 200, 0, 0, 0.1, 0.1), tier(0, 50, 0, 0, 0.2, 0.2)],
        };
        assert_eq!(price.validate(), Err(PriceError::Unordered(1)));
    }

    #[test]
    fn touching_time_windows_do_not_overlap() {
        let noon = "2026-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut a = tier(0, 0, 0, 0, 0.1, 0.1);
        a.condition.end_time = Some(noon);
        let mut b = tier(0, 0, 0, 0, 0.2, 0.2);
        b.condition.start_time = Some(noon);
        let price = Price {
            base: Rates::default(),
            conditional: vec![a, b],
        };
        assert_eq!(price.validate(), Ok(()));
        // The shared endpoint itself matches neither tier (strict bounds).
        let usage = Usage::new(1, 1);
        assert!(!price.conditional[0].condition.matches(&usage, noon));
        assert!(!price.conditional[1].condition.matches(&usage, noon));
    }

    #[test]
    fn amount_uses_selected_tier() {
        let price = tiered_price();
        let usage = Usage::new(10_000, 50);
        let amount = price.amount(&usage, Utc::now());
        assert!((amount - (10_000.0 * 0.0008 + 50.0 * 0.002)).abs() < 1e-9);
    }

    #[test]
    fn max_cost_uses_base_rates() {
        let price = tiered_price();
        let cost = price.max_cost(1000, 100);
        assert!((cost - (1000.0 * 0.001 + 100.0 * 0.004)).abs() < 1e-12);
    }
}

//! Token usage counters.

use serde::{Deserialize, Serialize};

/// Counted units consumed by a single request. Counters are signed so that
/// settlement deltas (actual minus reserved) can be represented directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: i64,
    pub image_input_tokens: i64,
    pub audio_input_tokens: i64,
    pub output_tokens: i64,
    pub image_output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub reasoning_tokens: i64,
    pub total_tokens: i64,
    pub web_search_count: i64,
}

impl Usage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }

    /// Field-wise addition; commutative by construction.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.image_input_tokens += other.image_input_tokens;
        self.audio_input_tokens += other.audio_input_tokens;
        self.output_tokens += other.output_tokens;
        self.image_output_tokens += other.image_output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.total_tokens += other.total_tokens;
        self.web_search_count += other.web_search_count;
    }

    /// Recompute `total_tokens` from input + output; used after streaming
    /// accumulation where totals arrive piecemeal.
    pub fn finalize_total(&mut self) {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_fieldwise() {
        let mut a = Usage::new(10, 5);
        let mut b = Usage::new(1, 2);
        b.cached_tokens = 7;
        b.web_search_count = 1;
        a.add(&b);
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 7);
        assert_eq!(a.cached_tokens, 7);
        assert_eq!(a.web_search_count, 1);
        assert_eq!(a.total_tokens, 18);
    }

    #[test]
    fn finalize_total_only_fills_zero() {
        let mut u = Usage {
            input_tokens: 3,
            output_tokens: 4,
            ..Default::default()
        };
        u.finalize_total();
        assert_eq!(u.total_tokens, 7);
        u.finalize_total();
        assert_eq!(u.total_tokens, 7);
    }
}

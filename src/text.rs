//! Text helpers: byte-bounded truncation and token estimation.

/// Truncate `s` to at most `max_bytes` bytes without splitting a
/// character. Returns a borrowed slice; `result.len() <= max_bytes`.
pub fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Estimate the token count of `text`.
///
/// Short texts are counted per word-and-punctuation cluster; texts longer
/// than `fuzzy_threshold` bytes fall back to the cheap len/4 approximation.
pub fn estimate_tokens(text: &str, fuzzy_threshold: usize) -> i64 {
    if text.is_empty() {
        return 0;
    }
    if text.len() > fuzzy_threshold {
        return (text.chars().count() as i64 / 4).max(1);
    }
    let mut tokens = 0i64;
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if !in_word {
                tokens += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !ch.is_whitespace() {
                tokens += 1;
            }
        }
    }
    tokens.max(1)
}

/// Estimate with the configured threshold.
pub fn estimate_tokens_cfg(text: &str) -> i64 {
    estimate_tokens(text, crate::config::load().fuzzy_token_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_never_splits_runes() {
        let s = "héllo wörld 中文字符";
        for n in 0..=s.len() {
            let out = truncate(s, n);
            assert!(out.len() <= n);
            assert!(s.starts_with(out));
            // Slicing on a char boundary is the property; a panic here
            // would mean we split a rune.
            let _ = out.chars().count();
        }
    }

    #[test]
    fn truncate_noop_when_short() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abc", 3), "abc");
    }

    #[test]
    fn truncate_multibyte_boundary() {
        // '中' is 3 bytes; cutting at 4 must back off to the boundary.
        let s = "中中";
        assert_eq!(truncate(s, 4), "中");
        assert_eq!(truncate(s, 2), "");
    }

    #[test]
    fn estimate_precise_counts_words_and_punct() {
        assert_eq!(estimate_tokens("hello world", 1024), 2);
        assert_eq!(estimate_tokens("hello, world!", 1024), 4);
        assert_eq!(estimate_tokens("", 1024), 0);
        assert_eq!(estimate_tokens(" ", 1024), 1);
    }

    #[test]
    fn estimate_fuzzy_over_threshold() {
        let text = "a".repeat(100);
        assert_eq!(estimate_tokens(&text, 50), 25);
    }
}

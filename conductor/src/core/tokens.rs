//! Token estimation shared by routing, pruning, and the iteration budgets.
//!
//! The estimate is a character heuristic, not a tokenizer: `ceil(chars / 3.5)`.
//! It only has to be monotonic and cheap, since every budget in the engine is
//! compared against the same estimate.

/// Average characters per token used by the heuristic.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars as f64 / CHARS_PER_TOKEN).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up_partial_tokens() {
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 2);
        assert_eq!(estimate_tokens("abcdefgh"), 3);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 7 multi-byte chars estimate the same as 7 ascii chars.
        assert_eq!(estimate_tokens("ééééééé"), estimate_tokens("abcdefg"));
    }
}

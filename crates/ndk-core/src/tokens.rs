//! Token estimation heuristic.
//!
//! Budgets throughout the crate (chunking, rendering groups, trimming) are
//! expressed in tokens. The estimate is deliberately tokenizer-free so that
//! identical inputs always produce identical chunk layouts regardless of the
//! model in use.

/// Estimated token cost of one embedded image.
pub const IMAGE_TOKENS_ESTIMATE: usize = 800;

/// Average number of characters per token for prose and data text.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the number of tokens for `text` plus `num_embeds` embedded media.
///
/// Uses the 4-characters-per-token heuristic, rounded up. Embeds are counted
/// separately because the chunk optimizer treats them as free while the
/// observation token counts must include them.
#[must_use]
pub fn estimate_tokens(text: &str, num_embeds: usize) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) + num_embeds * IMAGE_TOKENS_ESTIMATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens("", 0), 0);
        assert_eq!(estimate_tokens("a", 0), 1);
        assert_eq!(estimate_tokens("abcd", 0), 1);
        assert_eq!(estimate_tokens("abcde", 0), 2);
    }

    #[test]
    fn test_estimate_counts_embeds() {
        assert_eq!(estimate_tokens("", 2), 2 * IMAGE_TOKENS_ESTIMATE);
        assert_eq!(
            estimate_tokens("abcd", 1),
            1 + IMAGE_TOKENS_ESTIMATE
        );
    }

    #[test]
    fn test_estimate_uses_chars_not_bytes() {
        // Four multi-byte characters still count as one token.
        assert_eq!(estimate_tokens("日本語文", 0), 1);
    }
}

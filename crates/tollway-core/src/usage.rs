use serde::{Deserialize, Serialize};

/// Token counts reported by the upstream provider for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens written to the prompt cache
    pub cache_creation_tokens: u64,
    /// Tokens served from the prompt cache
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Sum of all four token categories
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_all_categories() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cache_creation_tokens: 3,
            cache_read_tokens: 4,
        };
        assert_eq!(usage.total(), 37);
        assert!(!usage.is_empty());
        assert!(TokenUsage::default().is_empty());
    }
}

//! Token Counting
//!
//! Budget estimation for context assembly. Estimates only need to be
//! consistent and conservative; the budget invariant is enforced against
//! these numbers, not against any particular backend's tokenizer.

use std::sync::Arc;

/// Token counting interface.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in text.
    fn count_text(&self, text: &str) -> usize;
}

/// Character-ratio estimator.
///
/// Average ~4 characters per token for English prose, with a 10% buffer for
/// special tokens. Swap in a real tokenizer behind the trait if a backend
/// needs exact counts.
pub struct HeuristicCounter {
    chars_per_token: f32,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: f32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1.0),
        }
    }

    pub fn prose() -> Self {
        Self::new(4.0)
    }

    /// Shared handle with prose defaults.
    pub fn shared() -> Arc<dyn TokenCounter> {
        Arc::new(Self::prose())
    }
}

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let base = (text.chars().count() as f32 / self.chars_per_token).ceil() as usize;
        base + (base / 10)
    }
}

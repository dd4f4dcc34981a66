//! Core types for the memory fusion engine.

use serde::{Deserialize, Serialize};

/// Where a snippet came from. Doubles as the tie-break priority when ranking
/// scores are equal: History > Private > Shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    History,
    Private,
    Shared,
}

impl MemorySource {
    /// Lower value wins ties.
    pub fn priority(self) -> u8 {
        match self {
            Self::History => 0,
            Self::Private => 1,
            Self::Shared => 2,
        }
    }
}

/// One retrieved passage of context. Immutable once retrieved; fusion may
/// produce a truncated copy of the last selected snippet, never mutate the
/// original in its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub source: MemorySource,
    pub content: String,
    /// Relevance in [0,1] as reported by the source.
    pub relevance_score: f32,
    /// Identifier in the originating store (turn id, document id, ...).
    pub origin_id: String,
}

impl MemorySnippet {
    pub fn new(
        source: MemorySource,
        content: impl Into<String>,
        relevance_score: f32,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            content: content.into(),
            relevance_score: relevance_score.clamp(0.0, 1.0),
            origin_id: origin_id.into(),
        }
    }
}

/// The assembled context for one turn.
///
/// Built fresh per turn by [`super::MemoryFusion`]; never persisted.
/// Invariant: `total_token_estimate` never exceeds the configured budget.
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub history_snippets: Vec<MemorySnippet>,
    pub private_memory_snippets: Vec<MemorySnippet>,
    pub shared_memory_snippets: Vec<MemorySnippet>,
    pub total_token_estimate: usize,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.snippet_count() == 0
    }

    pub fn snippet_count(&self) -> usize {
        self.history_snippets.len()
            + self.private_memory_snippets.len()
            + self.shared_memory_snippets.len()
    }

    /// History snippets formatted as prompt lines, oldest first.
    pub fn history_lines(&self) -> Vec<String> {
        self.history_snippets
            .iter()
            .map(|s| s.content.clone())
            .collect()
    }

    /// Memory (non-history) snippets formatted as prompt context documents.
    pub fn context_docs(&self) -> Vec<String> {
        self.private_memory_snippets
            .iter()
            .chain(self.shared_memory_snippets.iter())
            .map(|s| s.content.clone())
            .collect()
    }
}

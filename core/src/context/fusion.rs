//! Context fusion: merge, rank, and select under the token budget.
//!
//! Coordinates history retrieval and memory-provider search for one turn,
//! producing a [`ContextBlock`] whose token estimate never exceeds the
//! configured budget.

use crate::context::provider::{HistoryStore, MemoryProvider};
use crate::context::token_counter::{HeuristicCounter, TokenCounter};
use crate::context::types::{ContextBlock, MemorySnippet, MemorySource};
use crate::{EngineError, Result};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Behavior when the history store is unreachable and the input appears to
/// reference prior context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutagePolicy {
    /// Proceed with whatever context is available (default).
    Proceed,
    /// Fail the turn when the input looks like a continuation reference.
    FailContinuations,
}

/// Configuration for context fusion.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Maximum estimated tokens in the assembled context.
    pub token_budget: usize,

    /// Share of the budget the derived history window targets when a session
    /// does not pin an explicit window.
    pub history_share: f32,

    /// Fixed additive bias applied to history snippets when ranking; recency
    /// matters more than raw relevance for short-term coherence.
    pub history_bias: f32,

    /// Truncating the last partially-fitting snippet below this many tokens
    /// drops it instead.
    pub min_snippet_tokens: usize,

    /// Candidate limit per memory provider.
    pub provider_results: usize,

    pub outage_policy: HistoryOutagePolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            token_budget: 2048,
            history_share: 0.3,
            history_bias: 0.15,
            min_snippet_tokens: 16,
            provider_results: 16,
            outage_policy: HistoryOutagePolicy::Proceed,
        }
    }
}

/// A snippet plus the bookkeeping the ranking pass needs.
struct Candidate {
    snippet: MemorySnippet,
    /// Ranking score: raw relevance plus the history bias where applicable.
    effective: f32,
    /// Position in the original source ordering; final tie-break.
    order: usize,
}

/// The memory fusion engine.
pub struct MemoryFusion {
    history: Arc<dyn HistoryStore>,
    private: Option<Arc<dyn MemoryProvider>>,
    shared: Option<Arc<dyn MemoryProvider>>,
    counter: Arc<dyn TokenCounter>,
    config: FusionConfig,
}

impl MemoryFusion {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        private: Option<Arc<dyn MemoryProvider>>,
        shared: Option<Arc<dyn MemoryProvider>>,
        config: FusionConfig,
    ) -> Self {
        Self {
            history,
            private,
            shared,
            counter: HeuristicCounter::shared(),
            config,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Build the context block for one turn.
    ///
    /// `history_window` is the number of prior turns to consider; 0 derives a
    /// window sized to `history_share` of the token budget.
    #[instrument(skip(self, input), fields(session = %session_id))]
    pub async fn build_context(
        &self,
        session_id: &str,
        history_window: usize,
        input: &str,
    ) -> Result<ContextBlock> {
        let history_entries = self.fetch_history(session_id, history_window, input).await?;

        // Both providers queried concurrently; a failing provider degrades to
        // an empty result, logged as a non-fatal warning.
        let limit = self.config.provider_results;
        let (private_hits, shared_hits) = tokio::join!(
            Self::search_provider(self.private.as_deref(), input, limit),
            Self::search_provider(self.shared.as_deref(), input, limit),
        );

        let candidates = self.collect_candidates(history_entries, private_hits, shared_hits);
        let block = self.select(candidates);

        debug!(
            snippets = block.snippet_count(),
            tokens = block.total_token_estimate,
            budget = self.config.token_budget,
            "Context assembled"
        );
        Ok(block)
    }

    async fn fetch_history(
        &self,
        session_id: &str,
        history_window: usize,
        input: &str,
    ) -> Result<Vec<super::provider::HistoryEntry>> {
        // A derived window over-fetches, then trims to the history token share.
        let fetch = if history_window > 0 { history_window } else { 64 };

        let mut entries = match self.history.recent(session_id, fetch).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(session = %session_id, error = %e, "History store unavailable");
                if self.config.outage_policy == HistoryOutagePolicy::FailContinuations
                    && looks_like_continuation(input)
                {
                    return Err(EngineError::History(format!(
                        "history unavailable for continuation input: {e}"
                    )));
                }
                Vec::new()
            }
        };

        if history_window == 0 && !entries.is_empty() {
            let share_budget =
                (self.config.token_budget as f32 * self.config.history_share) as usize;
            let mut used = 0;
            let mut keep = 0;
            for entry in entries.iter().rev() {
                used += self.counter.count_text(&entry.as_prompt_text());
                if used > share_budget && keep > 0 {
                    break;
                }
                keep += 1;
            }
            let start = entries.len() - keep;
            entries.drain(..start);
        }

        Ok(entries)
    }

    async fn search_provider(
        provider: Option<&dyn MemoryProvider>,
        query: &str,
        limit: usize,
    ) -> Vec<super::provider::ScoredPassage> {
        let Some(provider) = provider else {
            return Vec::new();
        };
        match provider.search(query, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Memory provider degraded; omitting snippets");
                Vec::new()
            }
        }
    }

    fn collect_candidates(
        &self,
        history: Vec<super::provider::HistoryEntry>,
        private: Vec<super::provider::ScoredPassage>,
        shared: Vec<super::provider::ScoredPassage>,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        let mut order = 0;

        // History relevance is its recency fraction; the fixed bias is applied
        // on top when ranking.
        let count = history.len();
        for (i, entry) in history.into_iter().enumerate() {
            let recency = (i + 1) as f32 / count as f32;
            let snippet = MemorySnippet::new(
                MemorySource::History,
                entry.as_prompt_text(),
                recency,
                entry.turn_id,
            );
            candidates.push(Candidate {
                effective: snippet.relevance_score + self.config.history_bias,
                snippet,
                order,
            });
            order += 1;
        }

        for (source, hits) in [(MemorySource::Private, private), (MemorySource::Shared, shared)] {
            for hit in hits {
                let snippet =
                    MemorySnippet::new(source, hit.content, hit.relevance_score, hit.origin_id);
                candidates.push(Candidate {
                    effective: snippet.relevance_score,
                    snippet,
                    order,
                });
                order += 1;
            }
        }

        candidates
    }

    /// Greedy highest-score-first selection up to the token budget.
    ///
    /// Ties break by source priority (History > Private > Shared), then by
    /// original order. The last partially-fitting snippet is truncated to the
    /// remaining budget unless the remainder would be under the minimum
    /// useful length, in which case it is dropped.
    fn select(&self, mut candidates: Vec<Candidate>) -> ContextBlock {
        candidates.sort_by(|a, b| {
            b.effective
                .partial_cmp(&a.effective)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.snippet.source.priority().cmp(&b.snippet.source.priority()))
                .then(a.order.cmp(&b.order))
        });

        let budget = self.config.token_budget;
        let mut used = 0;
        let mut selected: Vec<(MemorySnippet, usize)> = Vec::new();

        for candidate in candidates {
            let tokens = self.counter.count_text(&candidate.snippet.content);
            if used + tokens <= budget {
                used += tokens;
                selected.push((candidate.snippet, candidate.order));
                continue;
            }

            let remaining = budget - used;
            if remaining < self.config.min_snippet_tokens {
                continue;
            }

            let (truncated, actual) =
                truncate_to_tokens(&candidate.snippet.content, remaining, &*self.counter);
            if actual < self.config.min_snippet_tokens || truncated.is_empty() {
                continue;
            }

            let mut snippet = candidate.snippet;
            snippet.content = truncated;
            used += actual;
            selected.push((snippet, candidate.order));
            // Budget exhausted by the truncation.
            break;
        }

        let mut block = ContextBlock {
            total_token_estimate: used,
            ..Default::default()
        };
        let mut history: Vec<(MemorySnippet, usize)> = Vec::new();
        for (snippet, order) in selected {
            match snippet.source {
                MemorySource::History => history.push((snippet, order)),
                MemorySource::Private => block.private_memory_snippets.push(snippet),
                MemorySource::Shared => block.shared_memory_snippets.push(snippet),
            }
        }
        // History reads chronologically in the prompt regardless of rank.
        history.sort_by_key(|(_, order)| *order);
        block.history_snippets = history.into_iter().map(|(s, _)| s).collect();

        block
    }
}

/// Longest prefix of `text` whose estimate fits in `max_tokens`.
fn truncate_to_tokens(
    text: &str,
    max_tokens: usize,
    counter: &dyn TokenCounter,
) -> (String, usize) {
    if counter.count_text(text) <= max_tokens {
        return (text.to_string(), counter.count_text(text));
    }

    let chars: Vec<char> = text.chars().collect();
    let mut lo = 0;
    let mut hi = chars.len();
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let prefix: String = chars[..mid].iter().collect();
        if counter.count_text(&prefix) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let prefix: String = chars[..lo].iter().collect();
    let tokens = counter.count_text(&prefix);
    (prefix, tokens)
}

/// Heuristic detection of inputs that reference prior context.
///
/// Deliberately conservative: only clear referential openers and phrases.
fn looks_like_continuation(input: &str) -> bool {
    const LEADING: &[&str] = &[
        "and ", "also ", "then ", "again", "what about", "how about", "it ", "that ", "this ",
        "those ", "they ",
    ];
    const ANYWHERE: &[&str] = &[
        "as before",
        "like last time",
        "previous",
        "earlier",
        "keep going",
        "continue",
        "the same",
    ];

    let text = input.trim().to_lowercase();
    LEADING.iter().any(|m| text.starts_with(m)) || ANYWHERE.iter().any(|m| text.contains(m))
}

//! External memory collaborators.
//!
//! The engine treats the persistent history store and the vector memory
//! providers as opaque services behind these traits. The in-process
//! implementations here back development, the demo, and the test suite; a
//! deployment wires real services behind the same traits.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// One completed turn as recorded in the history store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub turn_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp_ms: i64,
}

impl HistoryEntry {
    /// Render this entry as prompt lines.
    pub fn as_prompt_text(&self) -> String {
        format!("user: {}\nassistant: {}", self.user_text, self.assistant_text)
    }
}

/// Append-only log of prior turns, queried by session id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The most recent `limit` entries for a session, oldest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Append one completed turn. Appends are atomic per entry: either the
    /// full entry is recorded or nothing is.
    async fn append(&self, session_id: &str, entry: HistoryEntry) -> Result<()>;
}

/// A ranked passage returned by a memory provider.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredPassage {
    pub content: String,
    /// Relevance in [0,1].
    pub relevance_score: f32,
    pub origin_id: String,
}

/// Vector/document memory: given a query string, return ranked passages.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredPassage>>;
}

/// In-memory history store.
///
/// DashMap-backed, suitable for development and testing. A production
/// deployment implements [`HistoryStore`] against its own database.
pub struct InMemoryHistory {
    entries: DashMap<String, Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    pub fn turn_count(&self, session_id: &str) -> usize {
        self.entries.get(session_id).map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self
            .entries
            .get(session_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let start = entries.len().saturating_sub(limit);
        trace!(
            session = %session_id,
            total = entries.len(),
            returned = entries.len() - start,
            "History query"
        );
        Ok(entries[start..].to_vec())
    }

    async fn append(&self, session_id: &str, entry: HistoryEntry) -> Result<()> {
        debug!(session = %session_id, turn = %entry.turn_id, "Appending history entry");
        self.entries
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }
}

/// Fixture memory provider for development and tests.
///
/// Serves a fixed set of passages; optionally filters them by naive keyword
/// overlap with the query, and can be flipped into a failing state to
/// exercise degradation paths.
pub struct FixtureMemoryProvider {
    name: String,
    passages: Vec<ScoredPassage>,
    match_query: bool,
    failing: AtomicBool,
}

impl FixtureMemoryProvider {
    pub fn new(name: impl Into<String>, passages: Vec<ScoredPassage>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            passages,
            match_query: false,
            failing: AtomicBool::new(false),
        })
    }

    /// Only return passages sharing at least one word with the query.
    pub fn with_query_matching(name: impl Into<String>, passages: Vec<ScoredPassage>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            passages,
            match_query: true,
            failing: AtomicBool::new(false),
        })
    }

    /// A provider that fails every search.
    pub fn failing(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            passages: Vec::new(),
            match_query: false,
            failing: AtomicBool::new(true),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MemoryProvider for FixtureMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredPassage>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(crate::EngineError::MemoryProvider {
                provider: self.name.clone(),
                message: "provider unavailable".to_string(),
            });
        }

        let query_lower = query.to_lowercase();
        let words: Vec<&str> = query_lower.split_whitespace().collect();

        let mut hits: Vec<ScoredPassage> = self
            .passages
            .iter()
            .filter(|p| {
                if !self.match_query {
                    return true;
                }
                let content = p.content.to_lowercase();
                words.iter().any(|w| content.contains(w))
            })
            .cloned()
            .collect();

        hits.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(content: &str, score: f32, id: &str) -> ScoredPassage {
        ScoredPassage {
            content: content.to_string(),
            relevance_score: score,
            origin_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_history_append_and_recent() {
        let history = InMemoryHistory::new();
        for i in 0..5 {
            history
                .append(
                    "s1",
                    HistoryEntry {
                        turn_id: format!("t{i}"),
                        user_text: format!("question {i}"),
                        assistant_text: format!("answer {i}"),
                        timestamp_ms: i,
                    },
                )
                .await
                .unwrap();
        }

        let recent = history.recent("s1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        // Oldest first, window anchored at the tail.
        assert_eq!(recent[0].turn_id, "t2");
        assert_eq!(recent[2].turn_id, "t4");

        assert!(history.recent("unknown", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fixture_provider_ranks_and_limits() {
        let provider = FixtureMemoryProvider::new(
            "private",
            vec![
                passage("low", 0.2, "a"),
                passage("high", 0.9, "b"),
                passage("mid", 0.5, "c"),
            ],
        );

        let hits = provider.search("anything", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].origin_id, "b");
        assert_eq!(hits[1].origin_id, "c");
    }

    #[tokio::test]
    async fn test_fixture_provider_query_matching() {
        let provider = FixtureMemoryProvider::with_query_matching(
            "shared",
            vec![
                passage("rust borrow checker notes", 0.8, "a"),
                passage("gardening calendar", 0.9, "b"),
            ],
        );

        let hits = provider.search("borrow semantics", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].origin_id, "a");
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let provider = FixtureMemoryProvider::failing("private");
        assert!(provider.search("q", 5).await.is_err());

        provider.set_failing(false);
        assert!(provider.search("q", 5).await.unwrap().is_empty());
    }
}

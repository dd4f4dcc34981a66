//! Memory Fusion Engine
//!
//! Builds the bounded context block for one turn from three independent
//! sources: the session's persistent history, a private memory provider, and
//! a shared memory provider.
//!
//! # Architecture
//!
//! - **Types**: Core types (MemorySnippet, ContextBlock)
//! - **Provider**: Traits for the external history store and memory
//!   providers, plus in-process implementations for development and tests
//! - **Token counter**: Budget estimation for assembled context
//! - **Fusion**: Merge, rank, and select under the token budget
//!
//! # Design Principles
//!
//! 1. **Built fresh per turn**: context blocks are never persisted
//! 2. **Budget is an invariant**: `total_token_estimate <= budget`, always
//! 3. **Graceful degradation**: a failing provider is omitted, not fatal

pub mod fusion;
pub mod provider;
pub mod token_counter;
pub mod types;

pub use fusion::{FusionConfig, HistoryOutagePolicy, MemoryFusion};
pub use provider::{
    FixtureMemoryProvider, HistoryEntry, HistoryStore, InMemoryHistory, MemoryProvider,
    ScoredPassage,
};
pub use token_counter::{HeuristicCounter, TokenCounter};
pub use types::{ContextBlock, MemorySnippet, MemorySource};

// Colloquy Core Library
// Streaming multi-session conversational engine runtime

pub mod backend;
pub mod codec;
pub mod config;
pub mod context;
pub mod event;
pub mod orchestrator;
pub mod session;
pub mod telemetry;

// Export core types
pub use backend::{BackendRegistry, GenerateRequest, GenerationParams, ModelBackend};
pub use config::EngineConfig;
pub use context::{ContextBlock, HistoryStore, MemoryFusion, MemoryProvider, MemorySnippet};
pub use event::StreamEvent;
pub use session::{SessionManager, SessionSnapshot, TurnHandle, TurnInput, TurnStatus};
pub use telemetry::{EngineMetrics, EngineStats};

use std::sync::Arc;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has an active turn")]
    SessionBusy(String),

    #[error("session {0} expired after idle timeout")]
    SessionExpired(String),

    #[error("owner {owner} reached the limit of {limit} concurrent sessions")]
    QuotaExceeded { owner: String, limit: usize },

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("backend concurrency limit of {0} reached")]
    BackendSaturated(usize),

    #[error("backend produced no event within {0}ms")]
    BackendTimeout(u64),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("memory provider {provider} degraded: {message}")]
    MemoryProvider { provider: String, message: String },

    #[error("history store error: {0}")]
    History(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, EngineError>;

/// Core engine: bundles the session manager with its collaborators and the
/// background eviction sweep.
pub struct Engine {
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<EngineMetrics>,
    eviction: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<BackendRegistry>,
        history: Arc<dyn HistoryStore>,
        private_memory: Option<Arc<dyn MemoryProvider>>,
        shared_memory: Option<Arc<dyn MemoryProvider>>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let fusion = Arc::new(MemoryFusion::new(
            Arc::clone(&history),
            private_memory,
            shared_memory,
            config.fusion.clone(),
        ));
        let sessions = SessionManager::new(config, registry, fusion, history, Arc::clone(&metrics));

        Self {
            sessions,
            metrics,
            eviction: None,
        }
    }

    /// Start background work (currently the idle-session eviction sweep).
    pub fn start(&mut self) {
        tracing::info!("Starting Colloquy engine...");
        if self.eviction.is_none() {
            self.eviction = Some(self.sessions.spawn_eviction_loop());
        }
        tracing::info!("Colloquy engine started");
    }

    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down Colloquy engine...");
        if let Some(handle) = self.eviction.take() {
            handle.abort();
        }
        self.sessions.close_all().await;
        tracing::info!("Colloquy engine shut down");
    }
}

//! Adapter registry.
//!
//! An explicit, injectable registry built at startup and passed by handle
//! into the session manager; there is no ambient global registry. Unknown
//! model ids fail at turn submission, never mid-stream.

use crate::backend::ModelBackend;
use crate::{EngineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

pub struct BackendRegistry {
    backends: DashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
        })
    }

    pub fn register(&self, backend: Arc<dyn ModelBackend>) {
        let id = backend.id().to_string();
        info!(model = %id, "Registered model backend");
        self.backends.insert(id, backend);
    }

    pub fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelBackend>> {
        self.backends
            .get(model_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnsupportedModel(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.backends.contains_key(model_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }
}

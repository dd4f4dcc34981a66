//! Model Backend Adapters
//!
//! Uniform interface over heterogeneous model backends. Each adapter
//! translates its backend's native incremental-output representation into
//! the closed [`StreamEvent`] union; the orchestrator never inspects
//! backend-native payloads.

pub mod openai;
pub mod registry;
pub mod scripted;

pub use openai::{OpenAiBackend, OpenAiConfig};
pub use registry::BackendRegistry;
pub use scripted::{ScriptedBackend, ScriptedStep};

use crate::event::StreamEvent;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

/// Generation parameters forwarded to the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_output_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_output_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// The structured prompt assembled by the orchestrator for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// System instructions.
    pub system: String,

    /// Retrieved memory passages, highest relevance first.
    pub context_docs: Vec<String>,

    /// Prior turns of this session, oldest first, already rendered as text.
    pub history: Vec<String>,

    /// The new user input.
    pub input: String,

    /// Opaque attachment references (ids), resolved by the backend if it
    /// supports them.
    pub attachments: Vec<String>,

    #[serde(default)]
    pub params: GenerationParams,
}

impl GenerateRequest {
    /// Render as chat messages (system + context + history + user input).
    pub fn to_messages(&self) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if !self.system.is_empty() {
            messages.push(json!({"role": "system", "content": self.system}));
        }
        if !self.context_docs.is_empty() {
            let mut context_block = String::from("Context:\n");
            for doc in &self.context_docs {
                context_block.push_str("- ");
                context_block.push_str(doc);
                context_block.push('\n');
            }
            messages.push(json!({"role": "system", "content": context_block}));
        }
        for turn in &self.history {
            messages.push(json!({"role": "user", "content": turn}));
        }
        let mut input = self.input.clone();
        for attachment in &self.attachments {
            input.push_str(&format!("\n[attachment: {attachment}]"));
        }
        messages.push(json!({"role": "user", "content": input}));
        messages
    }
}

/// A model backend adapter.
///
/// `generate` emits zero or more `Delta`/`FinalText` events into `events`,
/// then exactly one `Done` or `Error`, and returns. A closed receiver means
/// the turn is gone; adapters stop producing and return `Ok`.
#[async_trait]
pub trait ModelBackend: Send + Sync + std::fmt::Debug {
    /// Registry id this adapter is selected by.
    fn id(&self) -> &str;

    async fn generate(
        &self,
        request: GenerateRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_messages_layout() {
        let request = GenerateRequest {
            system: "be brief".into(),
            context_docs: vec!["doc one".into()],
            history: vec!["user: hi\nassistant: hello".into()],
            input: "what now?".into(),
            attachments: vec!["img-1".into()],
            params: GenerationParams::default(),
        };

        let messages = request.to_messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "system");
        assert!(messages[1]["content"].as_str().unwrap().contains("doc one"));
        assert_eq!(messages[2]["role"], "user");
        let last = messages[3]["content"].as_str().unwrap();
        assert!(last.contains("what now?"));
        assert!(last.contains("[attachment: img-1]"));
    }

    #[test]
    fn test_to_messages_skips_empty_sections() {
        let request = GenerateRequest {
            input: "hello".into(),
            ..Default::default()
        };
        let messages = request.to_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }
}

use std::fs;
use std::path::Path;

use colloquy_core::EngineConfig;

/// High-level configuration for the chat console demo
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    /// Owner id sessions are opened under
    pub owner: String,
    /// Registered backend id new sessions are bound to
    pub model: String,
    /// Chunks the bundled scripted backend plays back
    pub scripted_reply: Vec<String>,
    pub engine: EngineConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        let mut engine = EngineConfig::default();
        let model = std::env::var("CHAT_CONSOLE_MODEL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "scripted".to_string());
        engine.default_model = model.clone();

        Self {
            owner: std::env::var("CHAT_CONSOLE_OWNER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "console".to_string()),
            model,
            scripted_reply: vec![
                "I am the scripted demo backend. ".to_string(),
                "Set CHAT_CONSOLE_MODEL=openai-chat to talk to a real endpoint.".to_string(),
            ],
            engine,
        }
    }
}

impl ConsoleConfig {
    /// Load configuration from a TOML file (path via CHAT_CONSOLE_CONFIG or
    /// ./chat_console.toml), overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path =
            std::env::var("CHAT_CONSOLE_CONFIG").unwrap_or_else(|_| "chat_console.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "chat_console", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<ConsoleToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "chat_console", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "chat_console", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ConsoleToml {
    pub owner: Option<String>,
    pub model: Option<String>,
    pub scripted_reply: Option<Vec<String>>,
    pub engine: Option<EngineToml>,
}

impl ConsoleToml {
    fn overlay(self, mut base: ConsoleConfig) -> ConsoleConfig {
        if let Some(o) = self.owner {
            base.owner = o;
        }
        if let Some(m) = self.model {
            base.model = m.clone();
            base.engine.default_model = m;
        }
        if let Some(r) = self.scripted_reply {
            base.scripted_reply = r;
        }
        if let Some(e) = self.engine {
            e.apply(&mut base.engine);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct EngineToml {
    pub max_sessions_per_owner: Option<usize>,
    pub max_concurrent_backend_calls: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
    pub adapter_timeout_ms: Option<u64>,
    pub system_prompt: Option<String>,
    pub keep_partial_transcripts: Option<bool>,
    pub context_token_budget: Option<usize>,
    pub history_window: Option<usize>,
    pub max_output_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl EngineToml {
    fn apply(self, e: &mut EngineConfig) {
        if let Some(x) = self.max_sessions_per_owner {
            e.max_sessions_per_owner = x;
        }
        if let Some(x) = self.max_concurrent_backend_calls {
            e.max_concurrent_backend_calls = x;
        }
        if let Some(x) = self.idle_timeout_ms {
            e.idle_timeout_ms = x;
        }
        if let Some(x) = self.adapter_timeout_ms {
            e.adapter_timeout_ms = x;
        }
        if let Some(x) = self.system_prompt {
            e.system_prompt = x;
        }
        if let Some(x) = self.keep_partial_transcripts {
            e.keep_partial_transcripts = x;
        }
        if let Some(x) = self.context_token_budget {
            e.fusion.token_budget = x;
        }
        if let Some(x) = self.history_window {
            e.default_history_window = x;
        }
        if let Some(x) = self.max_output_tokens {
            e.max_output_tokens = x;
        }
        if let Some(x) = self.temperature {
            e.temperature = x;
        }
    }
}

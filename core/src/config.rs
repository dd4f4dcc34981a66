//! Engine configuration
//!
//! All knobs have environment-driven defaults so the engine runs out of the
//! box; embedding applications overlay their own values (the demo does so
//! from TOML).

use crate::context::{FusionConfig, HistoryOutagePolicy};

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Configuration for the whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrent sessions a single owner may hold.
    pub max_sessions_per_owner: usize,

    /// Global cap on outstanding backend calls across all sessions.
    /// Admission control: submissions past the cap fail fast rather than queue.
    pub max_concurrent_backend_calls: usize,

    /// Idle threshold after which a session refuses new turns and becomes
    /// eligible for eviction.
    pub idle_timeout_ms: u64,

    /// Interval of the background eviction sweep.
    pub eviction_interval_ms: u64,

    /// Maximum wait for the next adapter event before the turn fails with a
    /// backend timeout.
    pub adapter_timeout_ms: u64,

    /// Capacity of the per-turn event channel between orchestrator and
    /// transport.
    pub event_channel_capacity: usize,

    /// Model id bound to newly opened sessions.
    pub default_model: String,

    /// Number of prior turns a new session pulls into its context.
    pub default_history_window: usize,

    /// System instructions prepended to every prompt.
    pub system_prompt: String,

    /// Keep partial transcripts of cancelled turns in history. Default is to
    /// discard them.
    pub keep_partial_transcripts: bool,

    /// Filter the known backend quirk of replaying the input text before
    /// generation. Exact-match only; see the orchestrator's echo filter.
    pub strip_prompt_echo: bool,

    /// Output-size request forwarded to backends.
    pub max_output_tokens: usize,

    /// Sampling temperature forwarded to backends.
    pub temperature: f32,

    /// Memory fusion knobs (token budget, source weighting, outage policy).
    pub fusion: FusionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let fusion = FusionConfig {
            token_budget: env_parse("COLLOQUY_CONTEXT_TOKEN_BUDGET", 2048),
            history_share: env_parse("COLLOQUY_HISTORY_SHARE", 0.3),
            history_bias: env_parse("COLLOQUY_HISTORY_BIAS", 0.15),
            min_snippet_tokens: env_parse("COLLOQUY_MIN_SNIPPET_TOKENS", 16),
            provider_results: env_parse("COLLOQUY_PROVIDER_RESULTS", 16),
            outage_policy: match env_var("COLLOQUY_HISTORY_OUTAGE_POLICY").as_deref() {
                Some("fail_continuations") => HistoryOutagePolicy::FailContinuations,
                _ => HistoryOutagePolicy::Proceed,
            },
        };

        Self {
            max_sessions_per_owner: env_parse("COLLOQUY_MAX_SESSIONS_PER_OWNER", 8),
            max_concurrent_backend_calls: env_parse("COLLOQUY_MAX_BACKEND_CALLS", 32),
            idle_timeout_ms: env_parse("COLLOQUY_IDLE_TIMEOUT_MS", 30 * 60 * 1000),
            eviction_interval_ms: env_parse("COLLOQUY_EVICTION_INTERVAL_MS", 60_000),
            adapter_timeout_ms: env_parse("COLLOQUY_ADAPTER_TIMEOUT_MS", 30_000),
            event_channel_capacity: env_parse("COLLOQUY_EVENT_CHANNEL_CAPACITY", 64),
            default_model: env_var("COLLOQUY_DEFAULT_MODEL")
                .unwrap_or_else(|| "openai-chat".to_string()),
            default_history_window: env_parse("COLLOQUY_HISTORY_WINDOW", 8),
            system_prompt: env_var("COLLOQUY_SYSTEM_PROMPT").unwrap_or_else(|| {
                "You are a helpful, concise assistant. Use the provided context when relevant."
                    .to_string()
            }),
            keep_partial_transcripts: env_parse("COLLOQUY_KEEP_PARTIAL_TRANSCRIPTS", false),
            strip_prompt_echo: env_parse("COLLOQUY_STRIP_PROMPT_ECHO", true),
            max_output_tokens: env_parse("COLLOQUY_MAX_OUTPUT_TOKENS", 512),
            temperature: env_parse("COLLOQUY_TEMPERATURE", 0.7),
            fusion,
        }
    }
}

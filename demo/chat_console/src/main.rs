//! Chat console demo.
//!
//! Reads user messages from stdin, runs them through the session engine, and
//! writes the framed event stream to stdout - one frame per line, terminated
//! by the `[DONE]` sentinel, exactly as a network transport would emit it.

mod config;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use colloquy_core::backend::{BackendRegistry, OpenAiBackend, ScriptedBackend};
use colloquy_core::context::{FixtureMemoryProvider, InMemoryHistory, ScoredPassage};
use colloquy_core::session::TurnInput;
use colloquy_core::{codec, telemetry, Engine};

use config::ConsoleConfig;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();
    let cfg = ConsoleConfig::load();

    let registry = BackendRegistry::new();
    {
        let mut scripted = ScriptedBackend::new("scripted");
        for chunk in &cfg.scripted_reply {
            scripted = scripted.delta(chunk.clone());
        }
        registry.register(scripted.shared());
    }
    match OpenAiBackend::from_env("openai-chat") {
        Ok(backend) => registry.register(Arc::new(backend)),
        Err(e) => warn!(error = %e, "OpenAI backend unavailable"),
    }

    let history = InMemoryHistory::new();
    let private = FixtureMemoryProvider::with_query_matching(
        "private-notes",
        vec![
            ScoredPassage {
                content: "The user's name is the console operator.".to_string(),
                relevance_score: 0.8,
                origin_id: "note-1".to_string(),
            },
            ScoredPassage {
                content: "Prior sessions discussed the streaming engine demo.".to_string(),
                relevance_score: 0.6,
                origin_id: "note-2".to_string(),
            },
        ],
    );

    let mut engine = Engine::new(
        cfg.engine.clone(),
        registry,
        history,
        Some(private),
        None,
    );
    engine.start();

    info!(model = %cfg.model, "Chat console ready; type a message, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_id: Option<String> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        // Absent session id means "create a new session".
        let sid = match &session_id {
            Some(sid) => sid.clone(),
            None => match engine.sessions.open_session(&cfg.owner, None).await {
                Ok(sid) => {
                    info!(session = %sid, "Opened session");
                    session_id = Some(sid.clone());
                    sid
                }
                Err(e) => {
                    eprintln!("failed to open session: {e}");
                    continue;
                }
            },
        };

        let mut handle = match engine
            .sessions
            .submit_turn(&sid, TurnInput::text(text))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("turn rejected: {e}");
                continue;
            }
        };

        while let Some(event) = handle.next_event().await {
            println!("{}", codec::encode(&event));
        }
    }

    if let Some(sid) = session_id {
        let _ = engine.sessions.close_session(&sid).await;
    }
    engine.metrics.print_stats().await;
    engine.shutdown().await;
}

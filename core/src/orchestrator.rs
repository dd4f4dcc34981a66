//! Agent Orchestrator
//!
//! Drives one logical turn: builds the prompt from fused memory plus the new
//! input, invokes the backend adapter, relays its events in order, and runs
//! the terminal bookkeeping. Single-use: one orchestrator task, one event
//! stream per turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{GenerateRequest, GenerationParams, ModelBackend};
use crate::context::{HistoryEntry, HistoryStore, MemoryFusion};
use crate::event::{error_kind, StreamEvent};
use crate::session::manager::{InFlightGuard, SessionEntry};
use crate::session::types::{now_ms, Turn, TurnStatus};
use crate::telemetry::EngineMetrics;

/// Per-turn knobs derived from the engine configuration at submission.
pub(crate) struct TurnSettings {
    pub adapter_timeout: Duration,
    pub keep_partial_transcripts: bool,
    pub system_prompt: String,
    pub strip_prompt_echo: bool,
    pub params: GenerationParams,
    pub adapter_channel_capacity: usize,
}

/// Everything one turn needs, assembled by the session manager.
pub(crate) struct TurnContext {
    pub session_id: String,
    pub entry: Arc<SessionEntry>,
    pub turn: Arc<Mutex<Turn>>,
    pub backend: Arc<dyn ModelBackend>,
    pub fusion: Arc<MemoryFusion>,
    pub history: Arc<dyn HistoryStore>,
    pub events: mpsc::Sender<StreamEvent>,
    pub cancel: CancellationToken,
    pub history_window: usize,
    pub settings: TurnSettings,
    pub metrics: Arc<EngineMetrics>,
    pub in_flight: InFlightGuard,
}

enum Outcome {
    Completed,
    Failed { kind: String, message: String },
    TimedOut,
    Cancelled,
}

/// Run one turn to a terminal state.
///
/// The client-visible contract: the stream ends in `Done` after zero or more
/// `Delta`/`FinalText` events, or in exactly one `Error` followed by `Done`.
/// Never silent truncation. Whatever happens, the session's active slot is
/// released before this task exits.
#[instrument(skip(ctx), fields(session = %ctx.session_id))]
pub(crate) async fn run_turn(ctx: TurnContext) {
    let started = Instant::now();
    let (turn_id, input_text, attachments) = {
        let turn = ctx.turn.lock().await;
        (
            turn.turn_id.clone(),
            turn.input.text.clone(),
            turn.input
                .attachments
                .iter()
                .map(|a| a.id.clone())
                .collect::<Vec<_>>(),
        )
    };

    // Phase 1: context assembly.
    let block = match ctx
        .fusion
        .build_context(&ctx.session_id, ctx.history_window, &input_text)
        .await
    {
        Ok(block) => block,
        Err(e) => {
            warn!(turn = %turn_id, error = %e, "Context assembly failed");
            finish(
                &ctx,
                &turn_id,
                started,
                String::new(),
                Outcome::Failed {
                    kind: error_kind::HISTORY_UNAVAILABLE.to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    // Phase 2: prompt assembly.
    let request = GenerateRequest {
        system: ctx.settings.system_prompt.clone(),
        context_docs: block.context_docs(),
        history: block.history_lines(),
        input: input_text.clone(),
        attachments,
        params: ctx.settings.params,
    };

    {
        let mut turn = ctx.turn.lock().await;
        turn.transition(TurnStatus::Streaming);
    }

    // Phase 3: backend dispatch on a child task with its own channel. The
    // orchestrator owns the relay and aborts the child on cancellation,
    // timeout, or any terminal event.
    let (adapter_tx, mut adapter_rx) = mpsc::channel(ctx.settings.adapter_channel_capacity);
    let backend = Arc::clone(&ctx.backend);
    let adapter_task = tokio::spawn(async move {
        if let Err(e) = backend.generate(request, adapter_tx.clone()).await {
            let _ = adapter_tx
                .send(StreamEvent::error(error_kind::BACKEND_ERROR, e.to_string()))
                .await;
        }
    });

    // Phase 4: relay loop. Events flow downstream in production order; every
    // wait on the adapter carries the configured timeout.
    let mut echo = EchoFilter::new(ctx.settings.strip_prompt_echo, &input_text);
    let mut accumulated = String::new();

    let outcome = 'relay: loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break 'relay Outcome::Cancelled,
            next = timeout(ctx.settings.adapter_timeout, adapter_rx.recv()) => {
                match next {
                    Err(_) => break 'relay Outcome::TimedOut,
                    Ok(None) => break 'relay Outcome::Failed {
                        kind: error_kind::BACKEND_ERROR.to_string(),
                        message: "backend stream ended unexpectedly".to_string(),
                    },
                    Ok(Some(StreamEvent::Delta(text))) => {
                        for piece in echo.feed(text) {
                            if piece.is_empty() {
                                continue;
                            }
                            accumulated.push_str(&piece);
                            if ctx.events.send(StreamEvent::Delta(piece)).await.is_err() {
                                // Receiver dropped: the client disconnected.
                                break 'relay Outcome::Cancelled;
                            }
                        }
                    }
                    Ok(Some(StreamEvent::FinalText(text))) => {
                        if let Some(held) = echo.take_partial() {
                            accumulated.push_str(&held);
                            if ctx.events.send(StreamEvent::Delta(held)).await.is_err() {
                                break 'relay Outcome::Cancelled;
                            }
                        }
                        accumulated.push_str(&text);
                        if ctx.events.send(StreamEvent::FinalText(text)).await.is_err() {
                            break 'relay Outcome::Cancelled;
                        }
                    }
                    Ok(Some(StreamEvent::Error { kind, message })) => {
                        break 'relay Outcome::Failed { kind, message };
                    }
                    Ok(Some(StreamEvent::Done)) => {
                        // A partial echo match that never completed was real
                        // content; flush it before finishing.
                        if let Some(held) = echo.take_partial() {
                            accumulated.push_str(&held);
                            if ctx.events.send(StreamEvent::Delta(held)).await.is_err() {
                                break 'relay Outcome::Cancelled;
                            }
                        }
                        break 'relay Outcome::Completed;
                    }
                }
            }
        }
    };

    adapter_task.abort();
    finish(&ctx, &turn_id, started, accumulated, outcome).await;
}

/// Terminal bookkeeping: history append, status transition, terminal frames,
/// slot release, metrics.
async fn finish(
    ctx: &TurnContext,
    turn_id: &str,
    started: Instant,
    accumulated: String,
    outcome: Outcome,
) {
    let status = match outcome {
        Outcome::Completed => {
            let entry = HistoryEntry {
                turn_id: turn_id.to_string(),
                user_text: ctx.turn.lock().await.input.text.clone(),
                assistant_text: accumulated.clone(),
                timestamp_ms: now_ms(),
            };
            match ctx.history.append(&ctx.session_id, entry).await {
                Ok(()) => {
                    let _ = ctx.events.send(StreamEvent::Done).await;
                    TurnStatus::Completed
                }
                Err(e) => {
                    // The append is atomic per entry, so a failure leaves no
                    // partial record; the turn is reported failed.
                    warn!(turn = %turn_id, error = %e, "History append failed");
                    let _ = ctx
                        .events
                        .send(StreamEvent::error(
                            error_kind::HISTORY_UNAVAILABLE,
                            format!("failed to record turn: {e}"),
                        ))
                        .await;
                    let _ = ctx.events.send(StreamEvent::Done).await;
                    TurnStatus::Failed
                }
            }
        }
        Outcome::Failed { kind, message } => {
            let _ = ctx
                .events
                .send(StreamEvent::Error { kind, message })
                .await;
            let _ = ctx.events.send(StreamEvent::Done).await;
            TurnStatus::Failed
        }
        Outcome::TimedOut => {
            let ms = ctx.settings.adapter_timeout.as_millis();
            let _ = ctx
                .events
                .send(StreamEvent::error(
                    error_kind::BACKEND_TIMEOUT,
                    format!("backend produced no event within {ms}ms"),
                ))
                .await;
            let _ = ctx.events.send(StreamEvent::Done).await;
            TurnStatus::Failed
        }
        Outcome::Cancelled => {
            if ctx.settings.keep_partial_transcripts && !accumulated.is_empty() {
                let entry = HistoryEntry {
                    turn_id: turn_id.to_string(),
                    user_text: ctx.turn.lock().await.input.text.clone(),
                    assistant_text: accumulated.clone(),
                    timestamp_ms: now_ms(),
                };
                if let Err(e) = ctx.history.append(&ctx.session_id, entry).await {
                    warn!(turn = %turn_id, error = %e, "Partial transcript append failed");
                }
            }
            let _ = ctx.events.send(StreamEvent::Done).await;
            TurnStatus::Cancelled
        }
    };

    {
        let mut turn = ctx.turn.lock().await;
        turn.accumulated_output = accumulated;
        turn.transition(status);
    }

    // Release the session's active slot. The entry may already be detached
    // from the table (session closed mid-turn); the release is then a no-op
    // on a dead entry.
    {
        let mut session = ctx.entry.state.lock().await;
        if session
            .active_turn
            .as_ref()
            .map(|active| active.turn_id == turn_id)
            .unwrap_or(false)
        {
            session.active_turn = None;
            session.last_active_at = now_ms();
        }
    }

    let latency = started.elapsed();
    ctx.metrics.record_turn_finished(status, latency).await;
    match status {
        TurnStatus::Completed => {
            info!(turn = %turn_id, latency_ms = latency.as_millis() as u64, "Turn completed")
        }
        _ => debug!(turn = %turn_id, status = ?status, "Turn finished"),
    }
}

/// Exact-match filter for the known backend quirk of replaying the input
/// text before generation.
///
/// Incoming deltas are held back while they keep matching the expected echo
/// prefix. On the first divergence everything held is flushed downstream
/// unchanged - the filter strips exactly the echoed prefix and nothing else,
/// never heuristically truncating the real answer.
struct EchoFilter {
    expected: String,
    matched: usize,
    /// Matching finished: either the echo was fully consumed or the stream
    /// diverged. Either way, everything now passes through.
    settled: bool,
}

impl EchoFilter {
    fn new(enabled: bool, expected: &str) -> Self {
        Self {
            expected: expected.to_string(),
            matched: 0,
            settled: !enabled || expected.is_empty(),
        }
    }

    /// Process one delta, returning the pieces to emit downstream.
    fn feed(&mut self, text: String) -> Vec<String> {
        if self.settled {
            return vec![text];
        }

        let remaining = &self.expected[self.matched..];
        if text.len() <= remaining.len() {
            if remaining.starts_with(text.as_str()) {
                self.matched += text.len();
                if self.matched == self.expected.len() {
                    // Full echo consumed and swallowed.
                    self.settled = true;
                }
                return Vec::new();
            }
        } else if text.starts_with(remaining) {
            // The echo completes inside this chunk; the rest is real output.
            let rest = text[remaining.len()..].to_string();
            self.matched = self.expected.len();
            self.settled = true;
            return vec![rest];
        }

        // Divergence: the held prefix was real content after all.
        let held = self.expected[..self.matched].to_string();
        self.settled = true;
        if held.is_empty() {
            vec![text]
        } else {
            vec![held, text]
        }
    }

    /// Text held by an incomplete match when the stream ends or switches to
    /// a final text. A fully matched echo stays swallowed.
    fn take_partial(&mut self) -> Option<String> {
        if self.settled || self.matched == 0 {
            return None;
        }
        let held = self.expected[..self.matched].to_string();
        self.settled = true;
        Some(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(filter: &mut EchoFilter, chunks: &[&str]) -> String {
        let mut out = String::new();
        for chunk in chunks {
            for piece in filter.feed(chunk.to_string()) {
                out.push_str(&piece);
            }
        }
        out
    }

    #[test]
    fn test_exact_echo_is_stripped() {
        let mut filter = EchoFilter::new(true, "hello world");
        let out = feed_all(&mut filter, &["hello ", "world", "! The answer"]);
        assert_eq!(out, "! The answer");
        assert_eq!(filter.take_partial(), None);
    }

    #[test]
    fn test_echo_completing_inside_chunk() {
        let mut filter = EchoFilter::new(true, "hi");
        let out = feed_all(&mut filter, &["hi there"]);
        assert_eq!(out, " there");
    }

    #[test]
    fn test_divergence_flushes_held_text() {
        let mut filter = EchoFilter::new(true, "hello world");
        // "hello " matches, then the stream diverges; nothing may be lost.
        let out = feed_all(&mut filter, &["hello ", "friend"]);
        assert_eq!(out, "hello friend");
    }

    #[test]
    fn test_answer_unrelated_to_input_passes_through() {
        let mut filter = EchoFilter::new(true, "what is rust?");
        let out = feed_all(&mut filter, &["Rust is", " a language"]);
        assert_eq!(out, "Rust is a language");
    }

    #[test]
    fn test_partial_match_at_stream_end_is_real_content() {
        let mut filter = EchoFilter::new(true, "hello world");
        let out = feed_all(&mut filter, &["hello"]);
        assert_eq!(out, "");
        // Stream ends mid-match: the held prefix was real output.
        assert_eq!(filter.take_partial(), Some("hello".to_string()));
    }

    #[test]
    fn test_disabled_filter_is_transparent() {
        let mut filter = EchoFilter::new(false, "hello");
        let out = feed_all(&mut filter, &["hello", " again"]);
        assert_eq!(out, "hello again");
    }

    #[test]
    fn test_fully_matched_echo_with_no_output_stays_swallowed() {
        let mut filter = EchoFilter::new(true, "ping");
        let out = feed_all(&mut filter, &["ping"]);
        assert_eq!(out, "");
        assert_eq!(filter.take_partial(), None);
    }
}

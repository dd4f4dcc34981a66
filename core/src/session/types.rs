//! Session and turn types.

use crate::event::StreamEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-unique id: timestamp plus counter.
pub(crate) fn next_id(prefix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}-{}", prefix, now_ms(), counter)
}

/// An opaque attachment reference carried with a user message. Resolution is
/// the backend's concern; the engine only forwards the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub mime_type: String,
}

/// The user input of one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnInput {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Turn lifecycle states.
///
/// `Pending -> Streaming -> {Completed | Failed}`, with `Cancelled`
/// reachable from `Pending` or `Streaming`. A turn that fails before its
/// stream opens goes `Pending -> Failed` directly. No transition leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TurnStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Streaming | Self::Failed | Self::Cancelled
            ),
            Self::Streaming => matches!(
                next,
                Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// One request/response cycle within a session.
///
/// Retained read-only after completion for audit; the history append is the
/// durable record.
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: String,
    pub session_id: String,
    pub input: TurnInput,
    pub status: TurnStatus,
    pub accumulated_output: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl Turn {
    pub fn new(session_id: impl Into<String>, input: TurnInput) -> Self {
        Self {
            turn_id: next_id("turn"),
            session_id: session_id.into(),
            input,
            status: TurnStatus::Pending,
            accumulated_output: String::new(),
            started_at: now_ms(),
            ended_at: None,
        }
    }

    /// Apply a status transition; illegal transitions are dropped with a
    /// warning rather than corrupting a terminal state.
    pub fn transition(&mut self, next: TurnStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                turn = %self.turn_id,
                from = ?self.status,
                to = ?next,
                "Ignoring illegal turn transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(now_ms());
        }
        true
    }
}

/// The turn currently occupying a session's single active slot.
pub(crate) struct ActiveTurn {
    pub turn_id: String,
    pub turn: Arc<Mutex<Turn>>,
    pub cancel: CancellationToken,
}

/// A live session. Owned exclusively by the session manager and mutated only
/// under its entry lock.
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub model_selector: String,
    pub history_window: usize,
    pub(crate) active_turn: Option<ActiveTurn>,
}

impl Session {
    pub(crate) fn new(
        owner_id: impl Into<String>,
        title: Option<String>,
        model_selector: String,
        history_window: usize,
    ) -> Self {
        let now = now_ms();
        Self {
            id: next_id("sess"),
            owner_id: owner_id.into(),
            title: title.unwrap_or_else(|| "untitled".to_string()),
            created_at: now,
            last_active_at: now,
            model_selector,
            history_window,
            active_turn: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_turn.is_some()
    }
}

/// Read-only view of a session for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub model_selector: String,
    pub history_window: usize,
    pub busy: bool,
    pub active_turn_id: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn of(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            owner_id: session.owner_id.clone(),
            title: session.title.clone(),
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            model_selector: session.model_selector.clone(),
            history_window: session.history_window,
            busy: session.is_busy(),
            active_turn_id: session.active_turn.as_ref().map(|t| t.turn_id.clone()),
        }
    }
}

/// Caller-side handle for one submitted turn: its private event stream and
/// cancellation. Dropping the handle (client disconnect) cancels the turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: String,
    pub session_id: String,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    turn: Arc<Mutex<Turn>>,
}

impl TurnHandle {
    pub(crate) fn new(
        turn_id: String,
        session_id: String,
        events: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
        turn: Arc<Mutex<Turn>>,
    ) -> Self {
        Self {
            turn_id,
            session_id,
            events,
            cancel,
            turn,
        }
    }

    /// Next event of this turn's stream, in production order. `None` once
    /// the orchestrator has finished and closed the channel.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Drain the stream to completion.
    pub async fn collect_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }

    /// Request cancellation of this turn.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn status(&self) -> TurnStatus {
        self.turn.lock().await.status
    }

    pub async fn accumulated_output(&self) -> String {
        self.turn.lock().await.accumulated_output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_state_machine() {
        let mut turn = Turn::new("s1", TurnInput::text("hi"));
        assert_eq!(turn.status, TurnStatus::Pending);

        assert!(turn.transition(TurnStatus::Streaming));
        assert!(turn.transition(TurnStatus::Completed));
        assert!(turn.ended_at.is_some());

        // Terminal states are sticky.
        assert!(!turn.transition(TurnStatus::Failed));
        assert!(!turn.transition(TurnStatus::Cancelled));
        assert_eq!(turn.status, TurnStatus::Completed);
    }

    #[test]
    fn test_cancel_reachable_from_pending_and_streaming() {
        let mut pending = Turn::new("s1", TurnInput::text("hi"));
        assert!(pending.transition(TurnStatus::Cancelled));

        let mut streaming = Turn::new("s1", TurnInput::text("hi"));
        streaming.transition(TurnStatus::Streaming);
        assert!(streaming.transition(TurnStatus::Cancelled));
    }

    #[test]
    fn test_no_skip_to_completed_from_pending() {
        let mut turn = Turn::new("s1", TurnInput::text("hi"));
        assert!(!turn.transition(TurnStatus::Completed));
        assert_eq!(turn.status, TurnStatus::Pending);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = next_id("turn");
        let b = next_id("turn");
        assert_ne!(a, b);
    }
}

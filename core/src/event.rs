// Stream event union shared by adapters, orchestrator, and codec
use serde::{Deserialize, Serialize};

/// Well-known error kinds carried by [`StreamEvent::Error`].
///
/// Kinds are plain strings on the wire so the codec round-trips them without
/// a registry; these constants cover everything the engine itself emits.
pub mod error_kind {
    pub const BACKEND_TIMEOUT: &str = "backend_timeout";
    pub const BACKEND_ERROR: &str = "backend_error";
    pub const HISTORY_UNAVAILABLE: &str = "history_unavailable";
}

/// One event of a turn's incremental output stream.
///
/// Produced by a model backend adapter, relayed by the orchestrator, framed
/// by the codec. Ephemeral: events are observed in transit and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// An incremental fragment of generated text.
    Delta(String),

    /// A complete final text from a backend that does not stream.
    FinalText(String),

    /// Terminal failure. Followed by exactly one `Done` on the wire.
    Error { kind: String, message: String },

    /// End of stream. Always the last event of a turn.
    Done,
}

impl StreamEvent {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Text payload carried by this event, if any.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Delta(text) | Self::FinalText(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

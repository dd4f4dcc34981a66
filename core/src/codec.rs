//! Stream Codec
//!
//! Pure text framing for the incremental delivery protocol. One event per
//! frame; `decode` is the exact inverse of `encode` for every event kind.
//! The codec never coalesces consecutive `Delta` frames - coalescing, if
//! desired, is a transport concern.

use crate::event::StreamEvent;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Literal sentinel marking end of stream. Always the last frame sent on a
/// turn's wire stream, even after an error frame.
pub const DONE_SENTINEL: &str = "[DONE]";

const DELTA_PREFIX: &str = "data: ";
const FINAL_PREFIX: &str = "text: ";
const ERROR_PREFIX: &str = "error: ";

#[derive(Serialize, Deserialize)]
struct ErrorFrame<'a> {
    kind: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
struct ErrorFrameOwned {
    kind: String,
    message: String,
}

/// Encode one event into its wire frame.
///
/// Delta and final-text frames carry the raw payload with no structural
/// wrapping beyond the framing prefix; error frames carry a small JSON body
/// so arbitrary kind/message text survives the round trip.
pub fn encode(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Delta(text) => format!("{DELTA_PREFIX}{text}"),
        StreamEvent::FinalText(text) => format!("{FINAL_PREFIX}{text}"),
        StreamEvent::Error { kind, message } => {
            let body = serde_json::to_string(&ErrorFrame { kind, message })
                .unwrap_or_else(|_| r#"{"kind":"backend_error","message":""}"#.to_string());
            format!("{ERROR_PREFIX}{body}")
        }
        StreamEvent::Done => DONE_SENTINEL.to_string(),
    }
}

/// Decode one wire frame back into its event.
pub fn decode(frame: &str) -> Result<StreamEvent> {
    if frame == DONE_SENTINEL {
        return Ok(StreamEvent::Done);
    }
    if let Some(text) = frame.strip_prefix(DELTA_PREFIX) {
        return Ok(StreamEvent::Delta(text.to_string()));
    }
    if let Some(text) = frame.strip_prefix(FINAL_PREFIX) {
        return Ok(StreamEvent::FinalText(text.to_string()));
    }
    if let Some(body) = frame.strip_prefix(ERROR_PREFIX) {
        let parsed: ErrorFrameOwned = serde_json::from_str(body)
            .map_err(|e| EngineError::Codec(format!("malformed error frame: {e}")))?;
        return Ok(StreamEvent::Error {
            kind: parsed.kind,
            message: parsed.message,
        });
    }
    Err(EngineError::Codec(format!(
        "unrecognized frame prefix: {:?}",
        frame.chars().take(16).collect::<String>()
    )))
}

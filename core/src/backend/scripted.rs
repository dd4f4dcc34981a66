//! Scripted in-process backend.
//!
//! Plays back a fixed sequence of stream events with optional pacing,
//! failure injection, a stall, and the input-echo quirk. Backs the demo and
//! the integration tests; real deployments use network adapters.

use crate::backend::{GenerateRequest, ModelBackend};
use crate::event::StreamEvent;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Delta(String),
    FinalText(String),
    Error { kind: String, message: String },
    /// Wait before the next event.
    Pause(Duration),
    /// Stop producing without terminating the stream; exercises the
    /// orchestrator's adapter timeout.
    Stall,
    /// Replay the request input as a delta before generation - the known
    /// backend quirk the orchestrator strips.
    EchoInput,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    id: String,
    steps: Vec<ScriptedStep>,
}

impl ScriptedBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    /// A backend that streams the given chunks and completes.
    pub fn completing(id: impl Into<String>, chunks: Vec<&str>) -> Arc<Self> {
        let mut backend = Self::new(id);
        for chunk in chunks {
            backend = backend.delta(chunk);
        }
        Arc::new(backend)
    }

    pub fn delta(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptedStep::Delta(text.into()));
        self
    }

    pub fn final_text(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptedStep::FinalText(text.into()));
        self
    }

    pub fn error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.steps.push(ScriptedStep::Error {
            kind: kind.into(),
            message: message.into(),
        });
        self
    }

    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptedStep::Pause(duration));
        self
    }

    pub fn stall(mut self) -> Self {
        self.steps.push(ScriptedStep::Stall);
        self
    }

    pub fn echo_input(mut self) -> Self {
        self.steps.push(ScriptedStep::EchoInput);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        for step in &self.steps {
            let event = match step {
                ScriptedStep::Delta(text) => StreamEvent::Delta(text.clone()),
                ScriptedStep::FinalText(text) => StreamEvent::FinalText(text.clone()),
                ScriptedStep::Error { kind, message } => StreamEvent::Error {
                    kind: kind.clone(),
                    message: message.clone(),
                },
                ScriptedStep::Pause(duration) => {
                    tokio::time::sleep(*duration).await;
                    continue;
                }
                ScriptedStep::Stall => {
                    // Never resolves on its own; the orchestrator aborts us.
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                ScriptedStep::EchoInput => StreamEvent::Delta(request.input.clone()),
            };

            let terminal = event.is_error();
            if events.send(event).await.is_err() {
                // Receiver gone; the turn was cancelled or dropped.
                return Ok(());
            }
            if terminal {
                return Ok(());
            }
        }

        let _ = events.send(StreamEvent::Done).await;
        Ok(())
    }
}

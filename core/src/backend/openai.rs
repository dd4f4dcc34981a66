//! OpenAI-compatible chat backend.
//!
//! Streams from a `/chat/completions` endpoint over SSE and normalizes the
//! chunk protocol into [`StreamEvent`]s. Endpoints that reject streaming get
//! a non-streaming fallback that yields a single `FinalText`.

use crate::backend::{GenerateRequest, ModelBackend};
use crate::event::{error_kind, StreamEvent};
use crate::{EngineError, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String, // e.g., http://localhost:8000/v1
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("OPENAI_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("OPENAI_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
        }
    }
}

#[derive(Debug)]
pub struct OpenAiBackend {
    id: String,
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(id: impl Into<String>, cfg: OpenAiConfig) -> Result<Self> {
        // Only the connection phase is bounded here; pacing of the stream
        // itself is enforced by the orchestrator's per-event timeout.
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            id: id.into(),
            http,
            cfg,
        })
    }

    pub fn from_env(id: impl Into<String>) -> Result<Self> {
        Self::new(id, OpenAiConfig::default())
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, request: &GenerateRequest, stream: bool) -> Value {
        json!({
            "model": self.cfg.model,
            "messages": request.to_messages(),
            "max_tokens": request.params.max_output_tokens as u32,
            "temperature": request.params.temperature,
            "stream": stream,
        })
    }

    /// Non-streaming fallback: one request, one `FinalText`.
    async fn generate_non_streaming(
        &self,
        request: &GenerateRequest,
        events: &mpsc::Sender<StreamEvent>,
    ) {
        let mut req = self
            .http
            .post(self.chat_url())
            .timeout(Duration::from_millis(self.cfg.request_timeout_ms))
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.json(&self.request_body(request, false)).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = events
                    .send(StreamEvent::error(
                        error_kind::BACKEND_ERROR,
                        format!("chat completions request failed: {e}"),
                    ))
                    .await;
                return;
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let _ = events
                .send(StreamEvent::error(
                    error_kind::BACKEND_ERROR,
                    format!("chat completions error: status={status} body={body}"),
                ))
                .await;
            return;
        }

        let val: Value = match resp.json().await {
            Ok(val) => val,
            Err(e) => {
                let _ = events
                    .send(StreamEvent::error(
                        error_kind::BACKEND_ERROR,
                        format!("failed to parse chat completions JSON: {e}"),
                    ))
                    .await;
                return;
            }
        };

        match extract_message_content(&val) {
            Some(text) => {
                if events.send(StreamEvent::FinalText(text)).await.is_err() {
                    return;
                }
                let _ = events.send(StreamEvent::Done).await;
            }
            None => {
                let _ = events
                    .send(StreamEvent::error(
                        error_kind::BACKEND_ERROR,
                        "missing choices[0].message.content in chat completions",
                    ))
                    .await;
            }
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let url = self.chat_url();
        debug!(target = "openai_backend", model = %self.cfg.model, "POST {} (stream)", url);

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.json(&self.request_body(&request, true)).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = events
                    .send(StreamEvent::error(
                        error_kind::BACKEND_ERROR,
                        format!("streaming request failed: {e}"),
                    ))
                    .await;
                return Ok(());
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(target = "openai_backend", %status, body = %body, "Streaming rejected; trying non-streaming fallback");
            self.generate_non_streaming(&request, &events).await;
            return Ok(());
        }

        let mut stream = resp.bytes_stream().eventsource();
        while let Some(item) = stream.next().await {
            let sse = match item {
                Ok(sse) => sse,
                Err(e) => {
                    let _ = events
                        .send(StreamEvent::error(
                            error_kind::BACKEND_ERROR,
                            format!("SSE stream error: {e}"),
                        ))
                        .await;
                    return Ok(());
                }
            };

            let raw = sse.data;
            if raw == "[DONE]" {
                let _ = events.send(StreamEvent::Done).await;
                return Ok(());
            }

            let chunk: Value = match serde_json::from_str(&raw) {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = events
                        .send(StreamEvent::error(
                            error_kind::BACKEND_ERROR,
                            format!("SSE parsing error: {e}, data: {raw}"),
                        ))
                        .await;
                    return Ok(());
                }
            };

            if let Some(message) = extract_error_message(&chunk) {
                let _ = events
                    .send(StreamEvent::error(error_kind::BACKEND_ERROR, message))
                    .await;
                return Ok(());
            }

            if let Some(text) = extract_delta_content(&chunk) {
                if !text.is_empty() && events.send(StreamEvent::Delta(text)).await.is_err() {
                    // Receiver gone: cancelled turn, stop pulling the stream.
                    return Ok(());
                }
            }
        }

        // Stream closed without the terminal sentinel.
        let _ = events
            .send(StreamEvent::error(
                error_kind::BACKEND_ERROR,
                "SSE stream closed before response completed",
            ))
            .await;
        Ok(())
    }
}

fn extract_delta_content(chunk: &Value) -> Option<String> {
    chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_message_content(value: &Value) -> Option<String> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_error_message(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("backend reported an error during streaming".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_delta_content() {
        let chunk = json!({
            "object": "chat.completion.chunk",
            "choices": [{"delta": {"content": "Hel"}, "index": 0}]
        });
        assert_eq!(extract_delta_content(&chunk), Some("Hel".to_string()));

        let finish = json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        });
        assert_eq!(extract_delta_content(&finish), None);
    }

    #[test]
    fn test_extract_message_content() {
        let value = json!({
            "choices": [{"message": {"role": "assistant", "content": "full answer"}}]
        });
        assert_eq!(
            extract_message_content(&value),
            Some("full answer".to_string())
        );
        assert_eq!(extract_message_content(&json!({})), None);
    }

    #[test]
    fn test_extract_error_message() {
        let structured = json!({"error": {"message": "rate limited"}});
        assert_eq!(
            extract_error_message(&structured),
            Some("rate limited".to_string())
        );

        let bare = json!({"error": "nope"});
        assert_eq!(extract_error_message(&bare), Some("nope".to_string()));

        assert_eq!(extract_error_message(&json!({"choices": []})), None);
    }

    #[test]
    fn test_request_body_shape() {
        let backend = OpenAiBackend::new(
            "openai-chat",
            OpenAiConfig {
                base_url: "http://localhost:8000/v1/".into(),
                model: "test-model".into(),
                api_key: None,
                request_timeout_ms: 1000,
            },
        )
        .unwrap();

        assert_eq!(backend.chat_url(), "http://localhost:8000/v1/chat/completions");

        let request = GenerateRequest {
            input: "hi".into(),
            ..Default::default()
        };
        let body = backend.request_body(&request, true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert!(body["messages"].is_array());
    }
}

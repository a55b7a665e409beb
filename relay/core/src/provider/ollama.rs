//! Ollama Provider Implementation
//!
//! Generation provider for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! This implementation uses the `/api/generate` endpoint with streaming.
//! The response body is newline-delimited JSON: one object per token with a
//! `response` field, and a final object with `done: true`, `done_reason` and
//! token counts.
//!
//! # Event Mapping
//!
//! - HTTP 2xx accepted → `control(prompt_ready)`
//! - each `response` token → `delta`
//! - `done: true` → `done` with `finishReason`, `usage` and `model`
//! - transport or HTTP failure mid-stream → `error`

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{GenerationProvider, GenerationRequest};
use crate::config::ProviderConfig;
use crate::streaming::{ControlSignal, ProviderEvent};

/// Ollama provider client
#[derive(Clone)]
pub struct OllamaProvider {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    /// Create from the provider config section
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.ollama_host.clone(), config.ollama_port)
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Build the full prompt including system and context
    fn build_prompt(request: &GenerationRequest) -> String {
        let mut full_prompt = String::new();

        if let Some(ref system) = request.system {
            full_prompt.push_str(system);
            full_prompt.push_str("\n\n");
        }

        if let Some(ref context) = request.context {
            full_prompt.push_str(context);
            full_prompt.push('\n');
        }

        full_prompt.push_str(&request.prompt);
        full_prompt
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "prompt": Self::build_prompt(request),
            "stream": true,
        });

        let mut options = Map::new();
        if (request.temperature - 0.7).abs() > f32::EPSILON {
            options.insert("temperature".to_string(), json!(request.temperature));
        }
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), json!(request.max_tokens));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

/// Translate one NDJSON line into provider events
///
/// Returns the events and whether the line was terminal.
pub(crate) fn events_from_line(data: &Value, model: &str) -> (Vec<ProviderEvent>, bool) {
    let mut events = Vec::new();

    if let Some(err) = data.get("error").and_then(Value::as_str) {
        events.push(ProviderEvent::error(err));
        return (events, true);
    }

    if let Some(token) = data.get("response").and_then(Value::as_str) {
        if !token.is_empty() {
            events.push(ProviderEvent::delta(token));
        }
    }

    let done = data.get("done").and_then(Value::as_bool).unwrap_or(false);
    if done {
        let reason = data
            .get("done_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop");
        let mut meta = Map::new();
        meta.insert("finishReason".to_string(), json!(reason));
        meta.insert(
            "usage".to_string(),
            json!({
                "prompt_tokens": data.get("prompt_eval_count").and_then(Value::as_u64),
                "completion_tokens": data.get("eval_count").and_then(Value::as_u64),
            }),
        );
        meta.insert(
            "model".to_string(),
            json!(data.get("model").and_then(Value::as_str).unwrap_or(model)),
        );

        let timings = data
            .get("total_duration")
            .and_then(Value::as_u64)
            .map(|ns| {
                let mut t = Map::new();
                t.insert("providerTotalMs".to_string(), json!(ns / 1_000_000));
                t
            });

        events.push(ProviderEvent::Done {
            meta: Some(meta),
            timings,
        });
    }
    (events, done)
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<ProviderEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::request_body(request))
            .send()
            .await?;

        // Check for HTTP errors
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let model = request.model.clone();
        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            if tx
                .send(ProviderEvent::control(ControlSignal::PromptReady))
                .await
                .is_err()
            {
                return;
            }

            let mut lines = NdjsonLines::default();
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Ollama stream cancelled");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for line in lines.push(&bytes) {
                            let Ok(data) = serde_json::from_str::<Value>(&line) else {
                                tracing::debug!(line = %line, "Skipping malformed NDJSON line");
                                continue;
                            };
                            let (events, done) = events_from_line(&data, &model);
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                            if done {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(ProviderEvent::error(e.to_string())).await;
                        return;
                    }
                    None => return,
                }
            }
        });

        Ok(rx)
    }
}

/// Splits a byte stream into complete NDJSON lines
///
/// Bytes are buffered until a newline arrives, so a UTF-8 sequence split
/// across network chunks is decoded whole.
#[derive(Debug, Default)]
struct NdjsonLines {
    buffer: Vec<u8>,
}

impl NdjsonLines {
    /// Append bytes and return the non-empty lines they complete
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_prompt_with_system_and_context() {
        let request = GenerationRequest::new("hi", "m")
            .with_system("sys")
            .with_context("ctx");
        assert_eq!(OllamaProvider::build_prompt(&request), "sys\n\nctx\nhi");
    }

    #[test]
    fn test_request_body_options() {
        let body = OllamaProvider::request_body(&GenerationRequest::new("hi", "m"));
        assert!(body.get("options").is_none());

        let body = OllamaProvider::request_body(
            &GenerationRequest::new("hi", "m")
                .with_temperature(0.2)
                .with_max_tokens(10),
        );
        assert_eq!(body["options"]["num_predict"], 10);
        assert!(body["options"].get("temperature").is_some());
    }

    #[test]
    fn test_token_line() {
        let (events, done) = events_from_line(&json!({"response": "He", "done": false}), "m");
        assert_eq!(events, vec![ProviderEvent::delta("He")]);
        assert!(!done);
    }

    #[test]
    fn test_done_line() {
        let (events, done) = events_from_line(
            &json!({
                "response": "",
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 7,
                "eval_count": 21,
                "total_duration": 5_000_000u64
            }),
            "llama3.2",
        );
        assert!(done);
        assert_eq!(events.len(), 1);
        let ProviderEvent::Done { meta: Some(meta), timings: Some(timings) } = &events[0] else {
            panic!("expected done with meta and timings");
        };
        assert_eq!(meta["finishReason"], "stop");
        assert_eq!(meta["usage"]["prompt_tokens"], 7);
        assert_eq!(meta["usage"]["completion_tokens"], 21);
        assert_eq!(meta["model"], "llama3.2");
        assert_eq!(timings["providerTotalMs"], 5);
    }

    #[test]
    fn test_error_line() {
        let (events, done) = events_from_line(&json!({"error": "model not found"}), "m");
        assert!(done);
        assert_eq!(events, vec![ProviderEvent::error("model not found")]);
    }

    #[test]
    fn test_lines_keep_split_utf8_sequence() {
        let mut lines = NdjsonLines::default();
        assert!(lines.push(b"{\"response\":\"n\xC3").is_empty());
        let complete = lines.push(b"\xA3o\",\"done\":false}\n");
        assert_eq!(complete, vec![r#"{"response":"não","done":false}"#.to_string()]);

        let data: Value = serde_json::from_str(&complete[0]).unwrap();
        let (events, _) = events_from_line(&data, "m");
        assert_eq!(events, vec![ProviderEvent::delta("não")]);
    }

    #[test]
    fn test_lines_skip_blank_and_hold_partial() {
        let mut lines = NdjsonLines::default();
        let out = lines.push(b"\n  \n{\"a\":1}\n{\"b\"");
        assert_eq!(out, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(lines.push(b":2}\r\n"), vec![r#"{"b":2}"#.to_string()]);
    }
}

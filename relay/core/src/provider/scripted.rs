//! Scripted and echo providers
//!
//! [`ScriptedProvider`] replays a fixed list of steps and is what the session
//! tests drive. [`EchoProvider`] streams the prompt back word by word so the
//! daemon can run without an upstream model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{GenerationProvider, GenerationRequest};
use crate::streaming::{ControlSignal, ProviderEvent};

/// One step of a provider script
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Push an event
    Emit(ProviderEvent),
    /// Wait before the next step
    Pause(Duration),
    /// Keep the stream open without sending anything until cancelled
    Hang,
}

/// Provider that replays a script
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Vec<ScriptStep>,
    fail_start: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Replay `steps` on every call
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            fail_start: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Emit `events` back to back
    #[must_use]
    pub fn from_events(events: Vec<ProviderEvent>) -> Self {
        Self::new(events.into_iter().map(ScriptStep::Emit).collect())
    }

    /// Fail before a stream is opened
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_start: Some(message.into()),
            ..Self::default()
        }
    }

    /// Number of `stream_completion` calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        _request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<ProviderEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_start {
            anyhow::bail!("{message}");
        }

        let (tx, rx) = mpsc::channel(32);
        let steps = self.steps.clone();
        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Pause(delay) => {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    ScriptStep::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Provider that echoes the prompt back
#[derive(Clone, Debug)]
pub struct EchoProvider {
    delay: Duration,
}

impl EchoProvider {
    /// Echo with `delay` between words
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

#[async_trait]
impl GenerationProvider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<ProviderEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let words: Vec<String> = request
            .prompt
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let model = request.model.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            if tx
                .send(ProviderEvent::control(ControlSignal::PromptReady))
                .await
                .is_err()
            {
                return;
            }
            let count = words.len();
            for word in words {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if tx.send(ProviderEvent::delta(word)).await.is_err() {
                    return;
                }
            }
            let done = ProviderEvent::Done {
                meta: json!({
                    "finishReason": "stop",
                    "model": model,
                    "usage": {"prompt_tokens": count, "completion_tokens": count},
                })
                .as_object()
                .cloned(),
                timings: None,
            };
            let _ = tx.send(done).await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<ProviderEvent>) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_scripted_replays_events() {
        let provider = ScriptedProvider::from_events(vec![
            ProviderEvent::delta("a"),
            ProviderEvent::done_with_reason("stop"),
        ]);
        let rx = provider
            .stream_completion(&GenerationRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(collect(rx).await.len(), 2);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_hang_ends_on_cancel() {
        let provider = ScriptedProvider::new(vec![ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        let mut rx = provider
            .stream_completion(&GenerationRequest::default(), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scripted_start_failure() {
        let provider = ScriptedProvider::failing("upstream down");
        let err = provider
            .stream_completion(&GenerationRequest::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "upstream down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_streams_words() {
        let provider = EchoProvider::default();
        let rx = provider
            .stream_completion(
                &GenerationRequest::new("hello there", "echo"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_eq!(events[0], ProviderEvent::control(ControlSignal::PromptReady));
        assert_eq!(events[1], ProviderEvent::delta("hello "));
        assert_eq!(events[2], ProviderEvent::delta("there"));
        assert!(matches!(events[3], ProviderEvent::Done { .. }));
    }
}

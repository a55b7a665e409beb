//! Generation Provider Traits
//!
//! A provider turns a prompt into a channel of [`ProviderEvent`]s. The
//! returned receiver is the whole contract: the provider pushes events in
//! order and drops the sender when it has nothing more to say. Cancellation
//! flows in through a [`CancellationToken`]; providers must stop producing
//! once it fires.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::streaming::ProviderEvent;

/// Configuration for a generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// The prompt/message to send
    pub prompt: String,
    /// Model to use (provider-specific identifier)
    pub model: String,
    /// Maximum tokens in response (0 = default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// System prompt (optional, prepended to conversation)
    pub system: Option<String>,
    /// Conversation context (previous messages)
    pub context: Option<String>,
    /// Stream this request belongs to
    pub stream_id: String,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            max_tokens: 0,
            temperature: 0.7,
            system: None,
            context: None,
            stream_id: String::new(),
        }
    }
}

impl GenerationRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the owning stream id
    #[must_use]
    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }
}

/// Generation provider trait
///
/// Implement this trait to plug in a different upstream.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name for logs (e.g., "ollama")
    fn name(&self) -> &str;

    /// Start a streaming completion
    ///
    /// Errors returned here mean the stream never opened; failures after
    /// that arrive as [`ProviderEvent::Error`].
    async fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<ProviderEvent>>;
}

//! Generation Provider Integration
//!
//! Upstream text generation behind a common trait.
//!
//! # Available Providers
//!
//! - **Ollama**: local LLM server over NDJSON streaming
//! - **Echo**: streams the prompt back, for local runs
//! - **Scripted**: replays a fixed event script, for tests
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::provider::{GenerationProvider, GenerationRequest, OllamaProvider};
//!
//! let provider = OllamaProvider::default();
//! let request = GenerationRequest::new("Hello!", "llama3.2");
//! let rx = provider.stream_completion(&request, cancel).await?;
//! ```

mod ollama;
mod scripted;
mod traits;

pub use ollama::OllamaProvider;
pub use scripted::{EchoProvider, ScriptStep, ScriptedProvider};
pub use traits::{GenerationProvider, GenerationRequest};

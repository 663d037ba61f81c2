//! The provider adapter contract (`4.1`) and its four implementations.
//!
//! Add a new backend by implementing [`Provider`] and wiring a match
//! arm in [`crate::router::Router::from_config`] keyed by
//! [`crate::config::ProviderKind`]; the router itself never changes.

use crate::error::ProviderError;
use crate::request::{ChatRequest, ChatResponse, ChatStreamChunk, ModelInfo};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicProvider;
#[cfg(feature = "gemini")]
pub use gemini::GeminiProvider;
#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;

/// A lazy, finite, non-restartable sequence of stream chunks. Dropping
/// the stream releases its transport resource (`9`).
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatStreamChunk, ProviderError>> + Send>>;

/// The capability contract every backend adapter implements (`4.1`).
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used for attribution and log lines. Not
    /// necessarily the configuration provider name.
    fn name(&self) -> &str;

    /// Fully-buffered chat completion.
    async fn chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open a streaming chat completion. Must surface the first byte
    /// (or a non-2xx error) before returning; the returned stream never
    /// starts in an already-failed state on its first poll.
    async fn stream_chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatStream, ProviderError>;

    /// List models this backend exposes.
    async fn list_models(&self, ctx: &CancellationToken) -> Result<Vec<ModelInfo>, ProviderError>;
}

/// Check a cancellation token before starting a transport call,
/// returning [`ProviderError::Cancelled`] if it already fired.
pub(crate) fn check_cancelled(ctx: &CancellationToken) -> Result<(), ProviderError> {
    if ctx.is_cancelled() {
        Err(ProviderError::Cancelled)
    } else {
        Ok(())
    }
}

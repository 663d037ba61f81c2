//! The internal request/response/chunk shapes every adapter translates
//! to and from its own wire protocol.

use crate::message::{Message, Tool};
use std::collections::HashMap;

/// A chat completion request, backend-agnostic until the router or an
/// adapter rewrites `model` to a backend-native identifier.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Alias, bare provider name, or `<provider>/<model>` literal on
    /// the way in; rewritten to the backend-native model id before an
    /// adapter sees it (`4.2.2`).
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Option<Vec<Tool>>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            stream: false,
            extra: HashMap::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Prompt/completion/total token counts. `total` is always
/// `prompt + completion` unless the backend reports a different value
/// directly (e.g. one that already folds in cached-token accounting).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Why a completion stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

/// A fully-buffered chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub message: Message,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// One increment of a streaming chat completion.
#[derive(Debug, Clone)]
pub struct ChatStreamChunk {
    pub id: String,
    pub model: String,
    pub delta: ChunkDelta,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    /// Set on the last chunk the adapter will ever emit for this
    /// stream. The following poll always yields end-of-stream; the two
    /// are distinct observable events (`9`) and callers may rely on
    /// either.
    pub is_terminal: bool,
}

/// The incremental content of one [`ChatStreamChunk`].
#[derive(Debug, Clone)]
pub enum ChunkDelta {
    /// Plain content text.
    Content(String),
    /// A fragment of a streamed tool call. `name` is typically present
    /// only on the first fragment for a given `id`; `arguments_delta`
    /// is JSON text to append to that call's argument buffer.
    ToolCall {
        id: String,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    /// No content on this chunk (e.g. a terminal chunk carrying only
    /// usage/finish_reason).
    None,
}

impl ChatStreamChunk {
    pub fn content(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            delta: ChunkDelta::Content(text.into()),
            usage: None,
            finish_reason: None,
            is_terminal: false,
        }
    }

    pub fn terminal(
        id: impl Into<String>,
        model: impl Into<String>,
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            delta: ChunkDelta::None,
            usage,
            finish_reason: Some(finish_reason),
            is_terminal: true,
        }
    }
}

/// A model listed by [`crate::provider::Provider::list_models`].
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub display_name: String,
}

//! Conversation message, tool-call, and tool-declaration shapes shared
//! by every adapter, plus the delta assembler used to reconstruct a
//! streamed tool call's JSON arguments from backend-dependent fragments.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a conversation.
///
/// A `Tool` message must carry `tool_call_id`; an `Assistant` message may
/// carry zero or more `tool_calls`. `System` messages are not
/// conversation turns; adapters that need a single system instruction
/// extract and merge them (see the Anthropic adapter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::System => write!(f, "System: {}", self.content),
            Role::User => write!(f, "User: {}", self.content),
            Role::Assistant => write!(f, "Assistant: {}", self.content),
            Role::Tool => write!(f, "Tool: {}", self.content),
        }
    }
}

/// A tool call made by the model. Arguments are always carried as a
/// JSON text string at this boundary; adapters encode/decode to their
/// own backend-native forms (JSON object, `input_json_delta` fragments,
/// etc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A tool declaration offered to the model. `parameters` is a JSON
/// Schema object; adapters translate it into their own wire shape
/// (OpenAI's `function` wrapper, Anthropic's `input_schema`, Gemini's
/// `functionDeclarations`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Reassembles a streamed tool call from per-chunk deltas. Backends
/// stream argument text incrementally (Anthropic's `input_json_delta`,
/// OpenAI's `function.arguments` delta); this accumulates those
/// fragments keyed by tool-call id until the stream ends.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: HashMap<String, PartialToolCall>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    name: Option<String>,
    arguments: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one delta. `id` identifies the tool call within the
    /// stream; `name` is typically sent once at the start; consecutive
    /// `arguments_delta` fragments are concatenated in arrival order.
    pub fn process_delta(&mut self, id: String, name: Option<String>, arguments_delta: Option<String>) {
        if !self.calls.contains_key(&id) {
            self.order.push(id.clone());
        }
        let call = self.calls.entry(id).or_default();
        if let Some(n) = name {
            call.name = Some(n);
        }
        if let Some(delta) = arguments_delta {
            call.arguments.push_str(&delta);
        }
    }

    /// Finish assembly, returning completed tool calls in first-seen
    /// order. Arguments are kept as opaque JSON text, not parsed here.
    pub fn into_tool_calls(mut self) -> Vec<ToolCall> {
        self.order
            .into_iter()
            .filter_map(|id| {
                self.calls.remove(&id).map(|partial| ToolCall {
                    id,
                    name: partial.name.unwrap_or_default(),
                    arguments: partial.arguments,
                })
            })
            .collect()
    }
}

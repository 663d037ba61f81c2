//! Anthropic-style adapter: system-prompt extraction, tool_use/tool_result
//! content blocks, typed SSE events (`4.1.2`).

use super::{check_cancelled, ChatStream, Provider};
use crate::error::ProviderError;
use crate::message::{Message, Role, Tool, ToolCall};
use crate::request::{ChatRequest, ChatResponse, ChatStreamChunk, ChunkDelta, FinishReason, ModelInfo, TokenUsage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: String) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Extract and join system messages, double-newline separated, and
    /// convert the remaining conversation to Anthropic message blocks
    /// (`4.1.2`, `8` "Anthropic system extraction").
    fn build_messages(messages: &[Message]) -> (Vec<AnthropicMessage>, Option<String>) {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let system_prompt = if system.is_empty() { None } else { Some(system.join("\n\n")) };

        let mut out = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => continue,
                Role::User => out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(AnthropicContentBlock::Text { text: msg.content.clone() });
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            blocks.push(AnthropicContentBlock::ToolUse {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: serde_json::from_str(&call.arguments).unwrap_or(serde_json::json!({})),
                            });
                        }
                    }
                    if !blocks.is_empty() {
                        out.push(AnthropicMessage {
                            role: "assistant".to_string(),
                            content: AnthropicContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
                    out.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                            tool_use_id,
                            content: msg.content.clone(),
                            is_error: None,
                        }]),
                    });
                }
            }
        }

        (out, system_prompt)
    }

    fn convert_tools(tools: &[Tool]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: Some(t.description.clone()),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn build_request(request: &ChatRequest) -> CreateMessageRequest {
        let (messages, system) = Self::build_messages(&request.messages);
        CreateMessageRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: if request.stop.is_empty() { None } else { Some(request.stop.clone()) },
            stream: request.stream,
            tools: request.tools.as_ref().map(|t| Self::convert_tools(t)),
            tool_choice: request.tools.as_ref().map(|_| AnthropicToolChoice::Auto),
        }
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let envelope: Option<AnthropicErrorEnvelope> = serde_json::from_str(&body).ok();
        match envelope {
            Some(e) => ProviderError::Api {
                status,
                code: None,
                error_type: Some(e.error.error_type),
                message: e.error.message,
            },
            None => ProviderError::Api {
                status,
                code: None,
                error_type: None,
                message: body,
            },
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_cancelled(ctx)?;
        let mut body = Self::build_request(&request);
        body.stream = false;

        let send = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: CreateMessageResponse = response.json().await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_default(),
                }),
                _ => {}
            }
        }

        Ok(ChatResponse {
            id: parsed.id,
            model: parsed.model,
            message: Message {
                role: Role::Assistant,
                content,
                name: None,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            },
            usage: TokenUsage::new(parsed.usage.input_tokens as u64, parsed.usage.output_tokens as u64),
            finish_reason: parse_finish_reason(parsed.stop_reason.as_deref()),
        })
    }

    async fn stream_chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        check_cancelled(ctx)?;
        let mut body = Self::build_request(&request);
        body.stream = true;

        let send = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let model = request.model.clone();
        let ctx = ctx.clone();
        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);
            let mut state = StreamState::new(model);

            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => {
                        yield Err(ProviderError::Cancelled);
                        break;
                    }
                    n = event_stream.next() => n,
                };

                let Some(event_result) = next else { break };
                let event = match event_result {
                    Ok(e) => e,
                    Err(e) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        break;
                    }
                };

                match decode_event(&event.event, &event.data, &mut state) {
                    Ok(chunks) => {
                        let terminal = chunks.iter().any(|c| c.is_terminal);
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(output))
    }

    async fn list_models(&self, ctx: &CancellationToken) -> Result<Vec<ModelInfo>, ProviderError> {
        check_cancelled(ctx)?;
        let send = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: ModelListResponse = response.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id.clone(),
                provider: self.name.clone(),
                display_name: m.display_name.unwrap_or(m.id),
            })
            .collect())
    }
}

struct StreamState {
    id: String,
    model: String,
    input_tokens: u64,
    block_index_to_tool_id: HashMap<usize, String>,
    stop_reason: Option<String>,
}

impl StreamState {
    fn new(model: String) -> Self {
        Self {
            id: String::new(),
            model,
            input_tokens: 0,
            block_index_to_tool_id: HashMap::new(),
            stop_reason: None,
        }
    }
}

/// Decode one typed SSE event into zero or more stream chunks. Pure, so
/// the scenario in `8` ("Streaming Anthropic tool-use") is directly
/// unit-testable without a live connection.
fn decode_event(event_name: &str, data: &str, state: &mut StreamState) -> Result<Vec<ChatStreamChunk>, ProviderError> {
    if data.trim().is_empty() {
        return Ok(vec![]);
    }

    match event_name {
        "message_start" => {
            let parsed: MessageStart = serde_json::from_str(data).map_err(|e| ProviderError::Stream(e.to_string()))?;
            state.id = parsed.message.id;
            state.input_tokens = parsed.message.usage.input_tokens as u64;
            Ok(vec![])
        }
        "content_block_start" => {
            let parsed: ContentBlockStart = serde_json::from_str(data).map_err(|e| ProviderError::Stream(e.to_string()))?;
            if let AnthropicContentBlock::ToolUse { id, name, .. } = parsed.content_block {
                state.block_index_to_tool_id.insert(parsed.index, id.clone());
                return Ok(vec![ChatStreamChunk {
                    id: state.id.clone(),
                    model: state.model.clone(),
                    delta: ChunkDelta::ToolCall {
                        id,
                        name: Some(name),
                        arguments_delta: None,
                    },
                    usage: None,
                    finish_reason: None,
                    is_terminal: false,
                }]);
            }
            Ok(vec![])
        }
        "content_block_delta" => {
            let parsed: ContentBlockDelta = serde_json::from_str(data).map_err(|e| ProviderError::Stream(e.to_string()))?;
            match parsed.delta {
                ContentDelta::TextDelta { text } => Ok(vec![ChatStreamChunk::content(state.id.clone(), state.model.clone(), text)]),
                ContentDelta::InputJsonDelta { partial_json } => {
                    let tool_id = state.block_index_to_tool_id.get(&parsed.index).cloned().unwrap_or_default();
                    Ok(vec![ChatStreamChunk {
                        id: state.id.clone(),
                        model: state.model.clone(),
                        delta: ChunkDelta::ToolCall {
                            id: tool_id,
                            name: None,
                            arguments_delta: Some(partial_json),
                        },
                        usage: None,
                        finish_reason: None,
                        is_terminal: false,
                    }])
                }
                ContentDelta::ThinkingDelta { .. } => Ok(vec![]),
            }
        }
        "message_delta" => {
            let parsed: MessageDelta = serde_json::from_str(data).map_err(|e| ProviderError::Stream(e.to_string()))?;
            state.stop_reason = parsed.delta.stop_reason;
            match parsed.usage {
                Some(usage) => Ok(vec![ChatStreamChunk {
                    id: state.id.clone(),
                    model: state.model.clone(),
                    delta: ChunkDelta::None,
                    usage: Some(TokenUsage::new(state.input_tokens, usage.output_tokens as u64)),
                    finish_reason: None,
                    is_terminal: false,
                }]),
                None => Ok(vec![]),
            }
        }
        "message_stop" => Ok(vec![ChatStreamChunk::terminal(
            state.id.clone(),
            state.model.clone(),
            parse_finish_reason(state.stop_reason.as_deref()),
            None,
        )]),
        "ping" | "content_block_stop" => Ok(vec![]),
        _ => Ok(vec![]),
    }
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: serde_json::Value },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    id: String,
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartContent,
}

#[derive(Debug, Deserialize)]
struct MessageStartContent {
    id: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    #[serde(default)]
    usage: Option<AnthropicUsageDelta>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsageDelta {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

//! OpenAI-style adapter: JSON POST + SSE streaming with the `[DONE]`
//! sentinel (`4.1.1`).

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

pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    organization: Option<String>,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: String, organization: Option<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            organization,
        }
    }

    fn auth_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        match &self.organization {
            Some(org) => builder.header("OpenAI-Organization", org.clone()),
            None => builder,
        }
    }

    fn convert_message(msg: &Message) -> ChatMessage {
        match msg.role {
            Role::System => ChatMessage::System { content: msg.content.clone() },
            Role::User => ChatMessage::User { content: msg.content.clone() },
            Role::Assistant => ChatMessage::Assistant {
                content: if msg.content.is_empty() { None } else { Some(msg.content.clone()) },
                tool_calls: msg.tool_calls.as_ref().map(|calls| calls.iter().map(ToOpenAiToolCall::from).collect()),
            },
            Role::Tool => ChatMessage::Tool {
                content: msg.content.clone(),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            },
        }
    }

    fn convert_tools(tools: &[Tool]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|t| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_request(request: &ChatRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            temperature: request.temperature,
            max_completion_tokens: request.max_tokens,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions { include_usage: true }),
            tools: request.tools.as_ref().map(|t| Self::convert_tools(t)),
        }
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let envelope: Option<OpenAiErrorEnvelope> = serde_json::from_str(&body).ok();
        match envelope {
            Some(e) => ProviderError::Api {
                status,
                code: e.error.code,
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_cancelled(ctx)?;
        let body = Self::build_request(&request);

        let send = self.auth_headers(self.client.post(format!("{}/chat/completions", self.base_url))).json(&body).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Stream("no choices in response".to_string()))?;

        let tool_calls = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect()
        });

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        Ok(ChatResponse {
            id: parsed.id,
            model: parsed.model,
            message: Message {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                name: None,
                tool_call_id: None,
                tool_calls,
            },
            usage,
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    async fn stream_chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        check_cancelled(ctx)?;
        let mut body = Self::build_request(&request);
        body.stream = true;
        body.stream_options = Some(StreamOptions { include_usage: true });

        let send = self.auth_headers(self.client.post(format!("{}/chat/completions", self.base_url))).json(&body).send();
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
            let mut id = String::new();
            let mut tool_call_index_to_id: HashMap<usize, String> = HashMap::new();

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

                if event.data == "[DONE]" {
                    break;
                }

                match decode_chunk(&event.data, &mut id, &model, &mut tool_call_index_to_id) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
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
        let send = self.auth_headers(self.client.get(format!("{}/models", self.base_url))).send();
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
                display_name: m.id,
            })
            .collect())
    }
}

/// Decode one SSE `data:` payload into zero or more stream chunks. Pure
/// and independent of the transport so the concrete scenarios in `8`
/// are directly unit-testable. `tool_call_index_to_id` tracks each
/// tool call's id by its `index` field, since OpenAI sends the id only
/// on the first fragment for a given index and leaves it absent on
/// subsequent argument-delta fragments.
fn decode_chunk(data: &str, id: &mut String, model: &str, tool_call_index_to_id: &mut HashMap<usize, String>) -> Result<Vec<ChatStreamChunk>, ProviderError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(data).map_err(|e| ProviderError::Stream(format!("failed to parse chunk: {e}")))?;

    if !chunk.id.is_empty() {
        *id = chunk.id.clone();
    }

    if chunk.choices.is_empty() {
        if let Some(usage) = chunk.usage {
            let usage = TokenUsage::new(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            return Ok(vec![ChatStreamChunk::terminal(id.clone(), model, FinishReason::Stop, Some(usage))]);
        }
        return Ok(vec![]);
    }

    let mut out = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            out.push(ChatStreamChunk::content(id.clone(), model, content));
        }

        if let Some(deltas) = choice.delta.tool_calls {
            for d in deltas {
                let index = d.index as usize;
                let call_id = match d.id {
                    Some(new_id) => {
                        tool_call_index_to_id.insert(index, new_id.clone());
                        new_id
                    }
                    None => tool_call_index_to_id.get(&index).cloned().unwrap_or_default(),
                };

                out.push(ChatStreamChunk {
                    id: id.clone(),
                    model: model.to_string(),
                    delta: ChunkDelta::ToolCall {
                        id: call_id,
                        name: d.function.as_ref().and_then(|f| f.name.clone()),
                        arguments_delta: d.function.as_ref().and_then(|f| f.arguments.clone()),
                    },
                    usage: None,
                    finish_reason: None,
                    is_terminal: false,
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            if chunk.usage.is_none() {
                out.push(ChatStreamChunk::terminal(id.clone(), model, parse_finish_reason(Some(&reason)), None));
            }
        }
    }

    Ok(out)
}

fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

struct ToOpenAiToolCall;
impl ToOpenAiToolCall {
    fn from(tc: &ToolCall) -> OpenAiToolCall {
        OpenAiToolCall {
            id: tc.id.clone(),
            tool_type: "function".to_string(),
            function: OpenAiFunctionCall {
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role")]
#[serde(rename_all = "lowercase")]
enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: String,
    model: String,
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_content_delta_chunks() {
        let mut id = String::new();
        let mut indices = HashMap::new();
        let chunks = decode_chunk(
            r#"{"id":"c1","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
            &mut id,
            "gpt-4o",
            &mut indices,
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0].delta {
            ChunkDelta::Content(s) => assert_eq!(s, "Hello"),
            _ => panic!("expected content delta"),
        }
        assert_eq!(id, "c1");
    }

    #[test]
    fn decodes_finish_reason_without_usage_as_terminal() {
        let mut id = "c1".to_string();
        let mut indices = HashMap::new();
        let chunks = decode_chunk(
            r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            &mut id,
            "gpt-4o",
            &mut indices,
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_terminal);
    }

    #[test]
    fn decodes_usage_only_chunk_as_terminal_with_usage() {
        let mut id = "c1".to_string();
        let mut indices = HashMap::new();
        let chunks = decode_chunk(
            r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
            &mut id,
            "gpt-4o",
            &mut indices,
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_terminal);
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn scenario_three_frames_then_done() {
        // 8, scenario 1.
        let mut id = "resp_1".to_string();
        let model = "gpt-4o";
        let mut indices = HashMap::new();

        let c1 = decode_chunk(r#"{"id":"resp_1","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#, &mut id, model, &mut indices).unwrap();
        let c2 = decode_chunk(r#"{"id":"resp_1","choices":[{"delta":{"content":" world"},"finish_reason":null}]}"#, &mut id, model, &mut indices).unwrap();
        let c3 = decode_chunk(
            r#"{"id":"resp_1","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
            &mut id,
            model,
            &mut indices,
        )
        .unwrap();

        assert!(matches!(&c1[0].delta, ChunkDelta::Content(s) if s == "Hello"));
        assert!(matches!(&c2[0].delta, ChunkDelta::Content(s) if s == " world"));
        assert!(c3[0].is_terminal);
        assert_eq!(c3[0].usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn tool_call_delta_fragments_are_looked_up_by_index_when_id_is_absent() {
        let mut id = "c1".to_string();
        let mut indices = HashMap::new();

        let first = decode_chunk(
            r#"{"id":"c1","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"get_weather","arguments":""}}]},"finish_reason":null}]}"#,
            &mut id,
            "gpt-4o",
            &mut indices,
        )
        .unwrap();
        match &first[0].delta {
            ChunkDelta::ToolCall { id, .. } => assert_eq!(id, "call_abc"),
            _ => panic!("expected tool call delta"),
        }

        let second = decode_chunk(
            r#"{"id":"c1","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]},"finish_reason":null}]}"#,
            &mut id,
            "gpt-4o",
            &mut indices,
        )
        .unwrap();
        match &second[0].delta {
            ChunkDelta::ToolCall { id, arguments_delta, .. } => {
                assert_eq!(id, "call_abc");
                assert_eq!(arguments_delta.as_deref(), Some("{\"city\":"));
            }
            _ => panic!("expected tool call delta"),
        }
    }

    #[test]
    fn convert_message_round_trips_tool_call_arguments_as_opaque_text() {
        let msg = Message {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".into(),
                name: "lookup".into(),
                arguments: r#"{"q":"rust"}"#.into(),
            }]),
        };
        match OpenAiProvider::convert_message(&msg) {
            ChatMessage::Assistant { tool_calls: Some(calls), .. } => {
                assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
            }
            _ => panic!("expected assistant message with tool calls"),
        }
    }
}

//! Gemini-style adapter: `generateContent`/`streamGenerateContent`,
//! query-param-only auth (`4.1.3`), and synthesized tool-call ids since
//! Gemini never assigns one itself.

use super::{check_cancelled, ChatStream, Provider};
use crate::error::ProviderError;
use crate::message::{Message, Role, Tool, ToolCall};
use crate::request::{ChatRequest, ChatResponse, ChatStreamChunk, ChunkDelta, FinishReason, ModelInfo, TokenUsage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Carries the thought signature and original function name a synthesized
/// call id stands for, so a later turn can echo both back correctly.
#[derive(Debug, Clone)]
struct ToolCallMeta {
    signature: Option<String>,
    function_name: String,
}

pub struct GeminiProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    tool_call_meta: Arc<RwLock<HashMap<String, ToolCallMeta>>>,
    call_counter: Arc<AtomicU64>,
}

impl GeminiProvider {
    pub fn new(name: impl Into<String>, base_url: Option<String>, api_key: String) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()).trim_end_matches('/').to_string(),
            api_key,
            tool_call_meta: Arc::new(RwLock::new(HashMap::new())),
            call_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_call_id(&self) -> String {
        let idx = self.call_counter.fetch_add(1, Ordering::SeqCst);
        format!("gemini_call_{}", idx)
    }

    fn register_tool_call(&self, call_id: String, meta: ToolCallMeta) {
        if let Ok(mut map) = self.tool_call_meta.write() {
            map.insert(call_id, meta);
        }
    }

    fn tool_call_signature(&self, call_id: &str) -> Option<ToolCallMeta> {
        self.tool_call_meta.read().ok().and_then(|m| m.get(call_id).cloned())
    }

    /// Join every system message with `"\n\n"`, same treatment as the
    /// Anthropic adapter (`4.1.2`), then translate the rest of the
    /// conversation into content blocks.
    fn build_messages(&self, messages: &[Message]) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let system: Vec<&str> = messages.iter().filter(|m| m.role == Role::System).map(|m| m.content.as_str()).collect();
        let system_instruction = if system.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: Some(system.join("\n\n")), ..Default::default() }],
            })
        };

        let mut contents = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => continue,
                Role::User => contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![GeminiPart { text: Some(msg.content.clone()), ..Default::default() }],
                }),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(GeminiPart { text: Some(msg.content.clone()), ..Default::default() });
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            let signature = self.tool_call_signature(&call.id).and_then(|m| m.signature);
                            parts.push(GeminiPart {
                                thought_signature: signature,
                                function_call: Some(GeminiFunctionCall {
                                    name: call.name.clone(),
                                    args: serde_json::from_str(&call.arguments).unwrap_or(serde_json::json!({})),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    contents.push(GeminiContent { role: Some("model".to_string()), parts });
                }
                Role::Tool => {
                    let call_id = msg.tool_call_id.clone().unwrap_or_default();
                    let name = self.tool_call_signature(&call_id).map(|m| m.function_name).unwrap_or_else(|| "tool".to_string());
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart {
                            function_response: Some(GeminiFunctionResponse {
                                name,
                                response: parse_tool_response_json(&msg.content),
                            }),
                            ..Default::default()
                        }],
                    });
                }
            }
        }

        (contents, system_instruction)
    }

    fn convert_tools(tools: &[Tool]) -> Vec<GeminiTool> {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }]
    }

    fn build_request(&self, request: &ChatRequest) -> GenerateContentRequest {
        let (contents, system_instruction) = self.build_messages(&request.messages);
        let gemini_tools = request.tools.as_ref().map(|t| Self::convert_tools(t));
        let tool_config = gemini_tools.as_ref().map(|_| GeminiToolConfig {
            function_calling_config: Some(GeminiFunctionCallingConfig { mode: "AUTO".to_string() }),
        });

        GenerateContentRequest {
            contents,
            tools: gemini_tools,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
            tool_config,
        }
    }

    fn parse_parts(&self, parts: Vec<GeminiPart>) -> (String, Vec<ToolCall>) {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                let id = self.next_call_id();
                self.register_tool_call(
                    id.clone(),
                    ToolCallMeta { signature: part.thought_signature.clone(), function_name: call.name.clone() },
                );
                tool_calls.push(ToolCall {
                    id,
                    name: call.name,
                    arguments: serde_json::to_string(&call.args).unwrap_or_default(),
                });
            }
        }
        (content, tool_calls)
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Api { status, code: None, error_type: None, message: body }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_cancelled(ctx)?;
        let body = self.build_request(&request);
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);

        let send = self.client.post(&url).query(&[("key", self.api_key.as_str())]).json(&body).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let candidate = parsed.candidates.unwrap_or_default().into_iter().next();
        let (content, tool_calls) = candidate
            .as_ref()
            .and_then(|c| c.content.clone())
            .map(|c| self.parse_parts(c.parts))
            .unwrap_or_default();
        let finish_reason = parse_finish_reason(candidate.and_then(|c| c.finish_reason));
        let usage = convert_usage(parsed.usage_metadata.as_ref());

        Ok(ChatResponse {
            id: String::new(),
            model: request.model,
            message: Message {
                role: Role::Assistant,
                content,
                name: None,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            },
            usage,
            finish_reason,
        })
    }

    async fn stream_chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        check_cancelled(ctx)?;
        let body = self.build_request(&request);
        let url = format!("{}/models/{}:streamGenerateContent", self.base_url, request.model);

        let send = self
            .client
            .post(&url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
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
        let call_counter = self.call_counter.clone();
        let tool_call_meta = self.tool_call_meta.clone();
        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);
            let mut state = GeminiStreamState::new(model);

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

                if event.data.trim().is_empty() {
                    continue;
                }

                match decode_event(&event.data, &mut state, &call_counter) {
                    Ok(chunks) => {
                        for (id, meta) in state.pending_registrations.drain(..) {
                            if let Ok(mut map) = tool_call_meta.write() {
                                map.insert(id, meta);
                            }
                        }
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
        let send = self.client.get(format!("{}/models", self.base_url)).query(&[("key", self.api_key.as_str())]).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: ModelListResponse = response.json().await?;
        Ok(parsed
            .models
            .into_iter()
            .map(|m| {
                let id = m.name.trim_start_matches("models/").to_string();
                ModelInfo { id: id.clone(), provider: self.name.clone(), display_name: m.display_name.unwrap_or(id) }
            })
            .collect())
    }
}

struct GeminiStreamState {
    model: String,
    pending_registrations: Vec<(String, ToolCallMeta)>,
}

impl GeminiStreamState {
    fn new(model: String) -> Self {
        Self { model, pending_registrations: Vec::new() }
    }
}

/// Decode one SSE data line into zero or more stream chunks. Pure and
/// deterministic given an external id-counter, so it is directly
/// unit-testable.
fn decode_event(data: &str, state: &mut GeminiStreamState, call_counter: &AtomicU64) -> Result<Vec<ChatStreamChunk>, ProviderError> {
    let resp: GenerateContentResponse = serde_json::from_str(data).map_err(|e| ProviderError::Stream(e.to_string()))?;
    let mut chunks = Vec::new();

    let candidate = resp.candidates.unwrap_or_default().into_iter().next();
    let finish_reason_raw = candidate.as_ref().and_then(|c| c.finish_reason.clone());

    if let Some(content) = candidate.and_then(|c| c.content) {
        for part in content.parts {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    chunks.push(ChatStreamChunk::content(String::new(), state.model.clone(), text));
                }
            }
            if let Some(call) = part.function_call {
                let idx = call_counter.fetch_add(1, Ordering::SeqCst);
                let id = format!("gemini_call_{}", idx);
                state.pending_registrations.push((
                    id.clone(),
                    ToolCallMeta { signature: part.thought_signature.clone(), function_name: call.name.clone() },
                ));
                chunks.push(ChatStreamChunk {
                    id: String::new(),
                    model: state.model.clone(),
                    delta: ChunkDelta::ToolCall {
                        id,
                        name: Some(call.name),
                        arguments_delta: Some(serde_json::to_string(&call.args).unwrap_or_default()),
                    },
                    usage: None,
                    finish_reason: None,
                    is_terminal: false,
                });
            }
        }
    }

    if let Some(usage) = resp.usage_metadata.as_ref() {
        chunks.push(ChatStreamChunk::terminal(
            String::new(),
            state.model.clone(),
            parse_finish_reason(finish_reason_raw),
            Some(convert_usage(Some(usage))),
        ));
    }

    Ok(chunks)
}

fn parse_tool_response_json(payload: &str) -> serde_json::Value {
    serde_json::from_str(payload).unwrap_or_else(|_| serde_json::json!({ "result": payload }))
}

fn convert_usage(usage: Option<&UsageMetadata>) -> TokenUsage {
    match usage {
        Some(u) => TokenUsage::new(u.prompt_token_count.unwrap_or(0) as u64, u.candidates_token_count.unwrap_or(0) as u64),
        None => TokenUsage::default(),
    }
}

fn parse_finish_reason(reason: Option<String>) -> FinishReason {
    match reason.as_deref() {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("TOOL_CALLS") => FinishReason::ToolCalls,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Stop,
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct GeminiPart {
    #[serde(rename = "thoughtSignature", skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiToolConfig {
    #[serde(rename = "functionCallingConfig", skip_serializing_if = "Option::is_none")]
    function_calling_config: Option<GeminiFunctionCallingConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize, Clone)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_joined_into_one_instruction() {
        let provider = GeminiProvider::new("gemini", None, "key".into());
        let messages = vec![Message::system("Be helpful."), Message::system("Be concise."), Message::user("Hi")];
        let (contents, system) = provider.build_messages(&messages);
        assert_eq!(system.unwrap().parts[0].text.as_deref(), Some("Be helpful.\n\nBe concise."));
        assert_eq!(contents.len(), 1);
    }

    #[test]
    fn decodes_text_delta() {
        let mut state = GeminiStreamState::new("gemini-pro".to_string());
        let counter = AtomicU64::new(1);
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#;
        let chunks = decode_event(data, &mut state, &counter).unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0].delta {
            ChunkDelta::Content(text) => assert_eq!(text, "Hello"),
            _ => panic!("expected content delta"),
        }
    }

    #[test]
    fn decodes_function_call_with_synthesized_id() {
        let mut state = GeminiStreamState::new("gemini-pro".to_string());
        let counter = AtomicU64::new(1);
        let data = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"NYC"}}}]}}]}"#;
        let chunks = decode_event(data, &mut state, &counter).unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0].delta {
            ChunkDelta::ToolCall { id, name, arguments_delta } => {
                assert_eq!(id, "gemini_call_1");
                assert_eq!(name.as_deref(), Some("get_weather"));
                assert!(arguments_delta.as_deref().unwrap().contains("NYC"));
            }
            _ => panic!("expected tool call delta"),
        }
        assert_eq!(state.pending_registrations.len(), 1);
    }

    #[test]
    fn usage_metadata_yields_terminal_chunk() {
        let mut state = GeminiStreamState::new("gemini-pro".to_string());
        let counter = AtomicU64::new(1);
        let data = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":4}}"#;
        let chunks = decode_event(data, &mut state, &counter).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_terminal);
        assert_eq!(chunks[0].usage.unwrap().total_tokens, 7);
        assert_eq!(chunks[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn tool_response_wraps_plain_text_payload() {
        let value = parse_tool_response_json("plain text");
        assert_eq!(value, serde_json::json!({"result": "plain text"}));
        let value = parse_tool_response_json(r#"{"temp":70}"#);
        assert_eq!(value, serde_json::json!({"temp":70}));
    }
}

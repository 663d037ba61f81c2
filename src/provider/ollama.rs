//! Ollama-style adapter: local-server defaults, optional auth, and
//! newline-delimited JSON streaming (no SSE framing at all, `4.1.4`).

use super::{check_cancelled, ChatStream, Provider};
use crate::config::AuthScheme;
use crate::error::ProviderError;
use crate::message::{Message, Role, Tool, ToolCall};
use crate::request::{ChatRequest, ChatResponse, ChatStreamChunk, ChunkDelta, FinishReason, ModelInfo, TokenUsage};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "http://localhost:11434";

pub struct OllamaProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    auth: AuthScheme,
    credential: Option<String>,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, base_url: Option<String>, auth: AuthScheme, credential: Option<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()).trim_end_matches('/').to_string(),
            auth,
            credential,
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (self.auth, &self.credential) {
            (AuthScheme::Bearer, Some(cred)) => builder.bearer_auth(cred),
            (AuthScheme::Basic, Some(cred)) => match cred.split_once(':') {
                Some((user, pass)) => builder.basic_auth(user, Some(pass)),
                None => builder,
            },
            _ => builder,
        }
    }

    fn convert_message(msg: &Message) -> OllamaMessage {
        OllamaMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            }
            .to_string(),
            content: msg.content.clone(),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| OllamaToolCall {
                        function: OllamaFunctionCall {
                            name: c.name.clone(),
                            arguments: serde_json::from_str(&c.arguments).unwrap_or(serde_json::json!({})),
                        },
                    })
                    .collect()
            }),
        }
    }

    fn convert_tools(tools: &[Tool]) -> Vec<OllamaTool> {
        tools
            .iter()
            .map(|t| OllamaTool {
                tool_type: "function".to_string(),
                function: OllamaFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    /// Sampling knobs live under a nested `options` object rather than
    /// top-level request fields (`4.1.4`).
    fn build_options(request: &ChatRequest) -> Option<OllamaOptions> {
        if request.temperature.is_none() && request.top_p.is_none() && request.stop.is_empty() {
            return None;
        }
        Some(OllamaOptions {
            temperature: request.temperature,
            top_p: request.top_p,
            stop: if request.stop.is_empty() { None } else { Some(request.stop.clone()) },
            num_predict: request.max_tokens,
        })
    }

    fn build_request(&self, request: &ChatRequest) -> OllamaChatRequest {
        OllamaChatRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            tools: request.tools.as_ref().map(|t| Self::convert_tools(t)),
            stream: request.stream,
            options: Self::build_options(request),
        }
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Api { status, code: None, error_type: None, message: body }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_cancelled(ctx)?;
        let mut body = self.build_request(&request);
        body.stream = false;

        let builder = self.client.post(format!("{}/api/chat", self.base_url)).json(&body);
        let send = self.apply_auth(builder).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: OllamaChatLine = response.json().await?;
        let message = parsed.message.unwrap_or(OllamaMessage { role: "assistant".to_string(), content: String::new(), tool_calls: None });
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, c)| ToolCall {
                id: format!("ollama_call_{}", i),
                name: c.function.name,
                arguments: serde_json::to_string(&c.function.arguments).unwrap_or_default(),
            })
            .collect::<Vec<_>>();

        Ok(ChatResponse {
            id: String::new(),
            model: parsed.model.unwrap_or(request.model),
            message: Message {
                role: Role::Assistant,
                content: message.content,
                name: None,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            },
            usage: TokenUsage::new(parsed.prompt_eval_count.unwrap_or(0) as u64, parsed.eval_count.unwrap_or(0) as u64),
            finish_reason: if parsed.done { FinishReason::Stop } else { FinishReason::Other("incomplete".to_string()) },
        })
    }

    async fn stream_chat_completion(&self, ctx: &CancellationToken, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        check_cancelled(ctx)?;
        let mut body = self.build_request(&request);
        body.stream = true;

        let builder = self.client.post(format!("{}/api/chat", self.base_url)).json(&body);
        let send = self.apply_auth(builder).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let model = request.model.clone();
        let ctx = ctx.clone();
        let mut byte_stream = response.bytes_stream();

        let output = async_stream::stream! {
            let mut leftover = String::new();

            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => {
                        yield Err(ProviderError::Cancelled);
                        break;
                    }
                    n = byte_stream.next() => n,
                };

                let Some(chunk_result) = next else { break };
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(ProviderError::Transport(e));
                        break;
                    }
                };

                leftover.push_str(&String::from_utf8_lossy(&bytes));

                let mut done_streaming = false;
                while let Some(newline_pos) = leftover.find('\n') {
                    let line = leftover[..newline_pos].trim().to_string();
                    leftover.drain(..=newline_pos);

                    if line.is_empty() {
                        continue;
                    }

                    match decode_line(&line, &model) {
                        Ok(chunk) => {
                            let terminal = chunk.is_terminal;
                            yield Ok(chunk);
                            if terminal {
                                done_streaming = true;
                                break;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            done_streaming = true;
                            break;
                        }
                    }
                }

                if done_streaming {
                    break;
                }
            }
        };

        Ok(Box::pin(output))
    }

    async fn list_models(&self, ctx: &CancellationToken) -> Result<Vec<ModelInfo>, ProviderError> {
        check_cancelled(ctx)?;
        let builder = self.client.get(format!("{}/api/tags", self.base_url));
        let send = self.apply_auth(builder).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r?,
        };

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let parsed: TagsResponse = response.json().await?;
        Ok(parsed
            .models
            .into_iter()
            .map(|m| ModelInfo { id: m.name.clone(), provider: self.name.clone(), display_name: m.name })
            .collect())
    }
}

/// Decode one NDJSON line into a single chunk. Pure, so the
/// `done: true` termination scenario in `8` is directly unit-testable.
fn decode_line(line: &str, model: &str) -> Result<ChatStreamChunk, ProviderError> {
    let parsed: OllamaChatLine = serde_json::from_str(line).map_err(|e| ProviderError::Stream(e.to_string()))?;

    if parsed.done {
        let usage = if parsed.prompt_eval_count.is_some() || parsed.eval_count.is_some() {
            Some(TokenUsage::new(parsed.prompt_eval_count.unwrap_or(0) as u64, parsed.eval_count.unwrap_or(0) as u64))
        } else {
            None
        };
        return Ok(ChatStreamChunk::terminal(String::new(), parsed.model.unwrap_or_else(|| model.to_string()), FinishReason::Stop, usage));
    }

    let message = parsed.message.unwrap_or(OllamaMessage { role: "assistant".to_string(), content: String::new(), tool_calls: None });

    if let Some(calls) = message.tool_calls {
        if let Some(call) = calls.into_iter().next() {
            return Ok(ChatStreamChunk {
                id: String::new(),
                model: parsed.model.unwrap_or_else(|| model.to_string()),
                delta: ChunkDelta::ToolCall {
                    id: String::new(),
                    name: Some(call.function.name),
                    arguments_delta: Some(serde_json::to_string(&call.function.arguments).unwrap_or_default()),
                },
                usage: None,
                finish_reason: None,
                is_terminal: false,
            });
        }
    }

    Ok(ChatStreamChunk::content(String::new(), parsed.model.unwrap_or_else(|| model.to_string()), message.content))
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OllamaFunctionCall {
    name: String,
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OllamaFunctionDeclaration,
}

#[derive(Debug, Serialize)]
struct OllamaFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "top_p", skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatLine {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

//! Provider-agnostic orchestration core for LLM backends.
//!
//! Ties together a set of [`provider`] adapters (OpenAI-, Anthropic-,
//! Gemini- and Ollama-style wire protocols) behind one request/response
//! shape, a [`router`] that resolves aliases and roles to a concrete
//! adapter call with retry/fallback, a [`balancer`] for round-robin and
//! weighted selection, and a [`pool`] for bounded-concurrency fan-out.

pub mod balancer;
pub mod config;
pub mod error;
pub mod logger;
pub mod message;
pub mod pool;
pub mod provider;
pub mod request;
pub mod router;

pub use balancer::{Balancer, Strategy};
pub use config::{AliasConfig, AuthScheme, Config, ConfigError, Defaults, ProviderConfig, ProviderKind, RoleConfig};
pub use error::{classify, ErrorKind, ProviderError};
pub use logger::{configure as configure_logger, log};
pub use message::{Message, Role, Tool, ToolCall, ToolCallAssembler};
pub use pool::{SubtaskResult, WorkerPool};
pub use provider::{ChatStream, ModelInfo, Provider};
pub use request::{ChatRequest, ChatResponse, ChatStreamChunk, FinishReason, TokenUsage};
pub use router::Router;

//! `querymt` is the core library of a multi-protocol LLM gateway: it provides the
//! uniform `LLMProvider`/`HTTPLLMProvider` adapter contract, the canonical request
//! envelope and dialect translators, the tool adapter, the priority scheduler, and
//! the Responses tool-resume session store that the HTTP surface
//! (`crates/querymt-service`) composes into a server.
//!
//! # Architecture
//! The crate is organized into modules that handle different aspects of the
//! gateway pipeline described in `SPEC_FULL.md`:
//!
//! - [`adapters`] / [`outbound`]: wraps an [`HTTPLLMProvider`] into a full
//!   [`LLMProvider`] by dispatching through a shared outbound HTTP client.
//! - [`router`]: the Adapter Router (model-pattern routing + alias rewrite).
//! - [`dialect`]: canonical request/response envelope and per-dialect DTOs.
//! - [`translate`]: bidirectional translation between dialects, streaming included.
//! - [`tool_adapter`]: tool filtering/renaming/guidance and the duplicate-tool-call
//!   loop detector.
//! - [`scheduler`]: the WFQ priority scheduler and quota manager.
//! - [`responses`]: the Responses provider's tool-resume session store.
//! - [`chat`], [`completion`], [`embedding`]: per-capability provider traits.
//! - [`providers`]: the lazily-refreshed model-metadata store (context window,
//!   capabilities) backed by the models.dev catalog.

use serde_json::Value;

use chat::Tool;
use serde::{Deserialize, Serialize};

#[cfg(feature = "http-client")]
pub mod adapters;

pub mod auth;

/// Builder pattern for configuring and instantiating LLM providers
#[cfg(feature = "http-client")]
pub mod builder;

/// Chat-based interactions with language models (e.g. ChatGPT style)
pub mod chat;

/// Text completion capabilities (e.g. GPT-3 style completion)
pub mod completion;

/// Canonical request/response envelope and per-dialect wire DTOs.
pub mod dialect;

/// Vector embeddings generation for text
pub mod embedding;

/// Error types and handling
pub mod error;

/// The adapter-factory contract (`HTTPLLMProviderFactory`) every upstream
/// provider crate implements to register itself under the Adapter Router,
/// plus the shared HTTP-status-to-`LLMError` mapping they all use.
pub mod factory;

/// The gateway boundary error type (`GatewayError`) and its dialect-specific
/// wire rendering / HTTP status mapping.
pub mod gateway_error;

#[cfg(feature = "http-client")]
pub mod outbound;

pub mod params;

/// Lazily-refreshed model metadata (context window, capabilities, pricing).
pub mod providers;

/// Adapter Router: model-pattern routing, alias rewrite, fallback cascade.
#[cfg(feature = "http-client")]
pub mod router;

/// The Responses provider's tool-resume session store.
#[cfg(feature = "http-client")]
pub mod responses;

/// The priority scheduler and quota manager.
#[cfg(feature = "http-client")]
pub mod scheduler;

pub mod session;

/// Tool filtering/renaming/guidance and the duplicate-tool-call loop detector.
pub mod tool_adapter;

pub mod tool_decorator;

/// Protocol translators between OpenAI chat, Anthropic Messages, and
/// OpenAI Responses, covering both non-streaming and SSE paths.
pub mod translate;

/// Core trait that all LLM providers must implement, combining chat, completion
/// and embedding capabilities into a unified interface
#[async_trait::async_trait]
pub trait LLMProvider:
    chat::ChatProvider
    + completion::CompletionProvider
    + embedding::EmbeddingProvider
{
    fn tools(&self) -> Option<&[Tool]> {
        None
    }

    async fn call_tool(&self, _name: &str, _args: Value) -> Result<String, error::LLMError> {
        Err(error::LLMError::ProviderError(
            "tool calling not supported".into(),
        ))
    }

    /// The name of the (e.g. MCP) server that backs a given tool, for
    /// providers that track tool provenance. `None` for plain function tools.
    fn tool_server_name(&self, _name: &str) -> Option<&str> {
        None
    }
}

pub trait HTTPLLMProvider:
    chat::http::HTTPChatProvider
    + completion::http::HTTPCompletionProvider
    + embedding::http::HTTPEmbeddingProvider
    + Send
    + Sync
{
    fn tools(&self) -> Option<&[Tool]> {
        None
    }
}

/// Tool call represents a function call that an LLM wants to make.
/// This is a standardized structure used across all providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// FunctionCall contains details about which function to call and with what arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, typically serialized as a JSON string.
    pub arguments: String,
}

/// Represents the usage of tokens in a tool call, supporting multiple JSON formats.
///
/// This is also the unit the Priority Scheduler's quota manager charges against:
/// `input_tokens + output_tokens` (reasoning and cache tokens are tracked for
/// accounting and billing readouts but are not charged against rate-limit quotas).
#[derive(Debug, Serialize, Deserialize, Clone, Default, Eq, PartialEq)]
pub struct Usage {
    /// Number of input tokens.
    #[serde(
        alias = "prompt_tokens",     // OpenAI, xAI, DeepSeek, Mistral, OpenRouter, Alibaba
        alias = "input_tokens",      // Anthropic
        alias = "prompt_eval_count", // Ollama
        alias = "promptTokenCount"   // Google
    )]
    pub input_tokens: u32,
    /// Number of output tokens.
    #[serde(
        alias = "completion_tokens",   // OpenAI, xAI, DeepSeek, Mistral, OpenRouter, Alibaba
        alias = "output_tokens",       // Anthropic
        alias = "eval_count",          // Ollama
        alias = "candidatesTokenCount" // Google
    )]
    pub output_tokens: u32,
    /// Tokens spent on hidden reasoning/thinking, when the upstream reports them
    /// separately from visible output tokens.
    #[serde(default)]
    pub reasoning_tokens: u32,
    /// Tokens served from a prompt cache.
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read: u32,
    /// Tokens written to a prompt cache.
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_write: u32,
}

//! Canonical request/response envelope shared by every dialect, plus the
//! per-dialect wire DTOs that [`crate::translate`] converts to and from it.
//!
//! The envelope is a discriminated union on purpose (DESIGN NOTES §9): every
//! layer boundary (ingress -> translator -> adapter) clones it rather than
//! sharing references, mirroring [`crate::session::in_memory::InMemorySessionStore`]'s
//! clone-on-mutation convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{Tool, ToolChoice};
use crate::{ToolCall, Usage};

pub mod anthropic;
pub mod openai_chat;
pub mod responses;

/// One of the three request/response shapes the gateway accepts or speaks
/// upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAiChat,
    Anthropic,
    Responses,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAiChat => "openai_chat",
            Dialect::Anthropic => "anthropic",
            Dialect::Responses => "responses",
        }
    }
}

/// A role a [`GatewayMessage`] can carry. Distinct from [`crate::chat::ChatRole`],
/// which only distinguishes user/assistant; the gateway envelope also needs
/// `system` and `tool` to round-trip all three dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Anthropic-style prompt cache breakpoint, passed through verbatim when the
/// target dialect understands it and dropped silently otherwise (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub cache_type: String,
}

/// One typed part of a message's content, per DESIGN NOTES §9's discriminated
/// union (`text | image_ref | tool_use | tool_result | container_upload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    InputText { text: String },
    ImageUrl { url: String, mime: Option<String> },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    ContainerUpload { id: String, filename: Option<String> },
}

/// Message content: either flat text (the common case) or an ordered
/// sequence of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenates every `Text`/`InputText` part; used by translators that
    /// need a flat string (e.g. OpenAI chat's `content` field).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::InputText { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(p) => p.is_empty(),
        }
    }
}

/// A single canonical message. Invariant (spec §3): an assistant message
/// carries text, `tool_calls`, or both - never neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl GatewayMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            tool_calls: None,
            cache_control: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            tool_calls: None,
            cache_control: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            tool_calls: None,
            cache_control: None,
        }
    }

    /// True if this message violates the "never empty" assistant invariant.
    pub fn is_empty_assistant(&self) -> bool {
        self.role == Role::Assistant
            && self.content.is_empty()
            && self.tool_calls.as_ref().map(|c| c.is_empty()).unwrap_or(true)
    }
}

/// A tool definition in the canonical envelope. Reuses [`crate::chat::Tool`]'s
/// `function.parameters` JSON-schema shape directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl From<&Tool> for GatewayTool {
    fn from(t: &Tool) -> Self {
        GatewayTool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
            cache_control: None,
        }
    }
}

/// `thinking`/reasoning config, as accepted by Anthropic extended thinking
/// and OpenAI `reasoning_effort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    pub budget_tokens: Option<u32>,
}

/// The canonical request envelope (spec §3). Built by a translator from one
/// of the three wire dialects, or directly by the HTTP layer in passthrough
/// mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub model: String,
    pub messages: Vec<GatewayMessage>,
    #[serde(default)]
    pub tools: Vec<GatewayTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl GatewayRequest {
    /// The resolved max-token ceiling, preferring `max_completion_tokens`
    /// (OpenAI's newer field name) over `max_tokens` when both are present.
    pub fn effective_max_tokens(&self) -> Option<u32> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    /// First system message's text, if any.
    pub fn system_text(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_text())
    }

    /// A rough token estimate for scheduler admission: ~4 chars/token over
    /// every message's flattened text plus tool schemas, which is the same
    /// crude heuristic the teacher's builder uses for context-window checks.
    pub fn estimate_tokens(&self) -> u32 {
        let text_len: usize = self
            .messages
            .iter()
            .map(|m| m.content.as_text().len())
            .sum::<usize>()
            + self
                .tools
                .iter()
                .map(|t| t.description.len() + t.parameters.to_string().len())
                .sum::<usize>();
        ((text_len / 4) as u32).max(1)
    }
}

/// The canonical, non-streaming response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub id: String,
    pub model: String,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: String,
    pub usage: Usage,
}

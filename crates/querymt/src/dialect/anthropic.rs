//! Anthropic Messages wire DTOs and conversion to/from the canonical
//! envelope, plus SSE event rendering for the Anthropic streaming shape.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    CacheControl, ContentPart, GatewayMessage, GatewayRequest, GatewayResponse, GatewayTool,
    MessageContent, Role, ThinkingConfig,
};
use crate::chat::{StreamChunk, ToolChoice};
use crate::{FunctionCall, ToolCall, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<AnthropicThinking>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicThinking {
    #[serde(rename = "type")]
    pub thinking_type: String,
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<Value>,
    pub stop_reason: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

fn role_out(r: Role) -> &'static str {
    match r {
        Role::Assistant => "assistant",
        Role::System | Role::Tool | Role::User => "user",
    }
}

/// Folds canonical messages into Anthropic's shape: the leading system
/// message (if any) is pulled out into the top-level `system` field, and
/// consecutive tool-result messages are merged into the preceding user turn
/// the way Anthropic expects (`tool_result` blocks live inside a `user`
/// message, never their own top-level role).
impl From<&GatewayRequest> for MessagesRequest {
    fn from(req: &GatewayRequest) -> Self {
        let system = req.system_text().filter(|s| !s.is_empty()).map(Value::String);
        let mut messages = Vec::new();
        for m in req.messages.iter().filter(|m| m.role != Role::System) {
            let content = match m.role {
                Role::Assistant => {
                    let mut parts = Vec::new();
                    let text = m.content.as_text();
                    if !text.is_empty() {
                        parts.push(json!({ "type": "text", "text": text }));
                    }
                    for tc in m.tool_calls.iter().flatten() {
                        let input: Value = serde_json::from_str(&tc.function.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        parts.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.function.name,
                            "input": input,
                        }));
                    }
                    Value::Array(parts)
                }
                Role::Tool => Value::Array(vec![json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content.as_text(),
                })]),
                _ => match &m.content {
                    MessageContent::Text(s) => Value::String(s.clone()),
                    MessageContent::Parts(parts) => {
                        Value::Array(parts.iter().map(content_part_out).collect())
                    }
                },
            };
            messages.push(AnthropicMessage {
                role: role_out(m.role).to_string(),
                content,
            });
        }
        MessagesRequest {
            model: req.model.clone(),
            system,
            messages,
            tools: req
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                    cache_control: t.cache_control.clone(),
                })
                .collect(),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_out),
            max_tokens: req.effective_max_tokens().unwrap_or(4096),
            temperature: req.temperature,
            stop_sequences: req.stop.clone(),
            stream: req.stream,
            thinking: req.thinking.as_ref().map(|t| AnthropicThinking {
                thinking_type: t.thinking_type.clone(),
                budget_tokens: t.budget_tokens,
            }),
        }
    }
}

fn content_part_out(p: &ContentPart) -> Value {
    match p {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::InputText { text } => json!({ "type": "text", "text": text }),
        ContentPart::ImageUrl { url, .. } => {
            json!({ "type": "image", "source": { "type": "url", "url": url }})
        }
        ContentPart::ToolUse { id, name, input } => {
            json!({ "type": "tool_use", "id": id, "name": name, "input": input })
        }
        ContentPart::ToolResult { tool_use_id, content, is_error } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentPart::ContainerUpload { id, filename } => {
            json!({ "type": "container_upload", "id": id, "filename": filename })
        }
    }
}

fn tool_choice_out(tc: &ToolChoice) -> Value {
    match tc {
        ToolChoice::Auto => json!({ "type": "auto" }),
        ToolChoice::Any => json!({ "type": "any" }),
        ToolChoice::None => json!({ "type": "none" }),
        ToolChoice::Tool(name) => json!({ "type": "tool", "name": name }),
    }
}

/// Converts an inbound Anthropic Messages request into the canonical
/// envelope: system text becomes a leading system message, `tool_use`
/// blocks become assistant `tool_calls`, and `tool_result` blocks become
/// tool-role messages keyed by `tool_use_id`.
impl From<&MessagesRequest> for GatewayRequest {
    fn from(req: &MessagesRequest) -> Self {
        let mut messages = Vec::new();
        if let Some(sys) = &req.system {
            let text = match sys {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            if !text.is_empty() {
                messages.push(GatewayMessage::system(text));
            }
        }
        for m in &req.messages {
            let role = if m.role == "assistant" { Role::Assistant } else { Role::User };
            match &m.content {
                Value::String(s) => messages.push(GatewayMessage {
                    role,
                    content: MessageContent::Text(s.clone()),
                    tool_call_id: None,
                    tool_calls: None,
                    cache_control: None,
                }),
                Value::Array(blocks) => {
                    let mut tool_calls = Vec::new();
                    let mut parts = Vec::new();
                    for block in blocks {
                        match block.get("type").and_then(|t| t.as_str()) {
                            Some("tool_use") => {
                                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                                let input = block.get("input").cloned().unwrap_or(Value::Null);
                                tool_calls.push(ToolCall {
                                    id: id.to_string(),
                                    call_type: "function".to_string(),
                                    function: FunctionCall {
                                        name: name.to_string(),
                                        arguments: input.to_string(),
                                    },
                                });
                            }
                            Some("tool_result") => {
                                let tool_use_id = block
                                    .get("tool_use_id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                let content = match block.get("content") {
                                    Some(Value::String(s)) => s.clone(),
                                    Some(Value::Array(inner)) => inner
                                        .iter()
                                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                        .collect::<Vec<_>>()
                                        .join(""),
                                    _ => String::new(),
                                };
                                messages.push(GatewayMessage {
                                    role: Role::Tool,
                                    content: MessageContent::Text(content),
                                    tool_call_id: Some(tool_use_id),
                                    tool_calls: None,
                                    cache_control: None,
                                });
                            }
                            Some("text") | None => {
                                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                    parts.push(ContentPart::Text { text: text.to_string() });
                                }
                            }
                            _ => {}
                        }
                    }
                    if !parts.is_empty() || !tool_calls.is_empty() {
                        messages.push(GatewayMessage {
                            role,
                            content: if parts.is_empty() {
                                MessageContent::Text(String::new())
                            } else {
                                MessageContent::Parts(parts)
                            },
                            tool_call_id: None,
                            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                            cache_control: None,
                        });
                    }
                }
                _ => {}
            }
        }
        GatewayRequest {
            model: req.model.clone(),
            messages,
            tools: req
                .tools
                .iter()
                .map(|t| GatewayTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                    cache_control: t.cache_control.clone(),
                })
                .collect(),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_in),
            max_tokens: Some(req.max_tokens),
            max_completion_tokens: None,
            temperature: req.temperature,
            stop: req.stop_sequences.clone(),
            stream: req.stream,
            reasoning_effort: None,
            thinking: req.thinking.as_ref().map(|t| ThinkingConfig {
                thinking_type: t.thinking_type.clone(),
                budget_tokens: t.budget_tokens,
            }),
            parallel_tool_calls: None,
            user: None,
        }
    }
}

fn tool_choice_in(v: &Value) -> ToolChoice {
    match v.get("type").and_then(|t| t.as_str()) {
        Some("any") => ToolChoice::Any,
        Some("none") => ToolChoice::None,
        Some("tool") => ToolChoice::Tool(
            v.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
        ),
        _ => ToolChoice::Auto,
    }
}

impl From<&GatewayResponse> for MessagesResponse {
    fn from(resp: &GatewayResponse) -> Self {
        let mut content = Vec::new();
        if let Some(text) = &resp.text {
            if !text.is_empty() {
                content.push(json!({ "type": "text", "text": text }));
            }
        }
        for tc in &resp.tool_calls {
            let input: Value =
                serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
            content.push(json!({
                "type": "tool_use", "id": tc.id, "name": tc.function.name, "input": input
            }));
        }
        MessagesResponse {
            id: resp.id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            model: resp.model.clone(),
            content,
            stop_reason: Some(anthropic_stop_reason(&resp.stop_reason).to_string()),
            usage: AnthropicUsage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                cache_creation_input_tokens: if resp.usage.cache_write > 0 {
                    Some(resp.usage.cache_write)
                } else {
                    None
                },
                cache_read_input_tokens: if resp.usage.cache_read > 0 {
                    Some(resp.usage.cache_read)
                } else {
                    None
                },
            },
        }
    }
}

fn anthropic_stop_reason(stop: &str) -> &'static str {
    match stop {
        "tool_calls" | "tool_use" => "tool_use",
        "length" | "max_tokens" => "max_tokens",
        _ => "end_turn",
    }
}

/// Per-stream accumulator for rendering the Anthropic SSE event sequence
/// (`message_start`, `content_block_start`, `content_block_delta`,
/// `content_block_stop`, `message_delta`, `message_stop`).
#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    pub id: String,
    pub model: String,
    pub started: bool,
    pub text_block_open: bool,
    pub open_tool_block: Option<usize>,
}

/// Renders a [`StreamChunk`] as zero or more Anthropic SSE events
/// (`event`, `data`) pairs.
pub fn render_anthropic_chunk(
    chunk: &StreamChunk,
    state: &mut AnthropicStreamState,
) -> Vec<(&'static str, Value)> {
    let mut events = Vec::new();
    if !state.started {
        state.started = true;
        events.push((
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": state.id, "type": "message", "role": "assistant",
                    "model": state.model, "content": [], "stop_reason": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            }),
        ));
    }
    match chunk {
        StreamChunk::Text(text) => {
            if !state.text_block_open {
                state.text_block_open = true;
                events.push((
                    "content_block_start",
                    json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "text", "text": "" } }),
                ));
            }
            events.push((
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "text_delta", "text": text } }),
            ));
        }
        StreamChunk::Thinking(text) => {
            events.push((
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "thinking_delta", "thinking": text } }),
            ));
        }
        StreamChunk::ToolUseStart { index, id, name } => {
            state.open_tool_block = Some(*index);
            events.push((
                "content_block_start",
                json!({ "type": "content_block_start", "index": index,
                    "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} } }),
            ));
        }
        StreamChunk::ToolUseInputDelta { index, partial_json } => {
            events.push((
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": index,
                    "delta": { "type": "input_json_delta", "partial_json": partial_json } }),
            ));
        }
        StreamChunk::ToolUseComplete { index, .. } => {
            events.push((
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
        StreamChunk::Usage(usage) => {
            events.push((
                "message_delta",
                json!({ "type": "message_delta", "delta": { "stop_reason": null },
                    "usage": super::openai_chat::usage_to_json(usage) }),
            ));
        }
        StreamChunk::Done { stop_reason } => {
            if state.text_block_open {
                events.push((
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": 0 }),
                ));
            }
            events.push((
                "message_delta",
                json!({ "type": "message_delta",
                    "delta": { "stop_reason": anthropic_stop_reason(stop_reason) },
                    "usage": { "output_tokens": 0 } }),
            ));
            events.push(("message_stop", json!({ "type": "message_stop" })));
        }
    }
    events
}

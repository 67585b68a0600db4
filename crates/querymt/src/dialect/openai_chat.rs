//! OpenAI Chat Completions wire DTOs and their conversion to/from the
//! canonical [`super::GatewayRequest`]/[`super::GatewayResponse`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{CacheControl, ContentPart, GatewayMessage, GatewayRequest, GatewayResponse,
    GatewayTool, MessageContent, Role, ThinkingConfig};
use crate::chat::{StreamChunk, Tool, ToolChoice};
use crate::{FunctionCall, ToolCall, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: OpenAiUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<Value>,
}

fn role_to_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn str_to_role(s: &str) -> Role {
    match s {
        "system" | "developer" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

/// Converts a canonical request into an OpenAI Chat Completions request body.
impl From<&GatewayRequest> for ChatCompletionRequest {
    fn from(req: &GatewayRequest) -> Self {
        let messages = req
            .messages
            .iter()
            .map(|m| ChatCompletionMessage {
                role: role_to_str(m.role).to_string(),
                content: if m.content.is_empty() && m.tool_calls.is_some() {
                    None
                } else {
                    Some(Value::String(m.content.as_text()))
                },
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: m.tool_calls.clone(),
            })
            .collect();
        ChatCompletionRequest {
            model: req.model.clone(),
            messages,
            tools: req
                .tools
                .iter()
                .map(|t| Tool {
                    tool_type: "function".into(),
                    function: crate::chat::FunctionTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            tool_choice: req.tool_choice.clone(),
            max_tokens: req.max_tokens,
            max_completion_tokens: req.max_completion_tokens,
            temperature: req.temperature,
            stop: req.stop.clone(),
            stream: req.stream,
            reasoning_effort: req.reasoning_effort.clone(),
            parallel_tool_calls: req.parallel_tool_calls,
            user: req.user.clone(),
        }
    }
}

/// Converts an OpenAI Chat Completions request body into the canonical
/// envelope.
impl From<&ChatCompletionRequest> for GatewayRequest {
    fn from(req: &ChatCompletionRequest) -> Self {
        let messages = req
            .messages
            .iter()
            .map(|m| GatewayMessage {
                role: str_to_role(&m.role),
                content: match &m.content {
                    Some(Value::String(s)) => MessageContent::Text(s.clone()),
                    Some(Value::Array(parts)) => MessageContent::Parts(
                        parts
                            .iter()
                            .map(|p| openai_content_part_in(p))
                            .collect(),
                    ),
                    _ => MessageContent::Text(String::new()),
                },
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: m.tool_calls.clone(),
                cache_control: None,
            })
            .collect();
        GatewayRequest {
            model: req.model.clone(),
            messages,
            tools: req.tools.iter().map(GatewayTool::from).collect(),
            tool_choice: req.tool_choice.clone(),
            max_tokens: req.max_tokens,
            max_completion_tokens: req.max_completion_tokens,
            temperature: req.temperature,
            stop: req.stop.clone(),
            stream: req.stream,
            reasoning_effort: req.reasoning_effort.clone(),
            thinking: None,
            parallel_tool_calls: req.parallel_tool_calls,
            user: req.user.clone(),
        }
    }
}

fn openai_content_part_in(v: &Value) -> ContentPart {
    let kind = v.get("type").and_then(|t| t.as_str()).unwrap_or("text");
    match kind {
        "image_url" => ContentPart::ImageUrl {
            url: v
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string(),
            mime: None,
        },
        _ => ContentPart::Text {
            text: v.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
        },
    }
}

/// Converts a canonical response into an OpenAI Chat Completions response
/// body.
impl From<&GatewayResponse> for ChatCompletionResponse {
    fn from(resp: &GatewayResponse) -> Self {
        let finish_reason = Some(resp.stop_reason.clone());
        ChatCompletionResponse {
            id: resp.id.clone(),
            object: "chat.completion".to_string(),
            model: resp.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatCompletionMessage {
                    role: "assistant".to_string(),
                    content: resp.text.clone().map(Value::String),
                    tool_call_id: None,
                    tool_calls: if resp.tool_calls.is_empty() {
                        None
                    } else {
                        Some(resp.tool_calls.clone())
                    },
                },
                finish_reason,
            }],
            usage: OpenAiUsage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                completion_tokens_details: if resp.usage.reasoning_tokens > 0 {
                    Some(json!({ "reasoning_tokens": resp.usage.reasoning_tokens }))
                } else {
                    None
                },
            },
        }
    }
}

/// Per-stream accumulator mirroring `querymt-service`'s `StreamState`:
/// tracks the tool-call index/id/name so later `ToolUseInputDelta` chunks
/// render as `chat.completion.chunk` deltas that only carry the growing
/// `arguments` string, never the name again.
#[derive(Debug, Default)]
pub struct OpenAiChunkState {
    pub id: String,
    pub model: String,
    pub tool_call_index: Option<u32>,
}

/// Renders one adapter-normalized [`StreamChunk`] as an OpenAI
/// `chat.completion.chunk` SSE payload. Returns `None` for chunks that carry
/// no OpenAI-visible delta (bookkeeping-only events).
pub fn render_openai_chunk(chunk: &StreamChunk, state: &mut OpenAiChunkState) -> Option<Value> {
    let base = json!({
        "id": state.id,
        "object": "chat.completion.chunk",
        "model": state.model,
    });
    let mut obj = base.as_object().unwrap().clone();
    match chunk {
        StreamChunk::Text(text) => {
            obj.insert(
                "choices".into(),
                json!([{ "index": 0, "delta": { "content": text }, "finish_reason": null }]),
            );
        }
        StreamChunk::Thinking(_) => return None,
        StreamChunk::ToolUseStart { index, id, name } => {
            state.tool_call_index = Some(*index as u32);
            obj.insert(
                "choices".into(),
                json!([{
                    "index": 0,
                    "delta": { "tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": "" }
                    }]},
                    "finish_reason": null
                }]),
            );
        }
        StreamChunk::ToolUseInputDelta { index, partial_json } => {
            obj.insert(
                "choices".into(),
                json!([{
                    "index": 0,
                    "delta": { "tool_calls": [{
                        "index": index,
                        "function": { "arguments": partial_json }
                    }]},
                    "finish_reason": null
                }]),
            );
        }
        StreamChunk::ToolUseComplete { .. } => return None,
        StreamChunk::Usage(usage) => {
            obj.insert(
                "choices".into(),
                json!([{ "index": 0, "delta": {}, "finish_reason": null }]),
            );
            obj.insert("usage".into(), usage_to_json(usage));
        }
        StreamChunk::Done { stop_reason } => {
            obj.insert(
                "choices".into(),
                json!([{ "index": 0, "delta": {}, "finish_reason": openai_finish_reason(stop_reason) }]),
            );
        }
    }
    Some(Value::Object(obj))
}

fn openai_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "tool_use" | "tool_calls" => "tool_calls",
        "max_tokens" | "length" => "length",
        _ => "stop",
    }
}

pub fn usage_to_json(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "reasoning_tokens": usage.reasoning_tokens,
        "cache_read_tokens": usage.cache_read,
        "cache_creation_tokens": usage.cache_write,
    })
}

pub fn function_call_from(tool_call: &ToolCall) -> FunctionCall {
    tool_call.function.clone()
}

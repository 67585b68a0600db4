//! OpenAI Responses wire DTOs, conversion to/from the canonical envelope,
//! and the Responses streaming event sequence
//! (`response.created -> response.output_item.added -> ... -> response.completed`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{GatewayMessage, GatewayRequest, GatewayResponse, GatewayTool, MessageContent, Role};
use crate::chat::{StreamChunk, Tool, ToolChoice};
use crate::{FunctionCall, ToolCall, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<ResponsesInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

/// One Responses `input` item. `#[serde(untagged)]` because the wire shape
/// is keyed by the presence of distinguishing fields rather than a single
/// `type` tag value set (message items use `role`, function items don't).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesInputItem {
    Message {
        role: String,
        content: Vec<ResponsesContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesContentPart {
    InputText { text: String },
    OutputText { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub status: String,
    pub output: Vec<Value>,
    pub usage: ResponsesUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens_details: Option<Value>,
}

/// Folds Responses `input` items into canonical messages: `input_text`/
/// `output_text` parts become plain text messages, `function_call` items
/// become an assistant message with `tool_calls`, `function_call_output`
/// items become a tool-role message keyed by `call_id` (the gateway's
/// `tool_call_id`).
impl From<&ResponsesRequest> for GatewayRequest {
    fn from(req: &ResponsesRequest) -> Self {
        let mut messages = Vec::new();
        if let Some(instructions) = &req.instructions {
            if !instructions.is_empty() {
                messages.push(GatewayMessage::system(instructions.clone()));
            }
        }
        for item in &req.input {
            match item {
                ResponsesInputItem::Message { role, content } => {
                    let text = content
                        .iter()
                        .map(|p| match p {
                            ResponsesContentPart::InputText { text } => text.as_str(),
                            ResponsesContentPart::OutputText { text } => text.as_str(),
                        })
                        .collect::<Vec<_>>()
                        .join("");
                    let role = if role == "assistant" { Role::Assistant }
                        else if role == "system" || role == "developer" { Role::System }
                        else { Role::User };
                    messages.push(GatewayMessage {
                        role,
                        content: MessageContent::Text(text),
                        tool_call_id: None,
                        tool_calls: None,
                        cache_control: None,
                    });
                }
                ResponsesInputItem::FunctionCall { call_id, name, arguments } => {
                    messages.push(GatewayMessage {
                        role: Role::Assistant,
                        content: MessageContent::Text(String::new()),
                        tool_call_id: None,
                        tool_calls: Some(vec![ToolCall {
                            id: call_id.clone(),
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: arguments.clone(),
                            },
                        }]),
                        cache_control: None,
                    });
                }
                ResponsesInputItem::FunctionCallOutput { call_id, output } => {
                    messages.push(GatewayMessage {
                        role: Role::Tool,
                        content: MessageContent::Text(output.clone()),
                        tool_call_id: Some(call_id.clone()),
                        tool_calls: None,
                        cache_control: None,
                    });
                }
            }
        }
        GatewayRequest {
            model: req.model.clone(),
            messages,
            tools: req.tools.iter().map(GatewayTool::from).collect(),
            tool_choice: req.tool_choice.clone(),
            max_tokens: req.max_output_tokens,
            max_completion_tokens: None,
            temperature: req.temperature,
            stop: Vec::new(),
            stream: req.stream,
            reasoning_effort: None,
            thinking: None,
            parallel_tool_calls: req.parallel_tool_calls,
            user: None,
        }
    }
}

impl From<&GatewayResponse> for ResponsesResponse {
    fn from(resp: &GatewayResponse) -> Self {
        let mut output = Vec::new();
        if let Some(text) = &resp.text {
            if !text.is_empty() {
                output.push(json!({
                    "type": "message", "id": format!("msg_{}", resp.id), "role": "assistant",
                    "status": "completed",
                    "content": [{ "type": "output_text", "text": text }]
                }));
            }
        }
        for tc in &resp.tool_calls {
            output.push(json!({
                "type": "function_call",
                "id": format!("fc_{}", tc.id),
                "call_id": tc.id,
                "name": tc.function.name,
                "arguments": tc.function.arguments,
                "status": "completed",
            }));
        }
        let status = if resp.tool_calls.is_empty() { "completed" } else { "requires_action" };
        let required_action = if resp.tool_calls.is_empty() {
            None
        } else {
            let tool_calls: Vec<Value> = resp
                .tool_calls
                .iter()
                .map(|tc| json!({ "id": tc.id, "call_id": tc.id,
                    "name": tc.function.name, "arguments": tc.function.arguments, "type": "function" }))
                .collect();
            Some(json!({
                "type": "submit_tool_outputs",
                "submit_tool_outputs": { "tool_calls": tool_calls }
            }))
        };
        ResponsesResponse {
            id: resp.id.clone(),
            object: "response".to_string(),
            model: resp.model.clone(),
            status: status.to_string(),
            output,
            usage: ResponsesUsage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                output_tokens_details: if resp.usage.reasoning_tokens > 0 {
                    Some(json!({ "reasoning_tokens": resp.usage.reasoning_tokens }))
                } else {
                    None
                },
            },
            required_action,
        }
    }
}

/// Per-stream accumulator driving the Responses event sequence. Owns the
/// monotonic `sequence_number` counter and the stable `item_id`/`call_id`
/// pair for whichever output item is currently open, satisfying testable
/// property 8 (sequence strictly increasing, ids constant across
/// `added`/`delta*`/`done`).
#[derive(Debug)]
pub struct ResponsesStreamState {
    pub response_id: String,
    pub model: String,
    pub seq: u64,
    pub message_item_id: Option<String>,
    pub message_opened: bool,
    pub message_text: String,
    pub tool_items: std::collections::HashMap<usize, ToolItemState>,
    pub created_emitted: bool,
}

#[derive(Debug, Clone)]
pub struct ToolItemState {
    pub item_id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

impl ResponsesStreamState {
    pub fn new(response_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            model: model.into(),
            seq: 0,
            message_item_id: None,
            message_opened: false,
            message_text: String::new(),
            tool_items: std::collections::HashMap::new(),
            created_emitted: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }
}

/// Renders a [`StreamChunk`] as zero or more Responses SSE `(event, data)`
/// pairs, threading `sequence_number` through every event.
pub fn render_responses_chunk(
    chunk: &StreamChunk,
    state: &mut ResponsesStreamState,
) -> Vec<(&'static str, Value)> {
    let mut events = Vec::new();
    if !state.created_emitted {
        state.created_emitted = true;
        let seq = state.next_seq();
        events.push((
            "response.created",
            json!({
                "type": "response.created", "sequence_number": seq,
                "response": { "id": state.response_id, "object": "response",
                    "status": "in_progress", "model": state.model }
            }),
        ));
    }
    match chunk {
        StreamChunk::Text(text) => {
            if !state.message_opened {
                state.message_opened = true;
                let item_id = format!("msg_{}", state.response_id);
                state.message_item_id = Some(item_id.clone());
                let seq = state.next_seq();
                events.push((
                    "response.output_item.added",
                    json!({ "type": "response.output_item.added", "sequence_number": seq,
                        "output_index": 0,
                        "item": { "type": "message", "id": item_id, "role": "assistant", "content": [] } }),
                ));
            }
            state.message_text.push_str(text);
            let item_id = state.message_item_id.clone().unwrap_or_default();
            let seq = state.next_seq();
            events.push((
                "response.output_text.delta",
                json!({ "type": "response.output_text.delta", "sequence_number": seq,
                    "item_id": item_id, "output_index": 0, "delta": text }),
            ));
        }
        StreamChunk::Thinking(_) => {}
        StreamChunk::ToolUseStart { index, id, name } => {
            let item_id = format!("fc_{}", id);
            state.tool_items.insert(
                *index,
                ToolItemState { item_id: item_id.clone(), call_id: id.clone(), name: name.clone(), arguments: String::new() },
            );
            let seq = state.next_seq();
            events.push((
                "response.output_item.added",
                json!({ "type": "response.output_item.added", "sequence_number": seq,
                    "output_index": index + 1,
                    "item": { "type": "function_call", "id": item_id, "call_id": id, "name": name, "arguments": "" } }),
            ));
        }
        StreamChunk::ToolUseInputDelta { index, partial_json } => {
            if let Some(t) = state.tool_items.get_mut(index) {
                t.arguments.push_str(partial_json);
                let (item_id, call_id) = (t.item_id.clone(), t.call_id.clone());
                let seq = state.next_seq();
                events.push((
                    "response.function_call_arguments.delta",
                    json!({ "type": "response.function_call_arguments.delta", "sequence_number": seq,
                        "item_id": item_id, "output_index": index + 1, "call_id": call_id, "delta": partial_json }),
                ));
            }
        }
        StreamChunk::ToolUseComplete { index, .. } => {
            if let Some(t) = state.tool_items.get(index).cloned() {
                let seq1 = state.next_seq();
                events.push((
                    "response.function_call_arguments.done",
                    json!({ "type": "response.function_call_arguments.done", "sequence_number": seq1,
                        "item_id": t.item_id, "output_index": index + 1, "call_id": t.call_id,
                        "arguments": t.arguments }),
                ));
                let seq2 = state.next_seq();
                events.push((
                    "response.output_item.done",
                    json!({ "type": "response.output_item.done", "sequence_number": seq2,
                        "output_index": index + 1,
                        "item": { "type": "function_call", "id": t.item_id, "call_id": t.call_id,
                            "name": t.name, "arguments": t.arguments, "status": "completed" } }),
                ));
            }
        }
        StreamChunk::Usage(_) => {}
        StreamChunk::Done { stop_reason } => {
            if state.message_opened {
                let item_id = state.message_item_id.clone().unwrap_or_default();
                let seq = state.next_seq();
                events.push((
                    "response.output_item.done",
                    json!({ "type": "response.output_item.done", "sequence_number": seq,
                        "output_index": 0,
                        "item": { "type": "message", "id": item_id, "role": "assistant",
                            "content": [{ "type": "output_text", "text": state.message_text }] } }),
                ));
            }
            let has_tool_calls = !state.tool_items.is_empty();
            let status = if has_tool_calls { "requires_action" } else { "completed" };
            let seq = state.next_seq();
            let mut response = json!({ "id": state.response_id, "object": "response",
                "status": status, "model": state.model });
            if has_tool_calls {
                let tool_calls: Vec<Value> = state
                    .tool_items
                    .values()
                    .map(|t| json!({ "id": t.call_id, "call_id": t.call_id,
                        "name": t.name, "arguments": t.arguments, "type": "function" }))
                    .collect();
                response["required_action"] = json!({
                    "type": "submit_tool_outputs",
                    "submit_tool_outputs": { "tool_calls": tool_calls }
                });
            }
            let _ = stop_reason;
            events.push((
                "response.completed",
                json!({ "type": "response.completed", "sequence_number": seq, "response": response }),
            ));
        }
    }
    events
}

pub fn usage_to_json(usage: &Usage) -> Value {
    super::openai_chat::usage_to_json(usage)
}

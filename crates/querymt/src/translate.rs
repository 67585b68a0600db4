//! Dialect-pair translation (spec §4.3). Non-streaming translation goes
//! through typed DTOs in [`crate::dialect`]; streaming translation is N
//! adapter-side parsers (already normalized to [`crate::chat::StreamChunk`]
//! by each provider) composed with M dialect-side renderers, rather than
//! three bespoke NxM state machines.

use serde_json::Value;

use crate::chat::StreamChunk;
use crate::dialect::{
    anthropic::{self, AnthropicStreamState, MessagesRequest, MessagesResponse},
    openai_chat::{self, ChatCompletionRequest, ChatCompletionResponse, OpenAiChunkState},
    responses::{self, ResponsesRequest, ResponsesResponse, ResponsesStreamState},
    Dialect, GatewayRequest, GatewayResponse,
};
use crate::gateway_error::GatewayError;

/// Parses a raw wire-format JSON body in `dialect` into the canonical
/// envelope.
pub fn parse_request(dialect: Dialect, body: &Value) -> Result<GatewayRequest, GatewayError> {
    match dialect {
        Dialect::OpenAiChat => {
            let req: ChatCompletionRequest = serde_json::from_value(body.clone())
                .map_err(|e| GatewayError::InvalidArgument(format!("invalid chat completion request: {e}")))?;
            Ok(GatewayRequest::from(&req))
        }
        Dialect::Anthropic => {
            let req: MessagesRequest = serde_json::from_value(body.clone())
                .map_err(|e| GatewayError::InvalidArgument(format!("invalid messages request: {e}")))?;
            Ok(GatewayRequest::from(&req))
        }
        Dialect::Responses => {
            let req: ResponsesRequest = serde_json::from_value(body.clone())
                .map_err(|e| GatewayError::InvalidArgument(format!("invalid responses request: {e}")))?;
            Ok(GatewayRequest::from(&req))
        }
    }
}

/// Renders the canonical response as a wire-format JSON body in `dialect`.
pub fn render_response(dialect: Dialect, resp: &GatewayResponse) -> Value {
    match dialect {
        Dialect::OpenAiChat => {
            serde_json::to_value(ChatCompletionResponse::from(resp)).expect("serializable")
        }
        Dialect::Anthropic => {
            serde_json::to_value(MessagesResponse::from(resp)).expect("serializable")
        }
        Dialect::Responses => {
            serde_json::to_value(ResponsesResponse::from(resp)).expect("serializable")
        }
    }
}

/// Per-connection streaming render state, one variant per outbound dialect.
pub enum StreamRenderState {
    OpenAi(OpenAiChunkState),
    Anthropic(AnthropicStreamState),
    Responses(ResponsesStreamState),
}

impl StreamRenderState {
    pub fn new(dialect: Dialect, id: impl Into<String>, model: impl Into<String>) -> Self {
        let id = id.into();
        let model = model.into();
        match dialect {
            Dialect::OpenAiChat => StreamRenderState::OpenAi(OpenAiChunkState { id, model, tool_call_index: None }),
            Dialect::Anthropic => StreamRenderState::Anthropic(AnthropicStreamState { id, model, ..Default::default() }),
            Dialect::Responses => StreamRenderState::Responses(ResponsesStreamState::new(id, model)),
        }
    }
}

/// Renders one normalized [`StreamChunk`] into the outbound dialect's SSE
/// `(event, data)` pairs. The OpenAI chat renderer emits a single
/// `chat.completion.chunk` event named `"message"`; the others can emit
/// several named events per chunk (Anthropic's multi-event sequence,
/// Responses' item lifecycle).
pub fn render_stream_chunk(chunk: &StreamChunk, state: &mut StreamRenderState) -> Vec<(&'static str, Value)> {
    match state {
        StreamRenderState::OpenAi(s) => openai_chat::render_openai_chunk(chunk, s)
            .map(|v| vec![("message", v)])
            .unwrap_or_default(),
        StreamRenderState::Anthropic(s) => anthropic::render_anthropic_chunk(chunk, s),
        StreamRenderState::Responses(s) => responses::render_responses_chunk(chunk, s),
    }
}

/// A synthetic error event emitted on the stream when the upstream sends a
/// malformed chunk (§4.3 failure semantics): `{"error": <kind>}`, dialect
/// specific only in its event name.
pub fn synthetic_error_event(dialect: Dialect, kind: &str, message: &str) -> (&'static str, Value) {
    let body = serde_json::json!({ "error": { "type": kind, "message": message } });
    match dialect {
        Dialect::OpenAiChat => ("error", body),
        Dialect::Anthropic => ("error", serde_json::json!({ "type": "error", "error": { "type": kind, "message": message } })),
        Dialect::Responses => ("response.failed", serde_json::json!({ "type": "response.failed", "error": { "code": kind, "message": message } })),
    }
}

/// Truncates an upstream error body to the 512-byte preview the spec caps
/// non-retryable upstream errors at.
pub fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= 512 {
        text.into_owned()
    } else {
        let mut truncated = text.chars().take(512).collect::<String>();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_to_canonical_round_trips_text() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "be terse" },
                { "role": "user", "content": "hi there" }
            ]
        });
        let req = parse_request(Dialect::OpenAiChat, &body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[1].content.as_text(), "hi there");
        let back = render_response(
            Dialect::OpenAiChat,
            &GatewayResponse {
                id: "resp1".into(),
                model: "gpt-4o".into(),
                text: Some("hi there".into()),
                tool_calls: vec![],
                stop_reason: "stop".into(),
                usage: Default::default(),
            },
        );
        assert_eq!(back["choices"][0]["message"]["content"], "hi there");
    }

    #[test]
    fn anthropic_system_becomes_leading_message() {
        let body = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1024,
            "system": "You are terse.",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        let req = parse_request(Dialect::Anthropic, &body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, crate::dialect::Role::System);
        assert_eq!(req.messages[0].content.as_text(), "You are terse.");
    }

    #[test]
    fn anthropic_tool_use_becomes_tool_calls() {
        let body = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1024,
            "messages": [
                { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "call_1", "name": "shell", "input": { "cmd": "ls" } }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "call_1", "content": "ok" }
                ]}
            ]
        });
        let req = parse_request(Dialect::Anthropic, &body).unwrap();
        let assistant = &req.messages[0];
        assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].id, "call_1");
        let tool_msg = &req.messages[1];
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn responses_sequence_numbers_strictly_increase_and_ids_stable() {
        let mut state = ResponsesStreamState::new("resp_1", "gpt-4o");
        let chunks = vec![
            StreamChunk::ToolUseStart { index: 0, id: "call_1".into(), name: "shell".into() },
            StreamChunk::ToolUseInputDelta { index: 0, partial_json: "{\"cmd\":".into() },
            StreamChunk::ToolUseInputDelta { index: 0, partial_json: "\"ls\"}".into() },
            StreamChunk::ToolUseComplete {
                index: 0,
                tool_call: crate::ToolCall {
                    id: "call_1".into(),
                    call_type: "function".into(),
                    function: crate::FunctionCall { name: "shell".into(), arguments: "{\"cmd\":\"ls\"}".into() },
                },
            },
            StreamChunk::Done { stop_reason: "tool_use".into() },
        ];
        let mut all_events = Vec::new();
        for c in &chunks {
            all_events.extend(responses::render_responses_chunk(c, &mut state));
        }
        let seqs: Vec<u64> = all_events
            .iter()
            .map(|(_, v)| v["sequence_number"].as_u64().unwrap())
            .collect();
        for w in seqs.windows(2) {
            assert!(w[1] > w[0], "sequence numbers must strictly increase: {:?}", seqs);
        }
        let mut arguments = String::new();
        for (_, v) in &all_events {
            if v["type"] == "response.function_call_arguments.delta" {
                arguments.push_str(v["delta"].as_str().unwrap());
            }
        }
        let done = all_events
            .iter()
            .find(|(_, v)| v["type"] == "response.function_call_arguments.done")
            .unwrap();
        assert_eq!(arguments, done.1["arguments"].as_str().unwrap());
    }
}

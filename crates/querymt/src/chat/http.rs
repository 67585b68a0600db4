use crate::{
    chat::{ChatMessage, ChatResponse, StreamChunk},
    error::LLMError,
    Tool,
};
use http::{Request, Response};

pub trait HTTPChatProvider: Send + Sync {
    fn chat_request(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Request<Vec<u8>>, LLMError>;
    fn parse_chat(&self, resp: Response<Vec<u8>>) -> Result<Box<dyn ChatResponse>, LLMError>;

    /// Returns true if the adapter can parse SSE chunks via `parse_chat_stream_chunk`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Parses one SSE frame (as delivered by the outbound HTTP client) into zero
    /// or more canonical stream events. Providers that support streaming must
    /// override this; the default matches `supports_streaming`'s `false`.
    fn parse_chat_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<StreamChunk>, LLMError> {
        let _ = chunk;
        Err(LLMError::NotImplemented(
            "streaming not supported by this provider".into(),
        ))
    }
}

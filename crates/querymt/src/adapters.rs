use crate::{
    chat::{ChatMessage, ChatProvider, ChatResponse, StreamChunk},
    completion::{CompletionProvider, CompletionRequest, CompletionResponse},
    embedding::EmbeddingProvider,
    error::LLMError,
    outbound::{call_outbound, call_outbound_stream},
    HTTPLLMProvider, LLMProvider, Tool,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use http::Request;
use std::pin::Pin;
use std::sync::Arc;

/// Forces `"stream": true` into an already-built JSON request body.
///
/// Adapters bake their `stream` flag into the provider config at construction
/// time (it's just another serialized field alongside `model`/`temperature`),
/// so a single adapter instance can't natively serve both a buffered chat
/// call and an SSE one. Rather than registering two config variants per
/// upstream, the streaming path patches the body after the adapter builds it.
fn force_streaming_body(req: Request<Vec<u8>>) -> Result<Request<Vec<u8>>, LLMError> {
    let (parts, body) = req.into_parts();
    let mut value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| LLMError::JsonError(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("stream".to_string(), serde_json::Value::Bool(true));
    }
    let new_body = serde_json::to_vec(&value).map_err(|e| LLMError::JsonError(e.to_string()))?;

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(parts.uri)
        .version(parts.version);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(new_body)
        .map_err(|e| LLMError::HttpError(e.to_string()))
}

pub struct LLMProviderFromHTTP {
    inner: Arc<dyn HTTPLLMProvider>,
}

impl LLMProviderFromHTTP {
    pub fn new(inner: Arc<dyn HTTPLLMProvider>) -> Self {
        Self { inner }
    }

    async fn do_chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError> {
        let req = self
            .inner
            .chat_request(messages, tools)
            .map_err(|e| LLMError::ProviderError(e.to_string()))?;

        let resp = call_outbound(req)
            .await
            .map_err(|e: Box<dyn std::error::Error>| LLMError::HttpError(e.to_string()))?;

        self.inner
            .parse_chat(resp)
            .map_err(|e: Box<dyn std::error::Error>| LLMError::ProviderError(e.to_string()))
    }
}

#[async_trait]
impl ChatProvider for LLMProviderFromHTTP {
    fn supports_streaming(&self) -> bool {
        self.inner.supports_streaming()
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError> {
        self.do_chat(messages, tools).await
    }

    async fn chat_stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>, LLMError> {
        if !self.inner.supports_streaming() {
            return Err(LLMError::NotImplemented(
                "this provider does not support streaming".into(),
            ));
        }

        let req = self
            .inner
            .chat_request(messages, tools)
            .map_err(|e| LLMError::ProviderError(e.to_string()))?;
        let req = force_streaming_body(req)?;

        let frames = call_outbound_stream(req).await?;
        let inner = self.inner.clone();

        let chunks = frames.flat_map(move |frame| {
            let events: Vec<Result<StreamChunk, LLMError>> = match frame {
                Ok(bytes) => match inner.parse_chat_stream_chunk(&bytes) {
                    Ok(events) => events.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(events)
        });

        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl EmbeddingProvider for LLMProviderFromHTTP {
    async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, LLMError> {
        let req = self.inner.embed_request(&inputs)?;
        let resp = call_outbound(req)
            .await
            .map_err(|e| LLMError::HttpError(e.to_string()))?;
        self.inner
            .parse_embed(resp)
            .map_err(|e| LLMError::ProviderError(e.to_string()))
    }
}

#[async_trait]
impl CompletionProvider for LLMProviderFromHTTP {
    async fn complete(&self, req_obj: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let req = self.inner.complete_request(req_obj)?;
        let resp = call_outbound(req)
            .await
            .map_err(|e| LLMError::HttpError(e.to_string()))?;
        self.inner
            .parse_complete(resp)
            .map_err(|e| LLMError::ProviderError(e.to_string()))
    }
}

impl LLMProvider for LLMProviderFromHTTP {
    fn tools(&self) -> Option<&[Tool]> {
        self.inner.tools()
    }
}

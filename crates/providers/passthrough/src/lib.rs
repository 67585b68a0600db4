//! The pass-through loopback adapter: echoes the last user turn back as the
//! assistant response without calling any real upstream. Registered directly
//! as an [`LLMProvider`] (no HTTP round trip, so it skips
//! `HTTPLLMProviderFactory` entirely), for local development and smoke
//! testing the gateway's routing/translation/scheduler plumbing end to end
//! without a live OpenAI/Anthropic/Ollama credential.

use async_trait::async_trait;
use querymt::chat::{ChatMessage, ChatProvider, ChatResponse, FinishReason, Tool};
use querymt::completion::{CompletionProvider, CompletionRequest, CompletionResponse};
use querymt::embedding::EmbeddingProvider;
use querymt::error::LLMError;
use querymt::{LLMProvider, Usage};

/// Deterministic embedding dimensionality, chosen to match the smallest
/// widely-used embedding model size so downstream code that asserts a
/// nonzero vector length doesn't need a passthrough special case.
const EMBEDDING_DIM: usize = 8;

#[derive(Debug)]
struct LoopbackResponse {
    text: String,
}

impl std::fmt::Display for LoopbackResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl ChatResponse for LoopbackResponse {
    fn text(&self) -> Option<String> {
        Some(self.text.clone())
    }

    fn tool_calls(&self) -> Option<Vec<querymt::ToolCall>> {
        None
    }

    fn finish_reason(&self) -> Option<FinishReason> {
        Some(FinishReason::Stop)
    }

    fn usage(&self) -> Option<Usage> {
        Some(Usage::default())
    }
}

/// A no-op upstream that mirrors the inbound conversation back to the
/// caller. Has no network dependency and no config beyond its name.
pub struct Passthrough;

impl Passthrough {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for Passthrough {
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[Tool]>,
    ) -> Result<Box<dyn ChatResponse>, LLMError> {
        let echoed = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Box::new(LoopbackResponse { text: echoed }))
    }
}

#[async_trait]
impl CompletionProvider for Passthrough {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
        Ok(CompletionResponse { text: req.prompt.clone() })
    }
}

#[async_trait]
impl EmbeddingProvider for Passthrough {
    async fn embed(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>, LLMError> {
        Ok(input
            .iter()
            .map(|s| {
                let mut v = vec![0.0f32; EMBEDDING_DIM];
                for (i, b) in s.bytes().enumerate() {
                    v[i % EMBEDDING_DIM] += b as f32 / 255.0;
                }
                v
            })
            .collect())
    }
}

impl LLMProvider for Passthrough {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_the_last_message_verbatim() {
        let provider = Passthrough::new();
        let messages = vec![ChatMessage::user().content("ping").build()];
        let resp = provider.chat(&messages).await.unwrap();
        assert_eq!(resp.text().unwrap(), "ping");
    }

    #[tokio::test]
    async fn embeddings_are_deterministic_and_nonzero_for_nonempty_input() {
        let provider = Passthrough::new();
        let out = provider.embed(vec!["hello".into()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), EMBEDDING_DIM);
        assert!(out[0].iter().any(|&x| x != 0.0));
    }
}

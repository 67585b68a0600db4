//! Adapter Router (spec §4.1) and Fallback Wrapper (spec §4.2).
//!
//! Grounded on [`crate::tool_decorator::ToolEnabledProvider`]'s
//! decorator-over-[`crate::LLMProvider`] pattern for the fallback cascade,
//! and on the teacher's plugin registry's `RwLock<HashMap<...>>` /
//! last-registration-wins insert semantics for the adapter map itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tracing::{debug, instrument, warn};

use crate::chat::{ChatMessage, ChatRole, MessageType, StreamChunk, Tool};
use crate::dialect::GatewayRequest;
use crate::error::LLMError;
use crate::gateway_error::GatewayError;
use crate::{LLMProvider, ToolCall};

pub type AdapterHandle = Arc<dyn LLMProvider + Send + Sync>;

/// A glob-style pattern over model identifiers: exact, `prefix*`,
/// `*suffix`, or `*contains*`. Matching is always case-insensitive against
/// an already-canonicalized key.
#[derive(Debug, Clone)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Pattern(raw.into().to_lowercase())
    }

    pub fn matches(&self, key: &str) -> bool {
        let p = self.0.as_str();
        if let Some(inner) = p.strip_prefix('*').and_then(|s| s.strip_suffix('*')) {
            if p.len() > 1 {
                return key.contains(inner);
            }
        }
        if let Some(prefix) = p.strip_suffix('*') {
            return key.starts_with(prefix);
        }
        if let Some(suffix) = p.strip_prefix('*') {
            return key.ends_with(suffix);
        }
        key == p
    }
}

/// `trim().to_lowercase()` - the single canonicalization step DESIGN NOTES
/// §9 calls for, shared by routing lookup and alias resolution so the two
/// never diverge on casing.
pub fn canonical_model_key(model: &str) -> String {
    model.trim().to_lowercase()
}

struct Route {
    pattern: Pattern,
    adapter_name: String,
}

struct Alias {
    pattern: Pattern,
    rewrite: String,
}

/// Registers named adapters and resolves a model identifier to one of them
/// through the three-tier lookup in spec §4.1: exact match, pattern match
/// (first registration wins), then the configured fallback.
pub struct AdapterRouter {
    adapters: RwLock<HashMap<String, AdapterHandle>>,
    routes: RwLock<Vec<Route>>,
    aliases: RwLock<Vec<Alias>>,
    fallback: RwLock<Option<String>>,
}

impl Default for AdapterRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRouter {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            routes: RwLock::new(Vec::new()),
            aliases: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Registers a named adapter. Fails with [`GatewayError::InvalidArgument`]
    /// on an empty name; last registration for a given name wins.
    pub fn register_adapter(&self, name: &str, adapter: AdapterHandle) -> Result<(), GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidArgument("adapter name must not be empty".into()));
        }
        self.adapters.write().unwrap().insert(name.to_string(), adapter);
        Ok(())
    }

    /// Registers a route pattern -> adapter name. Fails with
    /// [`GatewayError::NotFound`] if the adapter is not yet registered.
    pub fn register_route(&self, pattern: &str, adapter_name: &str) -> Result<(), GatewayError> {
        if !self.adapters.read().unwrap().contains_key(adapter_name) {
            return Err(GatewayError::NotFound(format!("adapter `{adapter_name}` is not registered")));
        }
        self.routes.write().unwrap().push(Route {
            pattern: Pattern::new(pattern),
            adapter_name: adapter_name.to_string(),
        });
        Ok(())
    }

    pub fn set_fallback(&self, adapter_name: Option<&str>) {
        *self.fallback.write().unwrap() = adapter_name.map(|s| s.to_string());
    }

    /// Atomically swaps the alias table. An empty map clears all aliases.
    pub fn set_aliases(&self, aliases: HashMap<String, String>) {
        let mut table = self.aliases.write().unwrap();
        *table = aliases
            .into_iter()
            .map(|(pattern, rewrite)| Alias { pattern: Pattern::new(pattern), rewrite })
            .collect();
    }

    /// Resolves `model` to a registered adapter via exact match, then
    /// pattern match in registration order, then the fallback adapter.
    #[instrument(skip(self))]
    pub fn find_adapter(&self, model: &str) -> Result<(String, AdapterHandle), GatewayError> {
        let key = canonical_model_key(model);
        let adapters = self.adapters.read().unwrap();

        if let Some(adapter) = adapters.get(&key) {
            return Ok((key, adapter.clone()));
        }

        let routes = self.routes.read().unwrap();
        for route in routes.iter() {
            if route.pattern.matches(&key) {
                if let Some(adapter) = adapters.get(&route.adapter_name) {
                    return Ok((route.adapter_name.clone(), adapter.clone()));
                }
            }
        }
        drop(routes);

        if let Some(fallback_name) = self.fallback.read().unwrap().clone() {
            if let Some(adapter) = adapters.get(&fallback_name) {
                return Ok((fallback_name, adapter.clone()));
            }
        }

        Err(GatewayError::NotFound(format!("no adapter for model `{model}`")))
    }

    /// Rewrites `model` through the alias table. Runs *after* adapter
    /// selection: routing always uses the original identifier.
    pub fn rewrite_alias(&self, model: &str) -> String {
        let key = canonical_model_key(model);
        let aliases = self.aliases.read().unwrap();
        for alias in aliases.iter() {
            if alias.pattern.matches(&key) {
                return alias.rewrite.clone();
            }
        }
        model.to_string()
    }

    /// Resolves the adapter for `req.model`, rewrites the outbound model
    /// identifier, and returns both plus the (possibly rewritten) request.
    pub fn resolve(&self, req: &GatewayRequest) -> Result<(AdapterHandle, GatewayRequest), GatewayError> {
        let (_, adapter) = self.find_adapter(&req.model)?;
        let mut outbound = req.clone();
        outbound.model = self.rewrite_alias(&req.model);
        Ok((adapter, outbound))
    }
}

/// Converts the canonical envelope into the teacher's `ChatMessage` wire
/// shape so it can be handed to an [`LLMProvider`]. System text is folded
/// into a leading user message (the adapter trait has no system role of
/// its own); tool messages become `MessageType::ToolResult`.
pub fn to_chat_messages(req: &GatewayRequest) -> Vec<ChatMessage> {
    use crate::dialect::Role;
    let mut out = Vec::new();
    for m in &req.messages {
        let role = match m.role {
            Role::Assistant => ChatRole::Assistant,
            _ => ChatRole::User,
        };
        let message_type = if let Some(calls) = &m.tool_calls {
            MessageType::ToolUse(calls.clone())
        } else if m.role == Role::Tool {
            MessageType::ToolResult(vec![ToolCall {
                id: m.tool_call_id.clone().unwrap_or_default(),
                call_type: "function".into(),
                function: crate::FunctionCall { name: String::new(), arguments: m.content.as_text() },
            }])
        } else {
            MessageType::Text
        };
        let prefix = if m.role == Role::System { "[system] " } else { "" };
        out.push(ChatMessage {
            role,
            message_type,
            content: format!("{prefix}{}", m.content.as_text()),
        });
    }
    out
}

/// Adapts a tool list into `Tool`s for the `LLMProvider::chat_with_tools`
/// call.
pub fn to_provider_tools(req: &GatewayRequest) -> Vec<Tool> {
    req.tools
        .iter()
        .map(|t| Tool {
            tool_type: "function".into(),
            function: crate::chat::FunctionTool {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Failure class used by the Fallback Wrapper's retry/abort policy table
/// (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RetrySameAdapter,
    AbortTryNext,
}

/// Classifies an adapter error by case-insensitive substring match on its
/// message, per the spec's failure taxonomy table. No error-code typing is
/// assumed since adapters surface arbitrary upstream text.
pub fn classify_failure(err: &LLMError) -> FailureClass {
    let msg = err.to_string().to_lowercase();
    const RETRY_SUBSTRINGS: &[&str] = &[
        "timeout", "connection reset", "connection-reset", "no such host", "no-host",
        "temporary", "deadline", "429", "rate limit", "rate-limit", "too many requests",
        "too-many-requests", "5xx", "bad gateway", "bad-gateway", "unavailable",
        "gateway timeout", "gateway-timeout", "502", "503", "504",
    ];
    if RETRY_SUBSTRINGS.iter().any(|s| msg.contains(s)) {
        return FailureClass::RetrySameAdapter;
    }
    FailureClass::AbortTryNext
}

/// Wraps an ordered list of adapters with retry-then-cascade policy (spec
/// §4.2). Implements [`LLMProvider`] itself so it slots into
/// [`AdapterRouter`] as just another adapter.
pub struct FallbackAdapter {
    adapters: Vec<AdapterHandle>,
    retry_count: u32,
    retry_delay: Duration,
}

impl FallbackAdapter {
    pub fn new(adapters: Vec<AdapterHandle>, retry_count: u32, retry_delay: Duration) -> Self {
        Self { adapters, retry_count, retry_delay }
    }

    async fn chat_with_cascade(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn crate::chat::ChatResponse>, LLMError> {
        let mut last_err: Option<LLMError> = None;
        let mut attempts = 0u32;
        for (idx, adapter) in self.adapters.iter().enumerate() {
            for attempt in 0..=self.retry_count {
                attempts += 1;
                match adapter.chat_with_tools(messages, tools).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        let class = classify_failure(&e);
                        debug!(adapter = idx, attempt, ?class, error = %e, "adapter attempt failed");
                        last_err = Some(e);
                        if class == FailureClass::RetrySameAdapter && attempt < self.retry_count {
                            tokio::time::sleep(self.retry_delay).await;
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        Err(LLMError::ProviderError(format!(
            "all {} adapter(s) exhausted after {} attempt(s); last error: {}",
            self.adapters.len(),
            attempts,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into()),
        )))
    }

    /// Streaming cascade: unlike the buffered path, a failure after the
    /// first chunk has already reached the client can't be retried
    /// transparently, so only the *connect* attempt (the `chat_stream_with_
    /// tools` call itself) is retried/cascaded; once a stream is open its
    /// errors surface as `StreamChunk`-channel errors to the caller.
    async fn chat_stream_with_cascade(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<ChatStream, LLMError> {
        let mut last_err: Option<LLMError> = None;
        for (idx, adapter) in self.adapters.iter().enumerate() {
            if !adapter.supports_streaming() {
                continue;
            }
            for attempt in 0..=self.retry_count {
                match adapter.chat_stream_with_tools(messages, tools).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        let class = classify_failure(&e);
                        debug!(adapter = idx, attempt, ?class, error = %e, "adapter stream connect failed");
                        last_err = Some(e);
                        if class == FailureClass::RetrySameAdapter && attempt < self.retry_count {
                            tokio::time::sleep(self.retry_delay).await;
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            LLMError::NotImplemented("no configured adapter supports streaming".into())
        }))
    }
}

#[async_trait]
impl crate::chat::ChatProvider for FallbackAdapter {
    fn supports_streaming(&self) -> bool {
        self.adapters.iter().any(|a| a.supports_streaming())
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<Box<dyn crate::chat::ChatResponse>, LLMError> {
        self.chat_with_cascade(messages, None).await
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Box<dyn crate::chat::ChatResponse>, LLMError> {
        self.chat_with_cascade(messages, tools).await
    }

    async fn chat_stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>, LLMError> {
        self.chat_stream_with_cascade(messages, tools).await
    }
}

#[async_trait]
impl crate::completion::CompletionProvider for FallbackAdapter {
    async fn complete(
        &self,
        req: &crate::completion::CompletionRequest,
    ) -> Result<crate::completion::CompletionResponse, LLMError> {
        let mut last_err: Option<LLMError> = None;
        for adapter in &self.adapters {
            match adapter.complete(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| LLMError::ProviderError("no adapters configured".into())))
    }
}

#[async_trait]
impl crate::embedding::EmbeddingProvider for FallbackAdapter {
    async fn embed(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>, LLMError> {
        let mut last_err: Option<LLMError> = None;
        for adapter in &self.adapters {
            match adapter.embed(input.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| LLMError::ProviderError("no adapters configured".into())))
    }
}

#[async_trait]
impl LLMProvider for FallbackAdapter {
    fn tools(&self) -> Option<&[Tool]> {
        None
    }
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatProvider, ChatResponse, FinishReason};
    use crate::completion::CompletionProvider;
    use crate::embedding::EmbeddingProvider;
    use crate::completion::{CompletionRequest, CompletionResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct DummyResponse(String);
    impl std::fmt::Display for DummyResponse {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl ChatResponse for DummyResponse {
        fn text(&self) -> Option<String> { Some(self.0.clone()) }
        fn tool_calls(&self) -> Option<Vec<ToolCall>> { None }
        fn finish_reason(&self) -> Option<FinishReason> { Some(FinishReason::Stop) }
        fn usage(&self) -> Option<crate::Usage> { None }
    }

    struct StubAdapter {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail_times: usize,
        fail_message: &'static str,
    }

    #[async_trait]
    impl ChatProvider for StubAdapter {
        async fn chat_with_tools(&self, _messages: &[ChatMessage], _tools: Option<&[Tool]>) -> Result<Box<dyn ChatResponse>, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(LLMError::ProviderError(self.fail_message.to_string()));
            }
            Ok(Box::new(DummyResponse(self.name.to_string())))
        }
    }

    #[async_trait]
    impl CompletionProvider for StubAdapter {
        async fn complete(&self, _req: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubAdapter {
        async fn embed(&self, _input: Vec<String>) -> Result<Vec<Vec<f32>>, LLMError> {
            unimplemented!()
        }
    }

    impl LLMProvider for StubAdapter {}

    #[test]
    fn pattern_matching_supports_all_four_grammars() {
        assert!(Pattern::new("gpt-4o").matches("gpt-4o"));
        assert!(Pattern::new("gpt-*").matches("gpt-4o-mini"));
        assert!(!Pattern::new("gpt-*").matches("claude-3"));
        assert!(Pattern::new("*-mini").matches("gpt-4o-mini"));
        assert!(Pattern::new("*haiku*").matches("claude-3-5-haiku-20241022"));
    }

    #[test]
    fn scenario_1_router_alias_fallthrough() {
        let router = AdapterRouter::new();
        router.register_adapter("openai", Arc::new(StubAdapter { name: "openai", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" })).unwrap();
        router.register_adapter("anthropic", Arc::new(StubAdapter { name: "anthropic", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" })).unwrap();
        router.register_route("gpt-*", "openai").unwrap();
        router.register_route("claude-*", "anthropic").unwrap();
        router.set_aliases(HashMap::from([("claude-3-haiku".to_string(), "claude-3-5-haiku-20241022".to_string())]));

        let (name, _adapter) = router.find_adapter("Claude-3-Haiku").unwrap();
        assert_eq!(name, "anthropic");
        assert_eq!(router.rewrite_alias("Claude-3-Haiku"), "claude-3-5-haiku-20241022");
    }

    #[test]
    fn last_registration_wins_and_register_route_requires_known_adapter() {
        let router = AdapterRouter::new();
        assert!(router.register_route("gpt-*", "openai").is_err());
        router.register_adapter("openai", Arc::new(StubAdapter { name: "first", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" })).unwrap();
        router.register_adapter("openai", Arc::new(StubAdapter { name: "second", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" })).unwrap();
        router.register_route("gpt-*", "openai").unwrap();
        let (_, adapter) = router.find_adapter("gpt-4o").unwrap();
        let resp = futures::executor::block_on(adapter.chat(&[])).unwrap();
        assert_eq!(resp.text().unwrap(), "second");
    }

    #[tokio::test]
    async fn scenario_2_fallback_retry_succeeds_after_two_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = Arc::new(StubAdapter { name: "primary", calls: calls.clone(), fail_times: 2, fail_message: "503 service unavailable" });
        let fallback = FallbackAdapter::new(vec![primary], 3, Duration::from_millis(10));
        let started = std::time::Instant::now();
        let resp = fallback.chat(&[]).await.unwrap();
        assert_eq!(resp.text().unwrap(), "primary");
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scenario_3_fallback_cascades_on_non_retryable_error() {
        let primary = Arc::new(StubAdapter { name: "primary", calls: Arc::new(AtomicUsize::new(0)), fail_times: usize::MAX, fail_message: "401 unauthorized" });
        let secondary = Arc::new(StubAdapter { name: "secondary", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" });
        let fallback = FallbackAdapter::new(vec![primary, secondary], 3, Duration::from_millis(1));
        let resp = fallback.chat(&[]).await.unwrap();
        assert_eq!(resp.text().unwrap(), "secondary");
    }

    struct StreamingStubAdapter {
        text: &'static str,
    }

    #[async_trait]
    impl ChatProvider for StreamingStubAdapter {
        fn supports_streaming(&self) -> bool {
            true
        }

        async fn chat_with_tools(&self, _messages: &[ChatMessage], _tools: Option<&[Tool]>) -> Result<Box<dyn ChatResponse>, LLMError> {
            Ok(Box::new(DummyResponse(self.text.to_string())))
        }

        async fn chat_stream_with_tools(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[Tool]>,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>, LLMError> {
            let text = self.text.to_string();
            Ok(Box::pin(futures::stream::once(async move { Ok(StreamChunk::Text(text)) })))
        }
    }

    #[async_trait]
    impl CompletionProvider for StreamingStubAdapter {
        async fn complete(&self, _req: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
            unimplemented!()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StreamingStubAdapter {
        async fn embed(&self, _input: Vec<String>) -> Result<Vec<Vec<f32>>, LLMError> {
            unimplemented!()
        }
    }

    impl LLMProvider for StreamingStubAdapter {}

    #[tokio::test]
    async fn fallback_streams_through_the_first_streaming_capable_adapter() {
        use futures::StreamExt;

        let non_streaming = Arc::new(StubAdapter { name: "non-streaming", calls: Arc::new(AtomicUsize::new(0)), fail_times: 0, fail_message: "" });
        let streaming = Arc::new(StreamingStubAdapter { text: "hi" });
        let fallback = FallbackAdapter::new(vec![non_streaming, streaming], 1, Duration::from_millis(1));
        assert!(fallback.supports_streaming());

        let mut stream = fallback.chat_stream(&[]).await.unwrap();
        match stream.next().await {
            Some(Ok(StreamChunk::Text(text))) => assert_eq!(text, "hi"),
            other => panic!("expected a text chunk, got {other:?}"),
        }
    }
}

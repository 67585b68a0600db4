//! The Responses provider's tool-resume session store (spec §4.6).
//!
//! Grounded directly on [`crate::session::{SessionStore, InMemorySessionStore}`]:
//! same `async_trait` shape and `Arc<Mutex<HashMap<...>>>` backing store,
//! generalized with a TTL sweep and an LRU eviction path that the plain
//! session store doesn't need.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::dialect::{GatewayMessage, GatewayRequest};
use crate::gateway_error::GatewayError;
use crate::tool_adapter::{self, LoopVerdict, ToolLoopDetector};
use crate::ToolCall;

/// Identifies one paused Responses turn. Distinct from
/// [`crate::session::SessionId`] since it's exposed on the wire as the
/// `id` clients pass to `POST /v1/responses/{id}/submit_tool_outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseId(String);

impl ResponseId {
    pub fn new() -> Self {
        Self(format!("resp_{}", uuid::Uuid::new_v4()))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The conversation accumulated across one tool-resume session: the
/// original request (for re-deriving model/temperature/etc. on resume) and
/// the running message history, extended as the model and the caller trade
/// tool calls/results.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub base_request: GatewayRequest,
    pub messages: Vec<GatewayMessage>,
}

impl Conversation {
    pub fn new(base_request: GatewayRequest) -> Self {
        let messages = base_request.messages.clone();
        Self { base_request, messages }
    }

    /// The request to replay upstream on resume: same model/params, full
    /// accumulated message history.
    pub fn resume_request(&self) -> GatewayRequest {
        let mut req = self.base_request.clone();
        req.messages = self.messages.clone();
        req
    }
}

/// One pending tool call surfaced to the client via
/// `required_action.submit_tool_outputs.tool_calls[]`.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call: ToolCall,
}

/// A paused Responses session: the conversation so far, the tool calls
/// awaiting a client result, and the loop detector carried across resumes
/// (spec §4.4, applied before every resume per §4.6 step 4).
#[derive(Debug, Clone)]
pub struct ResponsesSession {
    pub id: ResponseId,
    pub conversation: Conversation,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub loop_detector: ToolLoopDetector,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
}

impl ResponsesSession {
    fn new(id: ResponseId, base_request: GatewayRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation: Conversation::new(base_request),
            pending_tool_calls: Vec::new(),
            loop_detector: ToolLoopDetector::new(),
            created_at: now,
            last_touched: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponsesSessionError {
    #[error("response session not found: {0}")]
    NotFound(String),
    #[error("tool call id `{0}` is not pending on this response")]
    UnknownToolCallId(String),
}

/// Outcome of submitting tool outputs: either the conversation is ready to
/// resume upstream, or the duplicate-tool-call detector intervened.
pub enum ResumeOutcome {
    Ready(GatewayRequest),
    Warn(GatewayRequest, &'static str),
    Reject(GatewayError),
}

struct StoreState {
    sessions: HashMap<ResponseId, ResponsesSession>,
    /// Most-recently-touched at the back; front is the next eviction
    /// candidate once `max_sessions` is exceeded.
    lru: VecDeque<ResponseId>,
}

/// Per-process tool-resume session store, sharded behind one mutex
/// (spec §5: "per-conversation session state is sharded by `response_id`").
pub struct ResponsesSessionStore {
    state: Arc<Mutex<StoreState>>,
    ttl: Duration,
    max_sessions: usize,
}

impl ResponsesSessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState { sessions: HashMap::new(), lru: VecDeque::new() })),
            ttl,
            max_sessions,
        }
    }

    /// Spawns the background TTL sweeper. The returned handle is detached;
    /// callers that want a clean shutdown should abort it explicitly.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                this.sweep_expired().await;
            }
        })
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let ttl = self.ttl;
        let expired: Vec<ResponseId> = state
            .sessions
            .values()
            .filter(|s| now.signed_duration_since(s.last_touched).to_std().map(|d| d >= ttl).unwrap_or(false))
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            state.sessions.remove(&id);
            state.lru.retain(|x| x != &id);
            debug!(response_id = %id, "responses session expired");
        }
    }

    fn touch(state: &mut StoreState, id: &ResponseId) {
        state.lru.retain(|x| x != id);
        state.lru.push_back(id.clone());
    }

    fn evict_if_over_capacity(state: &mut StoreState) {
        while state.sessions.len() > state.max_sessions {
            let Some(oldest) = state.lru.pop_front() else { break };
            state.sessions.remove(&oldest);
            warn!(response_id = %oldest, "evicted responses session (LRU, over capacity)");
        }
    }

    /// Mints a fresh session for a new streamed turn (spec §4.6 step 1).
    pub async fn create(&self, base_request: GatewayRequest) -> ResponseId {
        let id = ResponseId::new();
        let session = ResponsesSession::new(id.clone(), base_request);
        let mut state = self.state.lock().await;
        state.sessions.insert(id.clone(), session);
        Self::touch(&mut state, &id);
        Self::evict_if_over_capacity(&mut state);
        id
    }

    /// Records that the model paused on tool calls (spec §4.6 step 2).
    pub async fn pause_on_tool_calls(
        &self,
        id: &ResponseId,
        assistant_message: GatewayMessage,
        calls: Vec<ToolCall>,
    ) -> Result<(), ResponsesSessionError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| ResponsesSessionError::NotFound(id.to_string()))?;
        session.conversation.messages.push(assistant_message);
        session.pending_tool_calls = calls.into_iter().map(|call| PendingToolCall { call }).collect();
        session.last_touched = Utc::now();
        Self::touch(&mut state, id);
        Ok(())
    }

    /// Validates the submitted `(tool_call_id, output)` pairs against the
    /// pending set, appends tool-result messages, runs the duplicate-call
    /// detector, and returns the request to replay upstream (spec §4.6
    /// steps 3-4).
    pub async fn submit_tool_outputs(
        &self,
        id: &ResponseId,
        outputs: Vec<(String, String)>,
    ) -> Result<ResumeOutcome, ResponsesSessionError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| ResponsesSessionError::NotFound(id.to_string()))?;

        for (call_id, _) in &outputs {
            if !session.pending_tool_calls.iter().any(|p| &p.call.id == call_id) {
                return Err(ResponsesSessionError::UnknownToolCallId(call_id.clone()));
            }
        }

        let mut verdict = LoopVerdict::Ok;
        for (call_id, output) in &outputs {
            let pending = session
                .pending_tool_calls
                .iter()
                .find(|p| &p.call.id == call_id)
                .expect("validated above");
            let this_verdict = session
                .loop_detector
                .observe(&pending.call.function.name, &pending.call.function.arguments);
            if matches!(this_verdict, LoopVerdict::Reject) {
                verdict = LoopVerdict::Reject;
                break;
            }
            if matches!(this_verdict, LoopVerdict::Warn(_)) {
                verdict = this_verdict;
            }
            session.conversation.messages.push(GatewayMessage {
                role: crate::dialect::Role::Tool,
                content: crate::dialect::MessageContent::Text(output.clone()),
                tool_call_id: Some(call_id.clone()),
                tool_calls: None,
                cache_control: None,
            });
        }

        if let LoopVerdict::Reject = verdict {
            let name = session
                .pending_tool_calls
                .first()
                .map(|p| p.call.function.name.clone())
                .unwrap_or_default();
            return Ok(ResumeOutcome::Reject(tool_adapter::loop_error(&name)));
        }

        session.pending_tool_calls.clear();
        session.last_touched = Utc::now();
        let resume_request = session.conversation.resume_request();
        Self::touch(&mut state, id);

        Ok(match verdict {
            LoopVerdict::Warn(msg) => ResumeOutcome::Warn(resume_request, msg),
            _ => ResumeOutcome::Ready(resume_request),
        })
    }

    /// Destroys a session on completion or cancellation (spec §4.6: "session
    /// lifecycle ... destroyed on completion, cancellation, TTL expiry, or
    /// cap eviction").
    pub async fn destroy(&self, id: &ResponseId) {
        let mut state = self.state.lock().await;
        state.sessions.remove(id);
        state.lru.retain(|x| x != id);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{GatewayMessage as GM, GatewayRequest as GR};
    use crate::FunctionCall;

    fn base_request() -> GR {
        GR {
            model: "gpt-4o".into(),
            messages: vec![GM::user("hi")],
            tools: vec![],
            tool_choice: None,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            stop: vec![],
            stream: true,
            reasoning_effort: None,
            thinking: None,
            parallel_tool_calls: None,
            user: None,
        }
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall { name: name.into(), arguments: args.into() },
        }
    }

    #[tokio::test]
    async fn create_pause_and_resume_round_trip() {
        let store = ResponsesSessionStore::new(Duration::from_secs(300), 100);
        let id = store.create(base_request()).await;
        store
            .pause_on_tool_calls(&id, GM::assistant_text(""), vec![call("call_1", "shell", r#"{"cmd":"ls"}"#)])
            .await
            .unwrap();

        let outcome = store.submit_tool_outputs(&id, vec![("call_1".into(), "file.txt".into())]).await.unwrap();
        match outcome {
            ResumeOutcome::Ready(req) => {
                assert!(req.messages.iter().any(|m| m.tool_call_id.as_deref() == Some("call_1")));
            }
            _ => panic!("expected Ready"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_call_id_is_rejected() {
        let store = ResponsesSessionStore::new(Duration::from_secs(300), 100);
        let id = store.create(base_request()).await;
        store
            .pause_on_tool_calls(&id, GM::assistant_text(""), vec![call("call_1", "shell", "{}")])
            .await
            .unwrap();
        let err = store.submit_tool_outputs(&id, vec![("bogus".into(), "x".into())]).await.unwrap_err();
        assert!(matches!(err, ResponsesSessionError::UnknownToolCallId(_)));
    }

    #[tokio::test]
    async fn repeated_identical_tool_calls_trip_the_loop_detector() {
        let store = ResponsesSessionStore::new(Duration::from_secs(300), 100);
        let id = store.create(base_request()).await;
        for i in 0..5 {
            store
                .pause_on_tool_calls(&id, GM::assistant_text(""), vec![call(&format!("call_{i}"), "shell", r#"{"cmd":"ls"}"#)])
                .await
                .unwrap();
            let outcome = store.submit_tool_outputs(&id, vec![(format!("call_{i}"), "out".into())]).await.unwrap();
            if i == 4 {
                assert!(matches!(outcome, ResumeOutcome::Reject(_)));
            }
        }
    }

    #[tokio::test]
    async fn lru_eviction_respects_capacity() {
        let store = ResponsesSessionStore::new(Duration::from_secs(300), 2);
        let _a = store.create(base_request()).await;
        let _b = store.create(base_request()).await;
        let _c = store.create(base_request()).await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn ttl_sweep_removes_stale_sessions() {
        let store = Arc::new(ResponsesSessionStore::new(Duration::from_millis(10), 100));
        let _id = store.create(base_request()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.sweep_expired().await;
        assert_eq!(store.len().await, 0);
    }
}

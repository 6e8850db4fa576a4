//! Mock implementations for testing
//!
//! These mocks enable whole-turn testing without a model, a database or a
//! query backend.

use super::driver::{ConversationService, ServiceConfig};
use super::traits::CheckpointStore;
use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, LlmService, Usage};
use crate::query::{Pipeline, QueryError, QueryExecutor};
use crate::state_machine::SessionState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock LLM Service
// ============================================================================

/// Mock LLM service that returns queued responses in order
#[allow(dead_code)]
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    /// Record of all requests made
    requests: Mutex<Vec<LlmRequest>>,
    next_call_id: AtomicUsize,
}

#[allow(dead_code)]
impl MockLlmService {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            next_call_id: AtomicUsize::new(1),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a plain text reply
    pub fn queue_text(&self, text: impl Into<String>) {
        self.queue_response(response(vec![ContentBlock::text(text)]));
    }

    /// Queue a reply that requests one tool call, with optional leading text
    pub fn queue_tool_call(&self, text: impl Into<String>, name: &str, input: Value) {
        let id = format!("call_{}", self.next_call_id.fetch_add(1, Ordering::SeqCst));
        let text = text.into();
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
        content.push(ContentBlock::tool_use(id, name, input));
        self.queue_response(response(content));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

fn response(content: Vec<ContentBlock>) -> LlmResponse {
    LlmResponse {
        content,
        end_turn: true,
        usage: Usage::default(),
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.next(request)
    }

    fn model_id(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// Delayed Mock LLM Service (for timeout and locking tests)
// ============================================================================

/// Mock LLM service that sleeps before every reply
pub struct DelayedMockLlmService {
    inner: MockLlmService,
    delay: Duration,
}

#[allow(dead_code)]
impl DelayedMockLlmService {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MockLlmService::new(),
            delay,
        }
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.inner.queue_text(text);
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.inner.requests()
    }
}

#[async_trait]
impl LlmService for DelayedMockLlmService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        tokio::time::sleep(self.delay).await;
        self.inner.next(request)
    }

    fn model_id(&self) -> &str {
        "mock-delayed"
    }
}

// ============================================================================
// Mock Query Executor
// ============================================================================

/// Query executor with queued results. Runs past the queue return no rows.
#[allow(dead_code)]
pub struct MockQueryExecutor {
    results: Mutex<VecDeque<Result<Vec<Value>, QueryError>>>,
    runs: AtomicUsize,
}

#[allow(dead_code)]
impl MockQueryExecutor {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn queue_rows(&self, rows: Vec<Value>) {
        self.results.lock().unwrap().push_back(Ok(rows));
    }

    pub fn queue_error(&self, error: QueryError) {
        self.results.lock().unwrap().push_back(Err(error));
    }

    /// Number of pipelines run so far
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Default for MockQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for MockQueryExecutor {
    async fn run(&self, _pipeline: &Pipeline) -> Result<Vec<Value>, QueryError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// In-Memory Checkpoint Store
// ============================================================================

/// In-memory checkpoint store for testing
#[allow(dead_code)]
pub struct InMemoryCheckpointStore {
    states: Mutex<HashMap<String, SessionState>>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
}

#[allow(dead_code)]
impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Store a state directly, bypassing the write counter
    pub fn seed(&self, thread_id: &str, state: SessionState) {
        self.states
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), state);
    }

    pub fn state(&self, thread_id: &str) -> Option<SessionState> {
        self.states.lock().unwrap().get(thread_id).cloned()
    }

    /// Number of successful writes
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make every later write fail
    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<SessionState>, String> {
        Ok(self.state(thread_id))
    }

    async fn put(&self, thread_id: &str, state: &SessionState) -> Result<(), String> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err("checkpoint store unavailable".to_string());
        }
        self.states
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), state.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Test Service Builder
// ============================================================================

/// A conversation service wired to mocks, with handles to each mock
pub struct TestService {
    pub service: ConversationService,
    pub llm: Arc<MockLlmService>,
    pub executor: Arc<MockQueryExecutor>,
    pub store: Arc<InMemoryCheckpointStore>,
}

/// Builder for [`TestService`]
#[allow(dead_code)]
pub struct TestServiceBuilder {
    config: ServiceConfig,
    llm_override: Option<Arc<dyn LlmService>>,
    executor_override: Option<Arc<dyn QueryExecutor>>,
}

#[allow(dead_code, clippy::new_ret_no_self)]
impl TestService {
    pub fn new() -> TestServiceBuilder {
        TestServiceBuilder {
            config: ServiceConfig::default(),
            llm_override: None,
            executor_override: None,
        }
    }
}

#[allow(dead_code)]
impl TestServiceBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this model instead of the queued mock
    pub fn llm(mut self, llm: Arc<dyn LlmService>) -> Self {
        self.llm_override = Some(llm);
        self
    }

    /// Use this executor instead of the queued mock
    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor_override = Some(executor);
        self
    }

    pub fn build(self) -> TestService {
        let llm = Arc::new(MockLlmService::new());
        let executor = Arc::new(MockQueryExecutor::new());
        let store = Arc::new(InMemoryCheckpointStore::new());

        let service = ConversationService::new(
            self.llm_override
                .unwrap_or_else(|| llm.clone() as Arc<dyn LlmService>),
            self.executor_override
                .unwrap_or_else(|| executor.clone() as Arc<dyn QueryExecutor>),
            store.clone(),
            self.config,
        );

        TestService {
            service,
            llm,
            executor,
            store,
        }
    }
}

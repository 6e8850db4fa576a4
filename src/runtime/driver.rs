//! Conversation driver: one user message in, one reply out

use super::traits::CheckpointStore;
use crate::llm::{LlmError, LlmService};
use crate::query::QueryExecutor;
use crate::stages::{Stage, StageConfig, StageError, StageSet};
use crate::state_machine::{next_stage, DecisionPoint, Message, Route, SessionState, StageId};
use crate::tools::YearBounds;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Reply when a turn produced no assistant message
pub const EMPTY_REPLY: &str = "I'm sorry, I don't have a response for that.";

/// Reply when validation keeps rejecting regenerated queries
pub const RETRY_LIMIT_REPLY: &str =
    "I'm sorry, I wasn't able to produce a valid query for your request. Could you rephrase it?";

/// Reply when a turn runs more stages than allowed
pub const STEP_LIMIT_REPLY: &str =
    "I'm sorry, I wasn't able to finish working on your request. Could you try asking again?";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("model call failed: {0}")]
    Llm(LlmError),

    #[error("checkpoint store failed: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Stage(StageError),

    #[error("turn did not finish within {0:?}")]
    Timeout(Duration),
}

impl From<StageError> for TurnError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::Llm(e) => TurnError::Llm(e),
            other => TurnError::Stage(other),
        }
    }
}

/// Limits applied to every turn
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub bounds: YearBounds,
    /// Validated generations allowed in one turn; the turn apologises once
    /// this many have been rejected
    pub max_validation_attempts: usize,
    pub max_tool_rounds: usize,
    /// Stage executions allowed in one turn
    pub max_stage_steps: usize,
    pub turn_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bounds: YearBounds::default(),
            max_validation_attempts: 3,
            max_tool_rounds: 5,
            max_stage_steps: 25,
            turn_timeout: Duration::from_secs(120),
        }
    }
}

impl ServiceConfig {
    /// Read `PENNY_*` overrides; unparseable values keep the default
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bounds: YearBounds::new(
                env_or("PENNY_MIN_YEAR", defaults.bounds.min),
                env_or("PENNY_MAX_YEAR", defaults.bounds.max),
            ),
            max_validation_attempts: env_or(
                "PENNY_MAX_VALIDATION_ATTEMPTS",
                defaults.max_validation_attempts,
            ),
            max_tool_rounds: env_or("PENNY_MAX_TOOL_ROUNDS", defaults.max_tool_rounds),
            max_stage_steps: env_or("PENNY_MAX_STAGE_STEPS", defaults.max_stage_steps),
            turn_timeout: Duration::from_secs(env_or(
                "PENNY_TURN_TIMEOUT_SECS",
                defaults.turn_timeout.as_secs(),
            )),
        }
    }

    fn stage_config(&self) -> StageConfig {
        StageConfig {
            bounds: self.bounds,
            max_tool_rounds: self.max_tool_rounds,
        }
    }
}

fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(var = name, value = %raw, "Ignoring unparseable setting");
        default
    })
}

/// Runs turns against the stage machine and the checkpoint store.
///
/// Turns on the same thread are serialized; different threads run
/// concurrently.
pub struct ConversationService {
    stages: StageSet,
    store: Arc<dyn CheckpointStore>,
    config: ServiceConfig,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationService {
    pub fn new(
        llm: Arc<dyn LlmService>,
        executor: Arc<dyn QueryExecutor>,
        store: Arc<dyn CheckpointStore>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            stages: StageSet::new(llm, executor, config.stage_config()),
            store,
            config,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process one user message and return the reply for this turn.
    ///
    /// On any error, including the timeout, the stored checkpoint is left as
    /// it was before the turn.
    pub async fn respond(&self, user_message: &str, thread_id: &str) -> Result<String, TurnError> {
        let user_message = user_message.trim();
        let thread_id = thread_id.trim();
        if user_message.is_empty() {
            return Err(TurnError::InvalidInput("user_message must not be empty"));
        }
        if thread_id.is_empty() {
            return Err(TurnError::InvalidInput("thread_id must not be empty"));
        }

        let lock = self.thread_lock(thread_id).await;
        let guard = lock.lock().await;

        let result = tokio::time::timeout(
            self.config.turn_timeout,
            self.run_turn(thread_id, user_message),
        )
        .await
        .unwrap_or_else(|_| {
            tracing::warn!(
                thread_id = %thread_id,
                timeout_secs = self.config.turn_timeout.as_secs(),
                "Turn timed out"
            );
            Err(TurnError::Timeout(self.config.turn_timeout))
        });

        drop(guard);
        drop(lock);
        self.release_idle_locks().await;
        result
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    async fn release_idle_locks(&self) {
        let mut locks = self.thread_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn run_turn(&self, thread_id: &str, user_message: &str) -> Result<String, TurnError> {
        let stored = self
            .store
            .get(thread_id)
            .await
            .map_err(TurnError::Checkpoint)?;
        let resumed = stored.is_some();
        let state = stored.unwrap_or_default();
        let turn_start = state.messages.len();

        tracing::info!(
            thread_id = %thread_id,
            resumed,
            route = ?state.current_route,
            "Turn started"
        );

        let state = self
            .route_turn(thread_id, state.with_message(Message::user(user_message)))
            .await?;

        self.store
            .put(thread_id, &state)
            .await
            .map_err(TurnError::Checkpoint)?;

        let reply = state.last_reply_since(turn_start).unwrap_or(EMPTY_REPLY);
        tracing::info!(
            thread_id = %thread_id,
            route = ?state.current_route,
            messages = state.messages.len(),
            "Turn finished"
        );
        Ok(reply.to_string())
    }

    /// Alternate routing decisions and stage runs until the router says stop
    async fn route_turn(
        &self,
        thread_id: &str,
        mut state: SessionState,
    ) -> Result<SessionState, TurnError> {
        let mut point = DecisionPoint::Entry;
        let mut steps = 0;
        let mut rejections = 0;

        while let Route::Stage(stage) = next_stage(point, &state) {
            tracing::debug!(thread_id = %thread_id, ?point, next = %stage, "Routing decision");

            if steps >= self.config.max_stage_steps {
                tracing::warn!(
                    thread_id = %thread_id,
                    max_stage_steps = self.config.max_stage_steps,
                    "Stage step limit reached"
                );
                return Ok(state.with_message(Message::assistant(stage, STEP_LIMIT_REPLY)));
            }
            steps += 1;

            let runner = self.stages.get(stage);
            tracing::info!(thread_id = %thread_id, stage = %runner.id(), "Running stage");
            state = runner.run(thread_id, state).await?;
            point = DecisionPoint::After(stage);

            if stage == StageId::Validation && !state.query_correct {
                rejections += 1;
                if rejections >= self.config.max_validation_attempts.max(1) {
                    tracing::warn!(
                        thread_id = %thread_id,
                        rejections,
                        "Validation attempt limit reached"
                    );
                    return Ok(state.with_message(Message::assistant(
                        StageId::Validation,
                        RETRY_LIMIT_REPLY,
                    )));
                }
            }
        }

        tracing::debug!(thread_id = %thread_id, ?point, steps, "Routing reached terminal");
        Ok(state)
    }
}

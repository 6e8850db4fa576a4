//! Stage executors
//!
//! Each stage takes ownership of the session state, talks to its collaborator
//! and hands back the updated state. Routing between stages lives in
//! `state_machine::transition`; stages never pick their successor.

mod analytics;
mod execution;
mod greeting;
mod tool_loop;
mod validation;

pub use analytics::AnalyticsStage;
pub use execution::ExecutionStage;
pub use greeting::GreetingStage;
pub use tool_loop::ToolLoop;
pub use validation::ValidationStage;

use crate::llm::{LlmError, LlmService};
use crate::query::QueryExecutor;
use crate::state_machine::{SessionState, StageId};
use crate::tools::YearBounds;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Fatal stage failures. Recoverable problems (bad query, out-of-range
/// request, rejected validation) are reported in the transcript instead.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("could not decode {what} reply: {source}")]
    Structured {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} stage ran without a generated query")]
    MissingQuery(StageId),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(&self, thread_id: &str, state: SessionState) -> Result<SessionState, StageError>;
}

/// Limits and bounds shared by the stages
#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub bounds: YearBounds,
    /// Upper bound on model calls inside one tool-loop run
    pub max_tool_rounds: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            bounds: YearBounds::default(),
            max_tool_rounds: 5,
        }
    }
}

/// The four stages, built once and shared by every turn
pub struct StageSet {
    greeting: GreetingStage,
    analytics: AnalyticsStage,
    validation: ValidationStage,
    execution: ExecutionStage,
}

impl StageSet {
    pub fn new(
        llm: Arc<dyn LlmService>,
        executor: Arc<dyn QueryExecutor>,
        config: StageConfig,
    ) -> Self {
        Self {
            greeting: GreetingStage::new(llm.clone(), config),
            analytics: AnalyticsStage::new(llm.clone(), config),
            validation: ValidationStage::new(llm),
            execution: ExecutionStage::new(executor),
        }
    }

    pub fn get(&self, id: StageId) -> &dyn Stage {
        match id {
            StageId::Greeting => &self.greeting,
            StageId::Analytics => &self.analytics,
            StageId::Validation => &self.validation,
            StageId::Execution => &self.execution,
        }
    }
}

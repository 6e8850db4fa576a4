//! Analytics stage - turns data questions into a generated query

use super::{Stage, StageConfig, StageError, ToolLoop};
use crate::llm::LlmService;
use crate::state_machine::{Message, Role, SessionState, StageId};
use crate::system_prompt;
use crate::tools::{ToolRegistry, YearBounds};
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;

pub struct AnalyticsStage {
    tool_loop: ToolLoop,
    bounds: YearBounds,
}

impl AnalyticsStage {
    pub fn new(llm: Arc<dyn LlmService>, config: StageConfig) -> Self {
        Self {
            tool_loop: ToolLoop::new(
                StageId::Analytics,
                ToolRegistry::analytics(),
                llm,
                config.bounds,
            )
            .max_rounds(config.max_tool_rounds),
            bounds: config.bounds,
        }
    }
}

#[async_trait]
impl Stage for AnalyticsStage {
    fn id(&self) -> StageId {
        StageId::Analytics
    }

    async fn run(&self, thread_id: &str, state: SessionState) -> Result<SessionState, StageError> {
        if let Some(text) = state.latest_user_text() {
            if let Err(explanation) = self.bounds.check(text) {
                tracing::info!(
                    thread_id = %thread_id,
                    years = ?self.bounds.out_of_range(text),
                    "Request outside the year range, skipping query generation"
                );
                return Ok(state.with_message(Message::assistant(StageId::Analytics, explanation)));
            }
        }

        let system = system_prompt::analytics(self.bounds, Local::now().date_naive());
        let state = self.tool_loop.run(&system, thread_id, state).await?;

        // A rejected tool call is not sent back to the model; tell the user directly
        let rejection = state
            .messages
            .last()
            .filter(|m| m.role == Role::Tool && m.is_error)
            .map(|m| m.content.clone());

        Ok(match rejection {
            Some(text) => state.with_message(Message::assistant(StageId::Analytics, text)),
            None => state,
        })
    }
}

//! Greeting stage - welcomes the user and hands data requests to Analytics

use super::{Stage, StageConfig, StageError, ToolLoop};
use crate::llm::LlmService;
use crate::state_machine::{SessionState, StageId};
use crate::system_prompt;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use std::sync::Arc;

pub struct GreetingStage {
    tool_loop: ToolLoop,
    system: String,
}

impl GreetingStage {
    pub fn new(llm: Arc<dyn LlmService>, config: StageConfig) -> Self {
        Self {
            tool_loop: ToolLoop::new(
                StageId::Greeting,
                ToolRegistry::greeting(),
                llm,
                config.bounds,
            )
            .max_rounds(config.max_tool_rounds),
            system: system_prompt::greeting(),
        }
    }
}

#[async_trait]
impl Stage for GreetingStage {
    fn id(&self) -> StageId {
        StageId::Greeting
    }

    async fn run(&self, thread_id: &str, state: SessionState) -> Result<SessionState, StageError> {
        self.tool_loop.run(&self.system, thread_id, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockLlmService;
    use crate::state_machine::Message;
    use serde_json::json;

    #[tokio::test]
    async fn test_redirect_sets_route() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_tool_call(
            "Sure! Let me connect you to our analytics assistant for that.",
            "redirect",
            json!({"next_agent": "Analytics_Agent"}),
        );
        let stage = GreetingStage::new(llm.clone(), StageConfig::default());

        let state = SessionState::default().with_message(Message::user("How many orders in 2013?"));
        let state = stage.run("t1", state).await.unwrap();

        assert_eq!(state.current_route, Some(StageId::Analytics));
        assert!(llm.requests()[0].system[0].text.contains("Penny"));
    }

    #[tokio::test]
    async fn test_small_talk_leaves_route_empty() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_text("Hello! Welcome to the Procurement Chatbot. How can I assist you today?");
        let stage = GreetingStage::new(llm, StageConfig::default());

        let state = stage
            .run("t1", SessionState::default().with_message(Message::user("Hello")))
            .await
            .unwrap();

        assert_eq!(state.current_route, None);
        assert_eq!(
            state.last_reply_since(0),
            Some("Hello! Welcome to the Procurement Chatbot. How can I assist you today?")
        );
    }
}

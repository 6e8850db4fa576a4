//! Bounded tool-invocation loop shared by the conversational stages

use super::StageError;
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, LlmResponse, LlmService, MessageRole};
use crate::state_machine::{Message, Role, SessionState, StageId, StatePatch, ToolCall};
use crate::tools::{ToolContext, ToolRegistry, YearBounds};
use std::sync::Arc;

/// Calls the model with the transcript, runs requested tools, and optionally
/// goes back to the model with their results.
pub struct ToolLoop {
    stage: StageId,
    tools: ToolRegistry,
    llm: Arc<dyn LlmService>,
    bounds: YearBounds,
    call_after_tool: bool,
    max_rounds: usize,
}

impl ToolLoop {
    pub fn new(
        stage: StageId,
        tools: ToolRegistry,
        llm: Arc<dyn LlmService>,
        bounds: YearBounds,
    ) -> Self {
        Self {
            stage,
            tools,
            llm,
            bounds,
            call_after_tool: false,
            max_rounds: 5,
        }
    }

    #[must_use]
    #[allow(dead_code)] // Both conversational stages end on the tool result
    pub fn call_after_tool(mut self, enabled: bool) -> Self {
        self.call_after_tool = enabled;
        self
    }

    #[must_use]
    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub async fn run(
        &self,
        system: &str,
        thread_id: &str,
        mut state: SessionState,
    ) -> Result<SessionState, StageError> {
        let ctx = ToolContext::new(thread_id, self.bounds, self.llm.clone());

        for round in 1..=self.max_rounds {
            let request = LlmRequest::new(system)
                .with_messages(build_history(&state.messages))
                .with_tools(self.tools.definitions());

            let response = self.llm.complete(&request).await?;
            let calls = tool_calls(&response);

            tracing::debug!(
                thread_id = %thread_id,
                stage = %self.stage,
                round,
                tool_calls = calls.len(),
                "Model responded"
            );

            state = state.with_message(
                Message::assistant(self.stage, response.text()).with_tool_calls(calls.clone()),
            );

            if calls.is_empty() {
                return Ok(state);
            }

            state = self.run_tools(&calls, &ctx, state).await?;

            if !self.call_after_tool {
                return Ok(state);
            }
        }

        tracing::warn!(
            thread_id = %thread_id,
            stage = %self.stage,
            max_rounds = self.max_rounds,
            "Tool loop hit its round limit"
        );
        Ok(state)
    }

    /// Execute one batch of calls in order. Patches merge so that a later call
    /// wins on conflicting keys.
    async fn run_tools(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        mut state: SessionState,
    ) -> Result<SessionState, StageError> {
        let mut patch = StatePatch::default();

        for call in calls {
            tracing::info!(
                thread_id = %ctx.thread_id,
                stage = %self.stage,
                tool = %call.name,
                "Executing tool"
            );

            let message = match self.tools.execute(&call.name, call.arguments.clone(), ctx).await {
                Some(result) => {
                    let output = result?;
                    if !output.success {
                        tracing::info!(
                            tool = %call.name,
                            output = %output.output,
                            "Tool reported failure"
                        );
                    }
                    patch = patch.merge(output.patch);
                    Message::tool_result(call, output.output, !output.success)
                }
                None => {
                    tracing::warn!(
                        tool = %call.name,
                        stage = %self.stage,
                        "Model requested an undeclared tool"
                    );
                    Message::tool_result(call, format!("Unknown tool: {}", call.name), true)
                }
            };
            state = state.with_message(message);
        }

        Ok(state.apply(patch))
    }
}

fn tool_calls(response: &LlmResponse) -> Vec<ToolCall> {
    response
        .tool_uses()
        .into_iter()
        .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
        .collect()
}

/// Translate the transcript into provider messages. Consecutive tool results
/// are grouped into a single user turn after the call that requested them.
pub(crate) fn build_history(messages: &[Message]) -> Vec<LlmMessage> {
    let mut history: Vec<LlmMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::User => history.push(LlmMessage::user(msg.content.clone())),
            Role::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(ContentBlock::text(msg.content.clone()));
                }
                for call in &msg.tool_calls {
                    content.push(ContentBlock::tool_use(
                        &call.id,
                        &call.name,
                        call.arguments.clone(),
                    ));
                }
                if !content.is_empty() {
                    history.push(LlmMessage {
                        role: MessageRole::Assistant,
                        content,
                    });
                }
            }
            Role::Tool => {
                let block = ContentBlock::tool_result(
                    msg.tool_call_id.clone().unwrap_or_default(),
                    msg.content.clone(),
                    msg.is_error,
                );
                match history.last_mut() {
                    Some(last)
                        if last.role == MessageRole::User
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => history.push(LlmMessage {
                        role: MessageRole::User,
                        content: vec![block],
                    }),
                }
            }
        }
    }

    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::runtime::testing::MockLlmService;
    use serde_json::json;

    fn greeting_loop(llm: Arc<MockLlmService>) -> ToolLoop {
        ToolLoop::new(
            StageId::Greeting,
            ToolRegistry::greeting(),
            llm,
            YearBounds::default(),
        )
    }

    fn start() -> SessionState {
        SessionState::default().with_message(Message::user("hi"))
    }

    #[tokio::test]
    async fn test_plain_reply_ends_stage() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_text("Hello! How can I help?");

        let state = greeting_loop(llm.clone()).run("sys", "t1", start()).await.unwrap();

        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, "Hello! How can I help?");
        assert_eq!(state.messages[1].name, "Greeting_Agent");
        assert_eq!(state.current_route, None);

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system[0].text, "sys");
        assert_eq!(requests[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn test_plain_reply_ends_stage_with_follow_up_enabled() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_text("Hello!");
        llm.queue_text("never requested");

        let state = greeting_loop(llm.clone())
            .call_after_tool(true)
            .run("sys", "t1", start())
            .await
            .unwrap();

        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.last_reply_since(0), Some("Hello!"));
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_without_follow_up() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_tool_call(
            "Connecting you.",
            "redirect",
            json!({"next_agent": "Analytics_Agent"}),
        );

        let state = greeting_loop(llm.clone()).run("sys", "t1", start()).await.unwrap();

        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages[1].tool_calls.len(), 1);
        assert_eq!(state.messages[2].role, Role::Tool);
        assert_eq!(state.messages[2].content, "You will be redirected to Analytics_Agent");
        assert_eq!(state.current_route, Some(StageId::Analytics));
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_call_after_tool_sends_results_back() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_tool_call("", "redirect", json!({"next_agent": "Analytics_Agent"}));
        llm.queue_text("You're all set.");

        let state = greeting_loop(llm.clone())
            .call_after_tool(true)
            .run("sys", "t1", start())
            .await
            .unwrap();

        assert_eq!(state.messages.last().unwrap().content, "You're all set.");
        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        // user, assistant(tool_use), user(tool_result)
        assert_eq!(requests[1].messages.len(), 3);
        assert!(matches!(
            requests[1].messages[2].content[0],
            ContentBlock::ToolResult { .. }
        ));
    }

    #[tokio::test]
    async fn test_round_limit() {
        let llm = Arc::new(MockLlmService::new());
        for _ in 0..3 {
            llm.queue_tool_call("", "redirect", json!({"next_agent": "Analytics_Agent"}));
        }

        let state = greeting_loop(llm.clone())
            .call_after_tool(true)
            .max_rounds(2)
            .run("sys", "t1", start())
            .await
            .unwrap();

        assert_eq!(llm.requests().len(), 2);
        assert_eq!(state.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_tool_call("", "drop_database", json!({}));

        let state = greeting_loop(llm).run("sys", "t1", start()).await.unwrap();

        let result = state.messages.last().unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "Unknown tool: drop_database");
        assert_eq!(state.current_route, None);
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_error(LlmError::server_error("overloaded"));

        let result = greeting_loop(llm).run("sys", "t1", start()).await;
        assert!(matches!(result, Err(StageError::Llm(_))));
    }

    #[test]
    fn test_history_groups_tool_results() {
        let call_a = ToolCall::new("a", "redirect", json!({}));
        let call_b = ToolCall::new("b", "redirect", json!({}));
        let messages = vec![
            Message::user("hi"),
            Message::assistant(StageId::Greeting, "")
                .with_tool_calls(vec![call_a.clone(), call_b.clone()]),
            Message::tool_result(&call_a, "ok", false),
            Message::tool_result(&call_b, "ok", false),
            Message::assistant(StageId::Validation, "The generated query is valid."),
            Message::user("thanks"),
        ];

        let history = build_history(&messages);
        assert_eq!(history.len(), 5);
        assert_eq!(history[1].content.len(), 2);
        assert_eq!(history[2].role, MessageRole::User);
        assert_eq!(history[2].content.len(), 2);
        assert_eq!(history[3].role, MessageRole::Assistant);
    }
}

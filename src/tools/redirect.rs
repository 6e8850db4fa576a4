//! Redirect tool - hands the conversation to another stage

use super::{Tool, ToolContext, ToolOutput};
use crate::llm::LlmError;
use crate::state_machine::{StageId, StatePatch};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct RedirectTool;

#[derive(Debug, Deserialize)]
struct RedirectInput {
    next_agent: String,
}

#[async_trait]
impl Tool for RedirectTool {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn description(&self) -> String {
        "Redirect the conversation to a specialized assistant. Use when the user's request needs that assistant's capabilities.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["next_agent"],
            "properties": {
                "next_agent": {
                    "type": "string",
                    "description": "Name of the assistant to redirect to",
                    "enum": [StageId::Analytics.agent_name()]
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, LlmError> {
        let input: RedirectInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return Ok(ToolOutput::error(format!("Invalid input: {e}"))),
        };

        let Some(stage) = StageId::from_name(&input.next_agent) else {
            return Ok(ToolOutput::error(format!(
                "Unknown assistant: {}",
                input.next_agent
            )));
        };

        tracing::info!(thread_id = %ctx.thread_id, to = %stage, "Redirecting conversation");

        Ok(ToolOutput::success(
            format!("You will be redirected to {}", input.next_agent),
            StatePatch::default().route(stage),
        ))
    }
}

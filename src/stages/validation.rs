//! Validation stage - judges the generated query before it runs

use super::{Stage, StageError};
use crate::llm::{LlmMessage, LlmRequest, LlmService, OutputSchema};
use crate::query::parse_pipeline;
use crate::state_machine::{Message, SessionState, StageId, StatePatch};
use crate::system_prompt;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const VALID_REPLY: &str = "The generated query is valid. It adheres to the schema, security standards, and aggregation syntax.";

/// Structured verdict of the validator
#[derive(Debug, Deserialize)]
struct QueryValidation {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    explanation: String,
}

fn validation_schema() -> OutputSchema {
    OutputSchema::new(
        "QueryValidation",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["is_valid", "explanation"],
            "properties": {
                "is_valid": {
                    "type": "boolean",
                    "description": "Whether the pipeline is valid according to the schema and security standards."
                },
                "explanation": {
                    "type": "string",
                    "description": "A short and concise explanation of the validation result."
                }
            }
        }),
    )
}

fn rejection(generated_query: &str, user_query: &str, explanation: &str) -> String {
    format!(
        "The generated query: {generated_query} is invalid for user query: {user_query}, the following issues were identified: {explanation}. Please try again and generate a valid query."
    )
}

pub struct ValidationStage {
    llm: Arc<dyn LlmService>,
}

impl ValidationStage {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }

    async fn judge(&self, state: &SessionState) -> Result<QueryValidation, StageError> {
        // Text the constrained parser refuses can never run, so no model call
        if let Err(e) = parse_pipeline(&state.generated_query) {
            return Ok(QueryValidation {
                is_valid: false,
                explanation: e.to_string(),
            });
        }

        let request = LlmRequest::new(system_prompt::validation())
            .with_messages(vec![LlmMessage::user(system_prompt::validation_input(
                &state.user_query,
                &state.generated_query,
            ))])
            .with_output_schema(validation_schema());

        let response = self.llm.complete(&request).await?;
        response
            .json::<QueryValidation>()
            .map_err(|source| StageError::Structured {
                what: "validation",
                source,
            })
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn id(&self) -> StageId {
        StageId::Validation
    }

    async fn run(&self, thread_id: &str, state: SessionState) -> Result<SessionState, StageError> {
        if !state.has_generated_query() {
            return Err(StageError::MissingQuery(StageId::Validation));
        }

        let verdict = self.judge(&state).await?;
        tracing::info!(
            thread_id = %thread_id,
            is_valid = verdict.is_valid,
            explanation = %verdict.explanation,
            "Query validated"
        );

        let reply = if verdict.is_valid {
            VALID_REPLY.to_string()
        } else {
            rejection(&state.generated_query, &state.user_query, &verdict.explanation)
        };

        Ok(state
            .with_message(Message::assistant(StageId::Validation, reply))
            .apply(
                StatePatch::default()
                    .route(StageId::Validation)
                    .query_correct(verdict.is_valid),
            ))
    }
}

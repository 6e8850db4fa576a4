//! Query-writing tool - turns a natural-language request into a pipeline

use super::{Tool, ToolContext, ToolOutput};
use crate::llm::{strip_code_fence, LlmError, LlmMessage, LlmRequest, OutputSchema};
use crate::state_machine::{StageId, StatePatch};
use crate::system_prompt;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Four-digit years, with the amount context that rules a match out: a
/// currency sign or comparison word before it, a decimal part or unit after it
static YEAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(\$\s*|\b(?:above|over|below|under|exceeding|than|least|most)\s+)?",
        r"\b((?:19|20)\d{2})\b",
        r"(\.\d|\s*(?:%|(?:dollars?|usd|eur|euros?|bucks|units?|items?|pieces?)\b))?",
    ))
    .expect("Invalid year regex")
});

/// Inclusive range of years the dataset covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearBounds {
    pub min: i32,
    pub max: i32,
}

impl Default for YearBounds {
    fn default() -> Self {
        Self {
            min: 2012,
            max: 2015,
        }
    }
}

impl YearBounds {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn contains(self, year: i32) -> bool {
        (self.min..=self.max).contains(&year)
    }

    /// Four-digit years mentioned in `text` that fall outside the range.
    /// Numbers read as amounts ("$2000", "above 2000 dollars") are skipped.
    pub fn out_of_range(self, text: &str) -> Vec<i32> {
        YEAR_PATTERN
            .captures_iter(text)
            .filter(|c| c.get(1).is_none() && c.get(3).is_none())
            .filter_map(|c| c[2].parse::<i32>().ok())
            .filter(|year| !self.contains(*year))
            .collect()
    }

    /// Reply given to the user when a request falls outside the range
    pub fn explanation(self) -> String {
        format!(
            "I'm sorry, I can only process queries for data between {} and {}. Could you refine your request to fit within this range?",
            self.min, self.max
        )
    }

    /// `Err` carries the user-facing explanation
    pub fn check(self, text: &str) -> Result<(), String> {
        if self.out_of_range(text).is_empty() {
            Ok(())
        } else {
            Err(self.explanation())
        }
    }
}

pub struct WriteQueryTool;

#[derive(Debug, Deserialize)]
struct WriteQueryInput {
    user_query: String,
}

/// Structured reply of the query writer
#[derive(Debug, Deserialize)]
struct GeneratedPipeline {
    pipeline: String,
}

fn pipeline_schema() -> OutputSchema {
    OutputSchema::new(
        "GeneratedPipeline",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["pipeline"],
            "properties": {
                "pipeline": {
                    "type": "string",
                    "description": "Aggregation pipeline to run against the orders collection"
                }
            }
        }),
    )
}

#[async_trait]
impl Tool for WriteQueryTool {
    fn name(&self) -> &'static str {
        "write_query"
    }

    fn description(&self) -> String {
        "Write an aggregation pipeline over the procurement orders collection that answers the user's question or request about data.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["user_query"],
            "properties": {
                "user_query": {
                    "type": "string",
                    "description": "The user's question or request about data"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, LlmError> {
        let input: WriteQueryInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return Ok(ToolOutput::error(format!("Invalid input: {e}"))),
        };
        let user_query = input.user_query.trim();
        if user_query.is_empty() {
            return Ok(ToolOutput::error("Invalid input: user_query is empty"));
        }

        if let Err(explanation) = ctx.bounds.check(user_query) {
            tracing::info!(
                thread_id = %ctx.thread_id,
                years = ?ctx.bounds.out_of_range(user_query),
                "Query request outside the year range"
            );
            return Ok(ToolOutput::error(explanation));
        }

        let request = LlmRequest::new(system_prompt::query_writer(ctx.bounds))
            .with_messages(vec![LlmMessage::user(format!("Input: {user_query}"))])
            .with_output_schema(pipeline_schema());

        let response = ctx.llm().complete(&request).await?;

        let generated = match response.json::<GeneratedPipeline>() {
            Ok(g) => g,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "Failed to decode generated query: {e}"
                )))
            }
        };
        let pipeline = strip_code_fence(&generated.pipeline);
        if pipeline.is_empty() {
            return Ok(ToolOutput::error("The query writer returned an empty pipeline."));
        }

        tracing::info!(
            thread_id = %ctx.thread_id,
            pipeline_len = pipeline.len(),
            "Query generated"
        );

        Ok(ToolOutput::success(
            "Query has been generated successfully.",
            StatePatch::default()
                .generated_query(pipeline)
                .user_query(user_query)
                .route(StageId::Analytics),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockLlmService;
    use std::sync::Arc;

    fn context(llm: Arc<MockLlmService>) -> ToolContext {
        ToolContext::new("t1", YearBounds::default(), llm)
    }

    #[test]
    fn test_year_bounds() {
        let bounds = YearBounds::default();
        assert!(bounds.check("total orders for 2013").is_ok());
        assert!(bounds.check("orders between 2012 and 2015").is_ok());
        assert!(bounds.check("how many orders were there?").is_ok());
        assert_eq!(bounds.out_of_range("orders from 2010 to 2013"), vec![2010]);
        assert_eq!(bounds.out_of_range("po 120105 in 1999"), vec![1999]);
        assert_eq!(
            bounds.check("Show me total orders for 2010").unwrap_err(),
            "I'm sorry, I can only process queries for data between 2012 and 2015. Could you refine your request to fit within this range?"
        );
    }

    #[test]
    fn test_amounts_are_not_years() {
        let bounds = YearBounds::default();
        assert!(bounds
            .check("Which orders in 2013 had a total price above 2000 dollars?")
            .is_ok());
        assert!(bounds.check("orders over $2000 in 2014").is_ok());
        assert!(bounds.check("orders with a unit price of 1999.99 in 2013").is_ok());
        assert!(bounds.check("orders costing more than 1800 in 2012").is_ok());
        assert!(bounds.check("departments that bought 1950 units during 2015").is_ok());
        assert_eq!(bounds.out_of_range("orders in 2010 above $5000"), vec![2010]);
        assert_eq!(
            bounds.out_of_range("orders for 2011 priced under 1999 usd"),
            vec![2011]
        );
        assert_eq!(bounds.out_of_range("compare 2010,2011 and 2013"), vec![2010, 2011]);
    }

    #[tokio::test]
    async fn test_generates_pipeline_and_patch() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_text(r#"{"pipeline": "[{\"$count\": \"total_orders\"}]"}"#);

        let out = WriteQueryTool
            .run(json!({"user_query": "total orders in 2013"}), &context(llm.clone()))
            .await
            .unwrap();

        assert!(out.success);
        assert_eq!(out.output, "Query has been generated successfully.");
        assert_eq!(
            out.patch.generated_query.as_deref(),
            Some(r#"[{"$count": "total_orders"}]"#)
        );
        assert_eq!(out.patch.user_query.as_deref(), Some("total orders in 2013"));
        assert_eq!(out.patch.current_route, Some(StageId::Analytics));

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].output_schema.is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_year_skips_model() {
        let llm = Arc::new(MockLlmService::new());
        let out = WriteQueryTool
            .run(json!({"user_query": "orders in 2010"}), &context(llm.clone()))
            .await
            .unwrap();

        assert!(!out.success);
        assert!(out.patch.is_empty());
        assert!(out.output.contains("between 2012 and 2015"));
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_failed_result() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_text("not json at all");
        let out = WriteQueryTool
            .run(json!({"user_query": "orders"}), &context(llm))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.patch.generated_query.is_none());
    }

    #[tokio::test]
    async fn test_model_failure_is_fatal() {
        let llm = Arc::new(MockLlmService::new());
        llm.queue_error(LlmError::network("connection reset"));
        let result = WriteQueryTool
            .run(json!({"user_query": "orders"}), &context(llm))
            .await;
        assert!(result.is_err());
    }
}

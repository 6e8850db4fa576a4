//! Execution stage - runs the validated query and formats the records

use super::{Stage, StageError};
use crate::query::{parse_pipeline, QueryError, QueryExecutor};
use crate::state_machine::{Message, SessionState, StageId, StatePatch};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct ExecutionStage {
    executor: Arc<dyn QueryExecutor>,
}

impl ExecutionStage {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    async fn execute(&self, generated_query: &str) -> Result<Vec<Value>, QueryError> {
        let pipeline = parse_pipeline(generated_query)?;
        self.executor.run(&pipeline).await
    }
}

/// One compact JSON line per record
fn format_results(records: &[Value]) -> String {
    if records.is_empty() {
        return "The query returned no results.".to_string();
    }
    let lines: Vec<String> = records.iter().map(Value::to_string).collect();
    format!("The query results are as follows:\n {}", lines.join("\n"))
}

#[async_trait]
impl Stage for ExecutionStage {
    fn id(&self) -> StageId {
        StageId::Execution
    }

    async fn run(&self, thread_id: &str, state: SessionState) -> Result<SessionState, StageError> {
        if !state.has_generated_query() {
            return Err(StageError::MissingQuery(StageId::Execution));
        }

        let (reply, patch) = match self.execute(&state.generated_query).await {
            Ok(records) => {
                tracing::info!(thread_id = %thread_id, records = records.len(), "Query executed");
                (
                    format_results(&records),
                    StatePatch::default().query_result(records),
                )
            }
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "Query execution failed");
                (
                    format!(
                        "An error occurred while executing the query: {}.",
                        state.user_query
                    ),
                    StatePatch::default(),
                )
            }
        };

        Ok(state
            .with_message(Message::assistant(StageId::Execution, reply))
            .apply(patch.route(StageId::Execution)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::InMemoryEngine;
    use crate::runtime::testing::MockQueryExecutor;
    use serde_json::json;

    fn validated(query: &str) -> SessionState {
        SessionState::default().apply(
            StatePatch::default()
                .route(StageId::Validation)
                .user_query("orders by card use")
                .generated_query(query)
                .query_correct(true),
        )
    }

    #[tokio::test]
    async fn test_formats_records() {
        let executor = Arc::new(MockQueryExecutor::new());
        executor.queue_rows(vec![json!({"_id": "Yes", "n": 2}), json!({"_id": "No", "n": 5})]);

        let state = ExecutionStage::new(executor.clone())
            .run("t1", validated(r#"[{"$group": {"_id": "$calCardUsed", "n": {"$sum": 1}}}]"#))
            .await
            .unwrap();

        assert_eq!(state.current_route, Some(StageId::Execution));
        assert_eq!(state.query_result.len(), 2);
        assert_eq!(
            state.last_reply_since(0),
            Some("The query results are as follows:\n {\"_id\":\"Yes\",\"n\":2}\n{\"_id\":\"No\",\"n\":5}")
        );
        assert_eq!(executor.runs(), 1);
    }

    #[tokio::test]
    async fn test_empty_result() {
        let executor = Arc::new(MockQueryExecutor::new());
        let state = ExecutionStage::new(executor)
            .run("t1", validated(r#"[{"$count": "n"}]"#))
            .await
            .unwrap();
        assert_eq!(state.last_reply_since(0), Some("The query returned no results."));
        assert!(state.query_result.is_empty());
    }

    #[tokio::test]
    async fn test_executor_failure_is_recovered() {
        let executor = Arc::new(MockQueryExecutor::new());
        executor.queue_error(QueryError::Execution("connection refused".into()));

        let previous = vec![json!({"n": 1})];
        let state = validated(r#"[{"$count": "n"}]"#)
            .apply(StatePatch::default().query_result(previous.clone()));
        let state = ExecutionStage::new(executor).run("t1", state).await.unwrap();

        assert_eq!(state.current_route, Some(StageId::Execution));
        assert_eq!(state.query_result, previous);
        assert_eq!(
            state.last_reply_since(0),
            Some("An error occurred while executing the query: orders by card use.")
        );
    }

    #[tokio::test]
    async fn test_unparseable_query_is_recovered() {
        let executor = Arc::new(MockQueryExecutor::new());
        let state = ExecutionStage::new(executor.clone())
            .run("t1", validated("db.orders.drop()"))
            .await
            .unwrap();

        assert!(state.last_reply_since(0).unwrap().starts_with("An error occurred"));
        assert_eq!(executor.runs(), 0);
    }

    #[tokio::test]
    async fn test_runs_against_engine() {
        let engine = InMemoryEngine::from_json_records(vec![
            json!({"calCardUsed": "Yes"}),
            json!({"calCardUsed": "No"}),
            json!({"calCardUsed": "Yes"}),
        ]);
        let state = ExecutionStage::new(Arc::new(engine))
            .run(
                "t1",
                validated(r#"[{"$match": {"calCardUsed": "Yes"}}, {"$count": "total_orders"}]"#),
            )
            .await
            .unwrap();

        assert_eq!(state.query_result, vec![json!({"total_orders": 2})]);
        assert_eq!(
            state.last_reply_since(0),
            Some("The query results are as follows:\n {\"total_orders\":2}")
        );
    }

    #[tokio::test]
    async fn test_hostile_pipelines_end_in_apology() {
        let engine = Arc::new(InMemoryEngine::from_json_records(vec![
            json!({"creationDate": {"$date": "2013-02-10T00:00:00Z"}}),
        ]));
        let deep = format!("{}{}", "[".repeat(3_000), "]".repeat(3_000));

        for query in [
            deep.as_str(),
            r#"[{"$project": {"x": {"$mod": [-9223372036854775808, -1]}}}]"#,
            r#"[{"$project": {"x": {"$add": ["$creationDate", 1e18]}}}]"#,
        ] {
            let previous = vec![json!({"n": 1})];
            let state =
                validated(query).apply(StatePatch::default().query_result(previous.clone()));
            let state = ExecutionStage::new(engine.clone()).run("t1", state).await.unwrap();

            assert_eq!(state.current_route, Some(StageId::Execution));
            assert_eq!(state.query_result, previous);
            assert_eq!(
                state.last_reply_since(0),
                Some("An error occurred while executing the query: orders by card use.")
            );
        }
    }
}

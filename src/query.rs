//! Read-only aggregation queries over the orders collection
//!
//! Generated pipeline text is never evaluated. It goes through a constrained
//! parser that only knows the aggregation grammar, then a stage validator,
//! and only then reaches an executor.

mod engine;
mod parser;
mod pipeline;

pub use engine::InMemoryEngine;
pub use parser::parse_pipeline;
pub use pipeline::Pipeline;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("syntax error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("invalid pipeline: {0}")]
    Invalid(String),

    #[error("stage {0} is not permitted")]
    Forbidden(String),

    #[error("operator {0} is not supported")]
    Unsupported(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

impl QueryError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub(crate) fn exec(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// Runs validated pipelines against the authorized collection
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a pipeline and return the resulting records as plain JSON
    async fn run(&self, pipeline: &Pipeline) -> Result<Vec<serde_json::Value>, QueryError>;
}

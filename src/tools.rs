//! Tools the model may call from inside a stage
//!
//! A tool returns a short summary that is appended to the transcript and a
//! state patch that is merged into the session by key overwrite. Tools are
//! stateless; everything they need arrives through `ToolContext`.

mod redirect;
mod write_query;

pub use redirect::RedirectTool;
pub use write_query::{WriteQueryTool, YearBounds};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::llm::{LlmError, LlmService, ToolDefinition};
use crate::state_machine::StatePatch;

/// Result from tool execution
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    pub patch: StatePatch,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>, patch: StatePatch) -> Self {
        Self {
            success: true,
            output: output.into(),
            patch,
        }
    }

    /// Failed call: the message goes back to the model, nothing is patched
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            patch: StatePatch::default(),
        }
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each stage run.
#[derive(Clone)]
pub struct ToolContext {
    /// The conversation this tool is executing within
    pub thread_id: String,

    /// Inclusive range of years the dataset covers
    pub bounds: YearBounds,

    llm: Arc<dyn LlmService>,
}

impl ToolContext {
    pub fn new(thread_id: impl Into<String>, bounds: YearBounds, llm: Arc<dyn LlmService>) -> Self {
        Self {
            thread_id: thread_id.into(),
            bounds,
            llm,
        }
    }

    /// Model client for tools that generate content
    pub fn llm(&self) -> &Arc<dyn LlmService> {
        &self.llm
    }
}

/// Trait for tools that can be executed by a stage
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool.
    ///
    /// Bad arguments come back as an unsuccessful `ToolOutput`; only a failed
    /// model call is an `Err`, and that ends the turn.
    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput, LlmError>;
}

/// The tools declared to one stage
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// Tools available to the Greeting stage
    pub fn greeting() -> Self {
        Self::new(vec![Arc::new(RedirectTool)])
    }

    /// Tools available to the Analytics stage
    pub fn analytics() -> Self {
        Self::new(vec![Arc::new(WriteQueryTool)])
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name. `None` when no tool has that name.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        ctx: &ToolContext,
    ) -> Option<Result<ToolOutput, LlmError>> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}

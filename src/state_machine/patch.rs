//! Partial session state produced by tools and stages

use super::StageId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys to overwrite in a `SessionState`. `None` leaves a key untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_route: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_result: Option<Vec<Value>>,
}

impl StatePatch {
    #[must_use]
    pub fn route(mut self, stage: StageId) -> Self {
        self.current_route = Some(stage);
        self
    }

    #[must_use]
    pub fn user_query(mut self, text: impl Into<String>) -> Self {
        self.user_query = Some(text.into());
        self
    }

    #[must_use]
    pub fn generated_query(mut self, query: impl Into<String>) -> Self {
        self.generated_query = Some(query.into());
        self
    }

    #[must_use]
    pub fn query_correct(mut self, correct: bool) -> Self {
        self.query_correct = Some(correct);
        self
    }

    #[must_use]
    pub fn query_result(mut self, records: Vec<Value>) -> Self {
        self.query_result = Some(records);
        self
    }

    /// Combine two patches; keys set in `later` win
    #[must_use]
    pub fn merge(self, later: StatePatch) -> Self {
        Self {
            current_route: later.current_route.or(self.current_route),
            user_query: later.user_query.or(self.user_query),
            generated_query: later.generated_query.or(self.generated_query),
            query_correct: later.query_correct.or(self.query_correct),
            query_result: later.query_result.or(self.query_result),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

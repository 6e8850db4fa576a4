//! API request and response types

use serde::{Deserialize, Serialize};

/// Request to answer one chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub thread_id: String,
}

/// Reply for a chat message
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub bot_response: String,
    pub thread_id: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

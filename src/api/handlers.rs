//! HTTP request handlers

use super::types::{ChatRequest, ChatResponse, ErrorResponse};
use super::AppState;
use crate::runtime::TurnError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/bot/v1/chat", post(chat))
        .with_state(state)
}

async fn health() -> &'static str {
    "Procurement assistant is running"
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let user_message = req.user_message.trim();
    let thread_id = req.thread_id.trim();
    if user_message.is_empty() || thread_id.is_empty() {
        return Err(AppError::BadRequest(
            "user_message and thread_id must not be empty".to_string(),
        ));
    }

    let bot_response = state
        .conversations
        .respond(user_message, thread_id)
        .await
        .map_err(|e| {
            tracing::error!(thread_id = %thread_id, error = %e, "Turn failed");
            AppError::from(e)
        })?;

    Ok(Json(ChatResponse {
        bot_response,
        thread_id: thread_id.to_string(),
    }))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    Timeout(String),
    Internal(String),
}

impl From<TurnError> for AppError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::InvalidInput(msg) => AppError::BadRequest(msg.to_string()),
            TurnError::Timeout(_) => AppError::Timeout(e.to_string()),
            TurnError::Llm(_) | TurnError::Checkpoint(_) | TurnError::Stage(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

//! Penny - conversational procurement analytics assistant
//!
//! A Rust backend that routes each user message through greeting, query
//! generation, validation and execution stages, checkpointing the
//! conversation per thread.

mod api;
mod db;
mod llm;
mod query;
mod runtime;
mod stages;
mod state_machine;
mod system_prompt;
mod tools;

use api::{create_router, AppState};
use db::Database;
use llm::{build_service, LlmConfig, LlmService};
use query::InMemoryEngine;
use runtime::{ConversationService, DatabaseStorage, ServiceConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "penny=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("PENNY_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.penny/checkpoints.db")
    });

    let port: u16 = std::env::var("PENNY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    let service_config = ServiceConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening checkpoint database");
    let db = Database::open(&db_path)?;

    let engine = load_orders()?;

    let llm_config = LlmConfig::from_env();
    let llm = build_service(&llm_config)?;
    tracing::info!(
        provider = ?llm_config.provider,
        model = %llm.model_id(),
        "LLM service initialized"
    );

    let conversations = ConversationService::new(
        llm,
        Arc::new(engine),
        Arc::new(DatabaseStorage::new(db)),
        service_config,
    );
    tracing::info!(
        min_year = service_config.bounds.min,
        max_year = service_config.bounds.max,
        max_validation_attempts = service_config.max_validation_attempts,
        turn_timeout_secs = service_config.turn_timeout.as_secs(),
        "Conversation service ready"
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(conversations))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Penny server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Load the orders collection named by `ORDERS_DATASET_PATH`
fn load_orders() -> Result<InMemoryEngine, query::QueryError> {
    let Some(path) = std::env::var("ORDERS_DATASET_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
    else {
        tracing::warn!("ORDERS_DATASET_PATH is not set, the orders collection is empty");
        return Ok(InMemoryEngine::default());
    };

    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "Orders dataset not found, the orders collection is empty"
        );
        return Ok(InMemoryEngine::default());
    }

    let engine = InMemoryEngine::load(&path)?;
    if engine.is_empty() {
        tracing::warn!(path = %path.display(), "Orders dataset contains no documents");
    } else {
        tracing::info!(path = %path.display(), documents = engine.len(), "Orders dataset loaded");
    }
    Ok(engine)
}

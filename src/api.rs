//! HTTP API for the procurement assistant
//!
//! A thin adapter over `ConversationService::respond`.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::runtime::ConversationService;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationService>,
}

impl AppState {
    pub fn new(conversations: ConversationService) -> Self {
        Self {
            conversations: Arc::new(conversations),
        }
    }
}

//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the driver with mock implementations.

use crate::db::Database;
use crate::state_machine::SessionState;
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence of session state keyed by thread id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the state for a thread; `None` when the thread is new
    async fn get(&self, thread_id: &str) -> Result<Option<SessionState>, String>;

    /// Replace the state for a thread
    async fn put(&self, thread_id: &str, state: &SessionState) -> Result<(), String>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn get(&self, thread_id: &str) -> Result<Option<SessionState>, String> {
        (**self).get(thread_id).await
    }

    async fn put(&self, thread_id: &str, state: &SessionState) -> Result<(), String> {
        (**self).put(thread_id, state).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a checkpoint store
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(dead_code)] // Useful for tests
    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn get(&self, thread_id: &str) -> Result<Option<SessionState>, String> {
        self.db
            .get_checkpoint(thread_id)
            .map(|checkpoint| checkpoint.map(|c| c.state))
            .map_err(|e| e.to_string())
    }

    async fn put(&self, thread_id: &str, state: &SessionState) -> Result<(), String> {
        self.db
            .put_checkpoint(thread_id, state)
            .map_err(|e| e.to_string())
    }
}

//! Checkpoint persistence
//!
//! One row per conversation thread holding the serialized session state.

mod schema;

pub use schema::*;

use crate::state_machine::SessionState;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database connection lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Checkpoint Operations ====================

    /// Load the checkpoint for a thread, if one exists
    pub fn get_checkpoint(&self, thread_id: &str) -> DbResult<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT thread_id, state, message_count, created_at, updated_at
                 FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((thread_id, state_json, message_count, created_at, updated_at)) = row else {
            return Ok(None);
        };
        let state: SessionState = serde_json::from_str(&state_json)?;

        Ok(Some(Checkpoint {
            thread_id,
            state,
            message_count,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        }))
    }

    /// Insert or replace the checkpoint for a thread in one statement
    pub fn put_checkpoint(&self, thread_id: &str, state: &SessionState) -> DbResult<()> {
        let state_json = serde_json::to_string(state)?;
        let message_count = i64::try_from(state.messages.len()).unwrap_or(i64::MAX);
        let now = Utc::now().to_rfc3339();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (thread_id, state, message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(thread_id) DO UPDATE SET
                state = excluded.state,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
            params![thread_id, state_json, message_count, now],
        )?;
        Ok(())
    }

    /// Remove a thread's checkpoint. Returns whether one existed.
    #[allow(dead_code)] // Used in tests
    pub fn delete_checkpoint(&self, thread_id: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE thread_id = ?1",
            params![thread_id],
        )?;
        Ok(removed > 0)
    }

    /// Number of stored threads
    #[allow(dead_code)] // Used in tests
    pub fn count_checkpoints(&self) -> DbResult<i64> {
        let conn = self.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count)
    }
}

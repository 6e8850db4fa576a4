//! Conversational routing state machine
//!
//! Session state threaded through every stage, the key-overwrite patches that
//! tools and stages produce, and the pure routing function that picks the next
//! stage after each one completes.

mod patch;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use patch::StatePatch;
pub use state::{Message, Role, SessionState, StageId, ToolCall};
pub use transition::{next_stage, DecisionPoint, Route, ENTRY_STAGE};

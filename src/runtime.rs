//! Runtime for answering conversation turns
//!
//! The driver owns routing between stages and the checkpoint boundary: state
//! is loaded once at the start of a turn and written once at its end.

mod driver;
pub mod traits;

#[cfg(test)]
mod evaluation;
#[cfg(test)]
pub mod testing;

pub use driver::{ConversationService, ServiceConfig, TurnError};
pub use traits::DatabaseStorage;

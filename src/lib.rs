//! Resilient Batch - checkpointed, crash-safe batch processing engine
//!
//! Drives ordered collections of items through extract → transform → commit
//! against an unreliable remote session, writing into a primary store while a
//! separate state store tracks progress so interrupted sessions resume exactly
//! where they stopped.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{BatchController, Collaborators, RunOutcome, RunSummary};
pub use domain::{BatchError, ItemStatus, SessionStatus};

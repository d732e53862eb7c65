//! Domain module - statuses, entities, error taxonomy and collaborator seams
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod collaborators;
pub mod entities;
pub mod errors;
pub mod status;

// Re-export commonly used items for convenience
pub use collaborators::{
    Extractor, ItemSource, PrimaryStoreWriter, RemoteSession, SessionProvider, Transformer,
};
pub use entities::{
    Checkpoint, EntityRef, Item, ItemId, ItemReport, NewPerformanceSample, PerformanceSample,
    RawPayload, Session, SessionCounts, SessionId, SessionReport, TransformOutcome,
    TransformedRecord,
};
pub use errors::{BatchError, ErrorClass, RetryableKind, TerminalKind};
pub use status::{ItemStatus, OperationKind, SessionStatus};

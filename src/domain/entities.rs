//! Core entities persisted by the state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::status::{ItemStatus, OperationKind, SessionStatus};

pub type SessionId = String;
pub type ItemId = String;

/// Reference into the primary store identifying the real-world entity
pub type EntityRef = String;

/// Raw structured data captured by extraction
pub type RawPayload = serde_json::Value;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub counts: SessionCounts,
    /// Which sub-population of items this run targets
    pub scope_filter: serde_json::Value,
}

/// Running item counts kept on the session row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub total: u32,
    pub complete: u32,
    pub error: u32,
    /// Items still to be driven; needs-manual-input items are counted separately
    pub pending: u32,
    pub needs_manual_input: u32,
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub session_id: SessionId,
    /// Position inside the session; processing order
    pub seq: i64,
    pub entity_ref: EntityRef,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Extraction output retained so a later-phase failure does not repeat it
    pub payload: Option<RawPayload>,
    /// Primary-store ids written by the successful commit
    pub created_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub const fn has_extraction(&self) -> bool {
        self.payload.is_some()
    }
}

/// "As of item N in session S, processing may safely resume from item N+1"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub session_id: SessionId,
    pub item_id: ItemId,
    pub entity_ref: EntityRef,
    pub created_at: DateTime<Utc>,
}

/// Outcome and duration of one timed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub id: i64,
    pub session_id: SessionId,
    pub item_id: Option<ItemId>,
    pub operation: OperationKind,
    pub duration_ms: u64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPerformanceSample {
    pub session_id: SessionId,
    pub item_id: Option<ItemId>,
    pub operation: OperationKind,
    pub duration_ms: u64,
    pub success: bool,
}

/// Result of the domain transform, ready (or not) for commit
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Ready to write into the primary store
    Ready(TransformedRecord),
    /// Required domain data is absent; waits for an operator
    NeedsInput { missing_fields: Vec<String> },
    /// A matching primary-store record already exists (written by an earlier attempt)
    AlreadyCommitted { existing_ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub entity_ref: EntityRef,
    pub data: serde_json::Value,
}

/// Operator-facing view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: Session,
    pub latest_checkpoint: Option<Checkpoint>,
    pub items: Vec<ItemReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub item_id: ItemId,
    pub entity_ref: EntityRef,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub has_payload: bool,
    pub created_ids: Vec<String>,
}

impl From<&Item> for ItemReport {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id.clone(),
            entity_ref: item.entity_ref.clone(),
            status: item.status,
            retry_count: item.retry_count,
            last_error: item.last_error.clone(),
            has_payload: item.has_extraction(),
            created_ids: item.created_ids.clone(),
        }
    }
}

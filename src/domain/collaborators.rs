//! Pluggable collaborator interfaces
//!
//! 도메인 로직(추출 필드, 포맷 규칙, 1차 저장소 스키마)은 엔진 밖에 있다.
//! The engine only talks to these narrow seams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::domain::entities::{EntityRef, RawPayload, TransformOutcome, TransformedRecord};
use crate::domain::errors::Result;

/// Enumerates the primary-store entities a session targets
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn list_entities(&self, scope_filter: &serde_json::Value) -> Result<Vec<EntityRef>>;
}

/// Handle to the shared remote (browser-driven) session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Stable identifier of this handle, for logs
    fn handle_id(&self) -> &str;

    /// Trivial no-op round-trip. Must fail fast when the session is gone.
    async fn ping(&self) -> Result<()>;
}

/// The automation layer that owns remote sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn RemoteSession>>;

    /// Best-effort disposal of a handle that is being replaced
    async fn release(&self, _session: Arc<dyn RemoteSession>) {}
}

/// Pulls raw structured data for one entity through the remote session
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Must honour `timeout` and return a classifiable error on failure
    async fn extract(
        &self,
        session: &dyn RemoteSession,
        entity_ref: &str,
        timeout: Duration,
    ) -> Result<RawPayload>;
}

/// Domain transform; also responsible for duplicate detection in the primary store
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, entity_ref: &str, payload: &RawPayload) -> Result<TransformOutcome>;
}

/// Writes a transformed record inside the commit coordinator's primary transaction
#[async_trait]
pub trait PrimaryStoreWriter: Send + Sync {
    /// Returns the identifiers generated by the write
    async fn write(&self, record: &TransformedRecord, conn: &mut SqliteConnection)
    -> Result<Vec<String>>;
}

//! Session administration over the state store alone
//!
//! 수집기(collaborator) 없이 가능한 운영 작업: 조회, 일시정지, 취소, 삭제,
//! 아이템 재시도/재제출/건너뛰기. The CLI uses this directly; the batch
//! controller layers in-process signalling on top of it.

use std::sync::Arc;

use tracing::info;

use crate::domain::entities::{Item, ItemReport, RawPayload, Session, SessionReport};
use crate::domain::errors::{BatchError, Result};
use crate::domain::status::{ItemStatus, SessionStatus};
use crate::infrastructure::state_store::StateStore;

#[derive(Clone)]
pub struct SessionAdmin {
    state: Arc<dyn StateStore>,
}

impl SessionAdmin {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.state.list_sessions().await
    }

    /// Sessions in `ready`, `running` or `paused`
    pub async fn list_resumable(&self) -> Result<Vec<Session>> {
        self.state.get_resumable_sessions().await
    }

    /// Store-level pause; a running loop stops at its next item boundary
    pub async fn pause(&self, session_id: &str) -> Result<Session> {
        let current = self.require_session(session_id).await?;
        // complete → paused is reserved for requeued items
        if current.status == SessionStatus::Complete {
            return Err(BatchError::InvalidTransition {
                from: current.status,
                to: SessionStatus::Paused,
            });
        }
        let session = self
            .state
            .update_session_status(session_id, SessionStatus::Paused)
            .await?;
        info!("⏸️ Session {} paused", session_id);
        Ok(session)
    }

    /// Store-level cancel; the session returns to `idle`
    pub async fn cancel(&self, session_id: &str) -> Result<Session> {
        let session = self
            .state
            .update_session_status(session_id, SessionStatus::Idle)
            .await?;
        info!("⏹️ Session {} cancelled", session_id);
        Ok(session)
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        self.state.delete_session(session_id).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.state.clear_all().await
    }

    /// Per-item last phase, retry count and error text
    pub async fn session_report(&self, session_id: &str) -> Result<SessionReport> {
        let session = self.require_session(session_id).await?;
        let latest_checkpoint = self.state.get_latest_checkpoint(session_id).await?;
        let items = self.state.list_items(session_id).await?;
        Ok(SessionReport {
            session,
            latest_checkpoint,
            items: items.iter().map(ItemReport::from).collect(),
        })
    }

    /// Send an `error` item back to `queued`
    pub async fn retry_item(&self, item_id: &str) -> Result<Item> {
        let item = self.require_item(item_id).await?;
        if item.status != ItemStatus::Error {
            return Err(BatchError::InvalidInput(format!(
                "item {item_id} is {}, only error items can be retried",
                item.status
            )));
        }
        self.state
            .update_item_status(item_id, ItemStatus::Queued, None)
            .await?;
        self.reopen_session(&item.session_id).await?;
        info!("🔁 Item {} requeued", item_id);
        self.require_item(item_id).await
    }

    /// Merge operator-supplied fields into a `needs-manual-input` item's payload and requeue it
    pub async fn resubmit_item(
        &self,
        item_id: &str,
        supplied_fields: serde_json::Value,
    ) -> Result<Item> {
        let item = self.require_item(item_id).await?;
        if item.status != ItemStatus::NeedsManualInput {
            return Err(BatchError::InvalidInput(format!(
                "item {item_id} is {}, only needs-manual-input items can be resubmitted",
                item.status
            )));
        }
        let payload = merge_fields(item.payload.clone(), supplied_fields)?;
        self.state.update_item_payload(item_id, &payload).await?;
        self.state
            .update_item_status(item_id, ItemStatus::Queued, None)
            .await?;
        self.reopen_session(&item.session_id).await?;
        info!("📝 Item {} resubmitted with supplied fields", item_id);
        self.require_item(item_id).await
    }

    /// Abandon an item permanently
    pub async fn skip_item(&self, item_id: &str) -> Result<Item> {
        let item = self.require_item(item_id).await?;
        self.state
            .update_item_status(item_id, ItemStatus::Skipped, item.last_error.as_deref())
            .await?;
        self.state.refresh_session_counts(&item.session_id).await?;
        info!("⏭️ Item {} skipped", item_id);
        self.require_item(item_id).await
    }

    /// A requeued item re-opens a finished session as `paused`
    async fn reopen_session(&self, session_id: &str) -> Result<()> {
        let session = self.require_session(session_id).await?;
        if session.status == SessionStatus::Complete {
            self.state
                .update_session_status(session_id, SessionStatus::Paused)
                .await?;
            info!("Session {} re-opened as paused", session_id);
        }
        self.state.refresh_session_counts(session_id).await?;
        Ok(())
    }

    pub async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.state
            .get_session(session_id)
            .await?
            .ok_or_else(|| BatchError::SessionNotFound(session_id.to_string()))
    }

    pub async fn require_item(&self, item_id: &str) -> Result<Item> {
        self.state
            .get_item(item_id)
            .await?
            .ok_or_else(|| BatchError::ItemNotFound(item_id.to_string()))
    }
}

/// Shallow-merge `fields` into an object payload
fn merge_fields(payload: Option<RawPayload>, fields: serde_json::Value) -> Result<RawPayload> {
    let serde_json::Value::Object(fields) = fields else {
        return Err(BatchError::InvalidInput(
            "supplied fields must be a JSON object".to_string(),
        ));
    };
    match payload {
        None => Ok(serde_json::Value::Object(fields)),
        Some(serde_json::Value::Object(mut existing)) => {
            existing.extend(fields);
            Ok(serde_json::Value::Object(existing))
        }
        Some(_) => Err(BatchError::InvalidInput(
            "stored payload is not an object; cannot merge fields".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::payload_store::PayloadStore;
    use crate::infrastructure::state_store::SqliteStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<SqliteStateStore>, SessionAdmin) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("state.db").display());
        let store = SqliteStateStore::open(&url, PayloadStore::new(dir.path(), 4096))
            .await
            .unwrap();
        let admin = SessionAdmin::new(store.clone());
        (dir, store, admin)
    }

    /// A session that ran to completion with one error and one manual-input item
    async fn finished_session(store: &SqliteStateStore) -> (String, Vec<Item>) {
        let session = store.create_session(&json!({})).await.unwrap();
        let items = store
            .create_items(&session.id, &["A".into(), "B".into(), "C".into()])
            .await
            .unwrap();
        store
            .update_item_status(&items[1].id, ItemStatus::Error, Some("HTTP 404"))
            .await
            .unwrap();
        store
            .update_item_payload(&items[2].id, &json!({ "name": "widget" }))
            .await
            .unwrap();
        store
            .update_item_status(&items[2].id, ItemStatus::NeedsManualInput, Some("missing fields: vendor"))
            .await
            .unwrap();
        for status in [
            SessionStatus::Loading,
            SessionStatus::Ready,
            SessionStatus::Running,
            SessionStatus::Complete,
        ] {
            store.update_session_status(&session.id, status).await.unwrap();
        }
        (session.id, items)
    }

    #[test]
    fn merge_overrides_and_extends() {
        let merged = merge_fields(
            Some(json!({ "name": "widget", "vendor": null })),
            json!({ "vendor": "acme", "sku": "W-1" }),
        )
        .unwrap();
        assert_eq!(merged, json!({ "name": "widget", "vendor": "acme", "sku": "W-1" }));
        assert_eq!(
            merge_fields(None, json!({ "vendor": "acme" })).unwrap(),
            json!({ "vendor": "acme" })
        );
    }

    #[test]
    fn merge_rejects_non_objects() {
        assert!(matches!(
            merge_fields(None, json!(["a"])),
            Err(BatchError::InvalidInput(_))
        ));
        assert!(matches!(
            merge_fields(Some(json!("text")), json!({ "a": 1 })),
            Err(BatchError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn retry_item_reopens_complete_session() {
        let (_dir, store, admin) = setup().await;
        let (session_id, items) = finished_session(&store).await;

        let err = admin.retry_item(&items[0].id).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));

        let item = admin.retry_item(&items[1].id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Queued);
        assert!(item.last_error.is_none());

        let session = admin.require_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert!(session.completed_at.is_none());
        let resumable = admin.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
    }

    #[tokio::test]
    async fn resubmit_merges_fields_into_payload() {
        let (_dir, store, admin) = setup().await;
        let (_session_id, items) = finished_session(&store).await;

        let item = admin
            .resubmit_item(&items[2].id, json!({ "vendor": "acme" }))
            .await
            .unwrap();
        assert_eq!(item.status, ItemStatus::Queued);
        assert_eq!(item.payload, Some(json!({ "name": "widget", "vendor": "acme" })));

        let err = admin
            .resubmit_item(&items[1].id, json!({ "vendor": "acme" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn skipped_items_are_final() {
        let (_dir, store, admin) = setup().await;
        let (session_id, items) = finished_session(&store).await;

        let skipped = admin.skip_item(&items[1].id).await.unwrap();
        assert_eq!(skipped.status, ItemStatus::Skipped);
        assert_eq!(skipped.last_error.as_deref(), Some("HTTP 404"));
        assert!(matches!(
            admin.retry_item(&items[1].id).await,
            Err(BatchError::InvalidInput(_))
        ));
        assert!(matches!(
            admin.skip_item(&items[1].id).await,
            Err(BatchError::ItemImmutable(_))
        ));

        let report = admin.session_report(&session_id).await.unwrap();
        assert_eq!(report.items.len(), 3);
        assert_eq!(report.session.counts.error, 0);
    }

    #[tokio::test]
    async fn pause_and_cancel_follow_lifecycle() {
        let (_dir, store, admin) = setup().await;
        let (complete_id, _) = finished_session(&store).await;
        assert!(matches!(
            admin.pause(&complete_id).await,
            Err(BatchError::InvalidTransition { .. })
        ));

        let session = store.create_session(&json!({})).await.unwrap();
        store
            .update_session_status(&session.id, SessionStatus::Loading)
            .await
            .unwrap();
        store
            .update_session_status(&session.id, SessionStatus::Ready)
            .await
            .unwrap();
        assert_eq!(admin.pause(&session.id).await.unwrap().status, SessionStatus::Paused);
        assert_eq!(admin.cancel(&session.id).await.unwrap().status, SessionStatus::Idle);
        assert!(matches!(
            admin.session_report("missing").await,
            Err(BatchError::SessionNotFound(_))
        ));
    }
}

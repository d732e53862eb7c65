//! Cross-store commit coordinator
//!
//! 1차 저장소 쓰기와 상태 저장소의 `complete` 전이를 하나의 논리 단위로 묶는다.
//!
//! Order: begin primary, begin state, primary write, state update, commit
//! primary, commit state. Any failure before the primary commit rolls both
//! back and leaves the item untouched. A failure after it is reported as
//! `BatchError::PartialCommit`; the transformer's duplicate detection then
//! completes the item on retry without a second primary write.
//!
//! Staging is bounded by a timeout; expiry counts as a failure before the
//! primary commit.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, error, info, warn};

use crate::domain::collaborators::PrimaryStoreWriter;
use crate::domain::entities::TransformedRecord;
use crate::domain::errors::{BatchError, Result};
use crate::infrastructure::state_store::StateStore;

/// Points at which an interceptor may inject a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStage {
    BeforePrimaryWrite,
    AfterPrimaryWrite,
    AfterStateUpdate,
    AfterPrimaryCommit,
}

/// Hook consulted at every commit stage; an error aborts the commit there
pub trait CommitInterceptor: Send + Sync {
    fn check(&self, stage: CommitStage, item_id: &str) -> Result<()>;
}

pub struct CommitCoordinator {
    primary: SqlitePool,
    state: Arc<dyn StateStore>,
    writer: Arc<dyn PrimaryStoreWriter>,
    interceptor: Option<Arc<dyn CommitInterceptor>>,
    timeout: Duration,
}

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

impl CommitCoordinator {
    pub fn new(
        primary: SqlitePool,
        state: Arc<dyn StateStore>,
        writer: Arc<dyn PrimaryStoreWriter>,
    ) -> Self {
        Self {
            primary,
            state,
            writer,
            interceptor: None,
            timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommitInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    fn intercept(&self, stage: CommitStage, item_id: &str) -> Result<()> {
        match &self.interceptor {
            Some(interceptor) => interceptor.check(stage, item_id),
            None => Ok(()),
        }
    }

    /// Write `record` to the primary store and mark the item complete, atomically.
    /// Returns the generated primary-store ids.
    pub async fn commit(&self, item_id: &str, record: &TransformedRecord) -> Result<Vec<String>> {
        let mut primary_tx = self.primary.begin().await?;
        let mut state_tx = match self.state.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                rollback(primary_tx, "primary").await;
                return Err(e);
            }
        };

        let staged = tokio::time::timeout(
            self.timeout,
            self.stage_writes(item_id, record, &mut primary_tx, &mut state_tx),
        )
        .await
        .unwrap_or_else(|_| Err(BatchError::timeout("commit", self.timeout)));

        let created_ids = match staged {
            Ok(ids) => ids,
            Err(e) => {
                rollback(primary_tx, "primary").await;
                rollback(state_tx, "state").await;
                debug!("Commit of item {} rolled back: {}", item_id, e);
                return Err(e);
            }
        };

        if let Err(e) = primary_tx.commit().await {
            rollback(state_tx, "state").await;
            return Err(e.into());
        }

        // from here on the primary write is durable
        let state_result = match self.intercept(CommitStage::AfterPrimaryCommit, item_id) {
            Ok(()) => state_tx.commit().await.map_err(BatchError::from),
            Err(e) => {
                rollback(state_tx, "state").await;
                Err(e)
            }
        };

        if let Err(e) = state_result {
            error!(
                "💥 Partial commit for item {}: primary ids {:?} written, state update lost: {}",
                item_id, created_ids, e
            );
            return Err(BatchError::PartialCommit {
                created_ids,
                reason: e.to_string(),
            });
        }

        debug!("💾 Committed item {} → {:?}", item_id, created_ids);
        Ok(created_ids)
    }

    async fn stage_writes(
        &self,
        item_id: &str,
        record: &TransformedRecord,
        primary_tx: &mut Transaction<'static, Sqlite>,
        state_tx: &mut Transaction<'static, Sqlite>,
    ) -> Result<Vec<String>> {
        self.intercept(CommitStage::BeforePrimaryWrite, item_id)?;
        let created_ids = self.writer.write(record, &mut **primary_tx).await?;
        self.intercept(CommitStage::AfterPrimaryWrite, item_id)?;
        self.state
            .complete_item_in_tx(&mut **state_tx, item_id, &created_ids)
            .await?;
        self.intercept(CommitStage::AfterStateUpdate, item_id)?;
        Ok(created_ids)
    }

    /// State-only completion for a record the primary store already holds
    pub async fn complete_existing(&self, item_id: &str, existing_ids: &[String]) -> Result<()> {
        let completion = async {
            let mut state_tx = self.state.begin().await?;
            self.state
                .complete_item_in_tx(&mut *state_tx, item_id, existing_ids)
                .await?;
            state_tx.commit().await?;
            Ok::<_, BatchError>(())
        };
        tokio::time::timeout(self.timeout, completion)
            .await
            .unwrap_or_else(|_| Err(BatchError::timeout("commit", self.timeout)))?;
        info!(
            "♻️ Item {} already present in primary store {:?}; marked complete",
            item_id, existing_ids
        );
        Ok(())
    }
}

async fn rollback(tx: Transaction<'static, Sqlite>, store: &str) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback of {} transaction failed: {}", store, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::ItemStatus;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::payload_store::PayloadStore;
    use crate::infrastructure::state_store::SqliteStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::SqliteConnection;
    use tempfile::TempDir;

    struct RecordWriter;

    #[async_trait]
    impl PrimaryStoreWriter for RecordWriter {
        async fn write(
            &self,
            record: &TransformedRecord,
            conn: &mut SqliteConnection,
        ) -> Result<Vec<String>> {
            let id = sqlx::query("INSERT INTO records (entity_ref, data) VALUES (?, ?)")
                .bind(&record.entity_ref)
                .bind(record.data.to_string())
                .execute(&mut *conn)
                .await?
                .last_insert_rowid();
            Ok(vec![id.to_string()])
        }
    }

    /// Never returns from the primary write
    struct StalledWriter;

    #[async_trait]
    impl PrimaryStoreWriter for StalledWriter {
        async fn write(
            &self,
            _record: &TransformedRecord,
            _conn: &mut SqliteConnection,
        ) -> Result<Vec<String>> {
            std::future::pending().await
        }
    }

    struct FailAt(CommitStage);

    impl CommitInterceptor for FailAt {
        fn check(&self, stage: CommitStage, _item_id: &str) -> Result<()> {
            if stage == self.0 {
                Err(BatchError::Connection(format!("injected failure at {stage:?}")))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        primary: SqlitePool,
        state: Arc<SqliteStateStore>,
        item_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let primary_url = format!("sqlite:{}", dir.path().join("primary.db").display());
        let primary = DatabaseConnection::new(&primary_url).await.unwrap();
        sqlx::query(
            "CREATE TABLE records (id INTEGER PRIMARY KEY, entity_ref TEXT NOT NULL UNIQUE, data TEXT)",
        )
        .execute(primary.pool())
        .await
        .unwrap();

        let state_url = format!("sqlite:{}", dir.path().join("state.db").display());
        let state = SqliteStateStore::open(&state_url, PayloadStore::new(dir.path(), 1 << 20))
            .await
            .unwrap();
        let session = state.create_session(&json!({})).await.unwrap();
        let items = state
            .create_items(&session.id, &["E-1".to_string()])
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            primary: primary.pool().clone(),
            state,
            item_id: items[0].id.clone(),
        }
    }

    fn record() -> TransformedRecord {
        TransformedRecord {
            entity_ref: "E-1".into(),
            data: json!({ "name": "widget" }),
        }
    }

    async fn record_count(pool: &SqlitePool) -> i64 {
        sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM records")
            .fetch_one(pool)
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn successful_commit_updates_both_stores() {
        let f = fixture().await;
        let coordinator =
            CommitCoordinator::new(f.primary.clone(), f.state.clone(), Arc::new(RecordWriter));

        let ids = coordinator.commit(&f.item_id, &record()).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(record_count(&f.primary).await, 1);

        let item = f.state.get_item(&f.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Complete);
        assert_eq!(item.created_ids, ids);
    }

    #[tokio::test]
    async fn failure_before_primary_commit_rolls_back_both() {
        for stage in [
            CommitStage::BeforePrimaryWrite,
            CommitStage::AfterPrimaryWrite,
            CommitStage::AfterStateUpdate,
        ] {
            let f = fixture().await;
            let coordinator =
                CommitCoordinator::new(f.primary.clone(), f.state.clone(), Arc::new(RecordWriter))
                    .with_interceptor(Arc::new(FailAt(stage)));

            let err = coordinator.commit(&f.item_id, &record()).await.unwrap_err();
            assert!(matches!(err, BatchError::Connection(_)), "{stage:?}: {err}");
            assert_eq!(record_count(&f.primary).await, 0, "{stage:?}");

            let item = f.state.get_item(&f.item_id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Queued, "{stage:?}");
            assert!(item.created_ids.is_empty());
        }
    }

    #[tokio::test]
    async fn failure_after_primary_commit_is_partial_and_recoverable() {
        let f = fixture().await;
        let coordinator =
            CommitCoordinator::new(f.primary.clone(), f.state.clone(), Arc::new(RecordWriter))
                .with_interceptor(Arc::new(FailAt(CommitStage::AfterPrimaryCommit)));

        let err = coordinator.commit(&f.item_id, &record()).await.unwrap_err();
        let BatchError::PartialCommit { created_ids, .. } = err else {
            panic!("expected partial commit");
        };
        assert_eq!(record_count(&f.primary).await, 1);
        let item = f.state.get_item(&f.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Queued);

        // the duplicate is detected upstream; only the state side is completed
        coordinator
            .complete_existing(&f.item_id, &created_ids)
            .await
            .unwrap();
        assert_eq!(record_count(&f.primary).await, 1);
        let item = f.state.get_item(&f.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Complete);
        assert_eq!(item.created_ids, created_ids);
    }

    #[tokio::test]
    async fn stalled_primary_write_times_out_and_rolls_back() {
        let f = fixture().await;
        let coordinator =
            CommitCoordinator::new(f.primary.clone(), f.state.clone(), Arc::new(StalledWriter))
                .with_timeout(Duration::from_millis(100));

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            coordinator.commit(&f.item_id, &record()),
        )
        .await
        .expect("commit must not hang")
        .unwrap_err();
        assert!(matches!(err, BatchError::Timeout { .. }), "{err}");
        assert!(err.is_retryable());
        assert_eq!(record_count(&f.primary).await, 0);

        let item = f.state.get_item(&f.item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Queued);

        // the rolled-back transactions released their locks
        let coordinator =
            CommitCoordinator::new(f.primary.clone(), f.state.clone(), Arc::new(RecordWriter));
        coordinator.commit(&f.item_id, &record()).await.unwrap();
        assert_eq!(record_count(&f.primary).await, 1);
    }
}

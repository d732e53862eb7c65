//! Batch-processing state store
//!
//! 세션/아이템/체크포인트/성능 샘플을 1차 저장소와 분리된 SQLite 파일에 보관한다.
//! Every mutating operation is a single statement or a single transaction.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::domain::entities::{
    Checkpoint, EntityRef, Item, NewPerformanceSample, PerformanceSample, RawPayload, Session,
    SessionCounts, new_id,
};
use crate::domain::errors::{BatchError, Result};
use crate::domain::status::{ItemStatus, OperationKind, SessionStatus};
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::payload_store::{PayloadStore, StoredPayload};

/// Items the store refuses to change
const IMMUTABLE_GUARD: &str = "status NOT IN ('complete', 'skipped')";

/// Items still to be driven in the current run
const PENDING_FILTER: &str =
    "status NOT IN ('complete', 'needs-manual-input', 'error', 'skipped')";

/// Persistence for sessions, items, checkpoints and performance samples
#[async_trait]
pub trait StateStore: Send + Sync {
    /// New session in `idle`
    async fn create_session(&self, scope_filter: &serde_json::Value) -> Result<Session>;
    /// One `queued` item per entity, in order, inside one transaction
    async fn create_items(&self, session_id: &str, entity_refs: &[EntityRef]) -> Result<Vec<Item>>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    /// Sessions in `ready` (queued), `running` or `paused`, newest first
    async fn get_resumable_sessions(&self) -> Result<Vec<Session>>;
    /// Validated lifecycle transition
    async fn update_session_status(&self, session_id: &str, status: SessionStatus)
    -> Result<Session>;
    /// Recompute the running counts from the item rows
    async fn refresh_session_counts(&self, session_id: &str) -> Result<SessionCounts>;

    async fn get_item(&self, item_id: &str) -> Result<Option<Item>>;
    /// All items of a session in processing order
    async fn list_items(&self, session_id: &str) -> Result<Vec<Item>>;
    /// Items not yet terminal for a run, in processing order
    async fn list_pending_items(&self, session_id: &str) -> Result<Vec<Item>>;
    /// Overwrites `last_error`; fails with `ItemImmutable` on complete/skipped items
    async fn update_item_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<()>;
    async fn update_item_payload(&self, item_id: &str, payload: &RawPayload) -> Result<()>;
    async fn add_item_retries(&self, item_id: &str, retries: u32) -> Result<()>;

    async fn record_performance_sample(&self, sample: &NewPerformanceSample) -> Result<i64>;
    async fn list_performance_samples(&self, session_id: &str) -> Result<Vec<PerformanceSample>>;
    /// Most recent successful durations for an operation, oldest first
    async fn recent_successful_durations(
        &self,
        operation: OperationKind,
        limit: usize,
    ) -> Result<Vec<u64>>;

    async fn create_checkpoint(&self, session_id: &str, item: &Item) -> Result<Checkpoint>;
    async fn get_latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>>;

    /// Removes the session with its items, checkpoints and samples. Returns whether it existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;
    async fn clear_all(&self) -> Result<()>;

    /// Open a state transaction for the commit coordinator
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>>;
    /// Mark an item `complete` with its primary-store ids, inside `conn`'s transaction
    async fn complete_item_in_tx(
        &self,
        conn: &mut SqliteConnection,
        item_id: &str,
        created_ids: &[String],
    ) -> Result<()>;
}

/// SQLite implementation of `StateStore`
pub struct SqliteStateStore {
    pool: SqlitePool,
    payloads: PayloadStore,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool, payloads: PayloadStore) -> Self {
        Self { pool, payloads }
    }

    /// Connect, create the schema and wrap the pool
    pub async fn open(database_url: &str, payloads: PayloadStore) -> anyhow::Result<Arc<Self>> {
        let db = DatabaseConnection::new(database_url).await?;
        db.migrate().await?;
        info!("✅ State store ready: {}", database_url);
        Ok(Arc::new(Self::new(db.pool().clone(), payloads)))
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_session(row: &SqliteRow) -> Result<Session> {
        let status: String = row.try_get("status")?;
        let scope_filter: String = row.try_get("scope_filter")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;

        Ok(Session {
            id: row.try_get("id")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            status: status.parse()?,
            counts: SessionCounts {
                total: row.try_get::<i64, _>("total")? as u32,
                complete: row.try_get::<i64, _>("complete_count")? as u32,
                error: row.try_get::<i64, _>("error_count")? as u32,
                pending: row.try_get::<i64, _>("pending_count")? as u32,
                needs_manual_input: row.try_get::<i64, _>("manual_count")? as u32,
            },
            scope_filter: serde_json::from_str(&scope_filter)?,
        })
    }

    async fn row_to_item(&self, row: &SqliteRow) -> Result<Item> {
        let status: String = row.try_get("status")?;
        let created_ids: String = row.try_get("created_ids")?;
        let inline: Option<String> = row.try_get("payload")?;
        let reference: Option<String> = row.try_get("payload_ref")?;

        Ok(Item {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            seq: row.try_get("seq")?,
            entity_ref: row.try_get("entity_ref")?,
            status: status.parse()?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            last_error: row.try_get("last_error")?,
            payload: self
                .payloads
                .load(inline.as_deref(), reference.as_deref())
                .await?,
            created_ids: serde_json::from_str(&created_ids)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }

    async fn rows_to_items(&self, rows: &[SqliteRow]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.row_to_item(row).await?);
        }
        Ok(items)
    }

    fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
        Ok(Checkpoint {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            item_id: row.try_get("item_id")?,
            entity_ref: row.try_get("entity_ref")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn row_to_sample(row: &SqliteRow) -> Result<PerformanceSample> {
        let operation: String = row.try_get("operation")?;
        Ok(PerformanceSample {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            item_id: row.try_get("item_id")?,
            operation: operation.parse()?,
            duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
            success: row.try_get("success")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    /// Zero affected rows means the item is either missing or immutable
    async fn explain_untouched_item(&self, item_id: &str) -> BatchError {
        match sqlx::query("SELECT status FROM items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => BatchError::ItemImmutable(item_id.to_string()),
            Ok(None) => BatchError::ItemNotFound(item_id.to_string()),
            Err(e) => BatchError::Database(e),
        }
    }

    async fn payload_refs_in_use(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT DISTINCT payload_ref FROM items WHERE payload_ref IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("payload_ref").map_err(Into::into))
            .collect()
    }

    async fn cleanup_payloads(&self) {
        let in_use = match self.payload_refs_in_use().await {
            Ok(in_use) => in_use,
            Err(e) => {
                warn!("Skipping payload cleanup: {}", e);
                return;
            }
        };
        match self.payloads.remove_unreferenced(&in_use).await {
            Ok(0) => {}
            Ok(removed) => debug!("🧹 Removed {} unreferenced payload files", removed),
            Err(e) => warn!("Payload cleanup failed: {}", e),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_session(&self, scope_filter: &serde_json::Value) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: new_id(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            status: SessionStatus::Idle,
            counts: SessionCounts::default(),
            scope_filter: scope_filter.clone(),
        };

        sqlx::query(
            r"
            INSERT INTO sessions (id, created_at, updated_at, completed_at, status, scope_filter)
            VALUES (?, ?, ?, NULL, ?, ?)
            ",
        )
        .bind(&session.id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(session.status.as_str())
        .bind(serde_json::to_string(scope_filter)?)
        .execute(&self.pool)
        .await?;

        debug!("Created session {}", session.id);
        Ok(session)
    }

    async fn create_items(&self, session_id: &str, entity_refs: &[EntityRef]) -> Result<Vec<Item>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(BatchError::SessionNotFound(session_id.to_string()));
        }

        let mut items = Vec::with_capacity(entity_refs.len());
        for (seq, entity_ref) in entity_refs.iter().enumerate() {
            let item = Item {
                id: new_id(),
                session_id: session_id.to_string(),
                seq: seq as i64,
                entity_ref: entity_ref.clone(),
                status: ItemStatus::Queued,
                retry_count: 0,
                last_error: None,
                payload: None,
                created_ids: Vec::new(),
                updated_at: now,
            };
            sqlx::query(
                r"
                INSERT INTO items (id, session_id, seq, entity_ref, status, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&item.id)
            .bind(session_id)
            .bind(item.seq)
            .bind(&item.entity_ref)
            .bind(item.status.as_str())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            items.push(item);
        }

        let total = items.len() as i64;
        sqlx::query(
            "UPDATE sessions SET total = ?, pending_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(total)
        .bind(total)
        .bind(now.to_rfc3339())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Created {} items for session {}", items.len(), session_id);
        Ok(items)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn get_resumable_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM sessions
            WHERE status IN ('ready', 'running', 'paused')
            ORDER BY created_at DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Session> {
        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| BatchError::SessionNotFound(session_id.to_string()))?;

        if !session.status.can_transition_to(status) {
            return Err(BatchError::InvalidTransition {
                from: session.status,
                to: status,
            });
        }

        let now = Utc::now();
        let completed_at = (status == SessionStatus::Complete).then_some(now);

        // compare-and-set on the status we validated against
        let result = sqlx::query(
            r"
            UPDATE sessions SET status = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(status.as_str())
        .bind(now.to_rfc3339())
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(session_id)
        .bind(session.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self
                .get_session(session_id)
                .await?
                .map_or(session.status, |s| s.status);
            return Err(BatchError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        debug!("Session {} {} → {}", session_id, session.status, status);
        session.status = status;
        session.updated_at = now;
        session.completed_at = completed_at;
        Ok(session)
    }

    async fn refresh_session_counts(&self, session_id: &str) -> Result<SessionCounts> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'complete'), 0) AS complete,
                COALESCE(SUM(status = 'error'), 0) AS error,
                COALESCE(SUM(status NOT IN ('complete', 'needs-manual-input', 'error', 'skipped')), 0)
                    AS pending,
                COALESCE(SUM(status = 'needs-manual-input'), 0) AS manual
            FROM items WHERE session_id = ?
            ",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        let counts = SessionCounts {
            total: row.try_get::<i64, _>("total")? as u32,
            complete: row.try_get::<i64, _>("complete")? as u32,
            error: row.try_get::<i64, _>("error")? as u32,
            pending: row.try_get::<i64, _>("pending")? as u32,
            needs_manual_input: row.try_get::<i64, _>("manual")? as u32,
        };

        sqlx::query(
            r"
            UPDATE sessions
            SET total = ?, complete_count = ?, error_count = ?, pending_count = ?,
                manual_count = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(i64::from(counts.total))
        .bind(i64::from(counts.complete))
        .bind(i64::from(counts.error))
        .bind(i64::from(counts.pending))
        .bind(i64::from(counts.needs_manual_input))
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(counts)
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        let row = sqlx::query("SELECT * FROM items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_item(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_items(&self, session_id: &str) -> Result<Vec<Item>> {
        let rows = sqlx::query("SELECT * FROM items WHERE session_id = ? ORDER BY seq")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_items(&rows).await
    }

    async fn list_pending_items(&self, session_id: &str) -> Result<Vec<Item>> {
        let sql = format!("SELECT * FROM items WHERE session_id = ? AND {PENDING_FILTER} ORDER BY seq");
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_items(&rows).await
    }

    async fn update_item_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE items SET status = ?, last_error = ?, updated_at = ? WHERE id = ? AND {IMMUTABLE_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(last_error)
            .bind(Utc::now().to_rfc3339())
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_untouched_item(item_id).await);
        }
        Ok(())
    }

    async fn update_item_payload(&self, item_id: &str, payload: &RawPayload) -> Result<()> {
        let (inline, reference) = match self.payloads.store(payload).await? {
            StoredPayload::Inline(json) => (Some(json), None),
            StoredPayload::Spilled(reference) => (None, Some(reference)),
        };

        let sql = format!(
            "UPDATE items SET payload = ?, payload_ref = ?, updated_at = ? WHERE id = ? AND {IMMUTABLE_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(inline)
            .bind(reference)
            .bind(Utc::now().to_rfc3339())
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_untouched_item(item_id).await);
        }
        Ok(())
    }

    async fn add_item_retries(&self, item_id: &str, retries: u32) -> Result<()> {
        if retries == 0 {
            return Ok(());
        }
        let sql = format!(
            "UPDATE items SET retry_count = retry_count + ?, updated_at = ? WHERE id = ? AND {IMMUTABLE_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(i64::from(retries))
            .bind(Utc::now().to_rfc3339())
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_untouched_item(item_id).await);
        }
        Ok(())
    }

    async fn record_performance_sample(&self, sample: &NewPerformanceSample) -> Result<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO performance_samples
                (session_id, item_id, operation, duration_ms, success, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&sample.session_id)
        .bind(&sample.item_id)
        .bind(sample.operation.as_str())
        .bind(sample.duration_ms as i64)
        .bind(sample.success)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_performance_samples(&self, session_id: &str) -> Result<Vec<PerformanceSample>> {
        let rows = sqlx::query("SELECT * FROM performance_samples WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_sample).collect()
    }

    async fn recent_successful_durations(
        &self,
        operation: OperationKind,
        limit: usize,
    ) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            r"
            SELECT duration_ms FROM performance_samples
            WHERE operation = ? AND success = 1
            ORDER BY id DESC
            LIMIT ?
            ",
        )
        .bind(operation.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut durations = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("duration_ms").map(|ms| ms as u64))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        durations.reverse();
        Ok(durations)
    }

    async fn create_checkpoint(&self, session_id: &str, item: &Item) -> Result<Checkpoint> {
        let now = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO checkpoints (session_id, item_id, entity_ref, created_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(session_id)
        .bind(&item.id)
        .bind(&item.entity_ref)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Checkpoint {
            id: result.last_insert_rowid(),
            session_id: session_id.to_string(),
            item_id: item.id.clone(),
            entity_ref: item.entity_ref.clone(),
            created_at: now,
        })
    }

    async fn get_latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM performance_samples WHERE session_id = ?",
            "DELETE FROM checkpoints WHERE session_id = ?",
            "DELETE FROM items WHERE session_id = ?",
        ] {
            sqlx::query(sql).bind(session_id).execute(&mut *tx).await?;
        }
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        self.cleanup_payloads().await;
        if deleted > 0 {
            info!("🗑️ Deleted session {}", session_id);
        }
        Ok(deleted > 0)
    }

    async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM performance_samples",
            "DELETE FROM checkpoints",
            "DELETE FROM items",
            "DELETE FROM sessions",
        ] {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.cleanup_payloads().await;
        info!("🗑️ Cleared all batch state");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn complete_item_in_tx(
        &self,
        conn: &mut SqliteConnection,
        item_id: &str,
        created_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            r"
            UPDATE items SET status = ?, last_error = NULL, created_ids = ?, updated_at = ?
            WHERE id = ? AND {IMMUTABLE_GUARD}
            "
        );
        let result = sqlx::query(&sql)
            .bind(ItemStatus::Complete.as_str())
            .bind(serde_json::to_string(created_ids)?)
            .bind(Utc::now().to_rfc3339())
            .bind(item_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT id FROM items WHERE id = ?")
                .bind(item_id)
                .fetch_optional(&mut *conn)
                .await?;
            return Err(match exists {
                Some(_) => BatchError::ItemImmutable(item_id.to_string()),
                None => BatchError::ItemNotFound(item_id.to_string()),
            });
        }
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BatchError::Database(sqlx::Error::Decode(Box::new(e))))
}

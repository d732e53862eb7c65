//! Scripted collaborators shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tempfile::TempDir;
use tokio::sync::Notify;

use resilient_batch::application::{
    BatchController, CommitInterceptor, CommitStage, Collaborators,
};
use resilient_batch::domain::collaborators::{
    Extractor, ItemSource, PrimaryStoreWriter, RemoteSession, SessionProvider, Transformer,
};
use resilient_batch::domain::entities::{
    Checkpoint, EntityRef, Item, NewPerformanceSample, PerformanceSample, RawPayload, Session,
    SessionCounts, TransformOutcome, TransformedRecord,
};
use resilient_batch::domain::errors::{BatchError, Result};
use resilient_batch::domain::status::{ItemStatus, OperationKind, SessionStatus};
use resilient_batch::infrastructure::config::AppConfig;
use resilient_batch::infrastructure::database_connection::DatabaseConnection;
use resilient_batch::infrastructure::payload_store::PayloadStore;
use resilient_batch::infrastructure::state_store::{SqliteStateStore, StateStore};

/// Ordered record of collaborator calls across the pipeline
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

// ---------------------------------------------------------------------------
// Item source
// ---------------------------------------------------------------------------

pub struct ScriptedSource {
    pub entities: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl ItemSource for ScriptedSource {
    async fn list_entities(&self, _scope_filter: &serde_json::Value) -> Result<Vec<EntityRef>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BatchError::Connection("primary store unreachable".into()));
        }
        Ok(self.entities.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Remote session
// ---------------------------------------------------------------------------

pub struct ScriptedSession {
    id: String,
    alive: AtomicBool,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    fn handle_id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BatchError::SessionCrashed(format!(
                "Target page, context or browser has been closed ({})",
                self.id
            )))
        }
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    pub acquired: AtomicU32,
    pub released: AtomicU32,
    current: Mutex<Option<Arc<ScriptedSession>>>,
    dead_on_arrival: Mutex<HashSet<u32>>,
}

impl ScriptedProvider {
    /// Simulates the browser going away under the current handle
    pub fn kill_current(&self) {
        if let Some(session) = self.current.lock().unwrap().as_ref() {
            session.alive.store(false, Ordering::SeqCst);
        }
    }

    /// The `n`-th acquired handle (1-based) fails its first ping
    pub fn dead_on_arrival(&self, n: u32) {
        self.dead_on_arrival.lock().unwrap().insert(n);
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn acquire(&self) -> Result<Arc<dyn RemoteSession>> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(ScriptedSession {
            id: format!("session-{n}"),
            alive: AtomicBool::new(!self.dead_on_arrival.lock().unwrap().contains(&n)),
        });
        *self.current.lock().unwrap() = Some(session.clone());
        Ok(session)
    }

    async fn release(&self, _session: Arc<dyn RemoteSession>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Timeout,
    Crash,
    NotFound,
}

/// Blocks extraction of one entity until released
pub struct Gate {
    pub entity: String,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct ScriptedExtractor {
    log: EventLog,
    provider: Arc<ScriptedProvider>,
    failures: Mutex<HashMap<String, VecDeque<Failure>>>,
    missing_vendor: Mutex<HashSet<String>>,
    gate: Mutex<Option<Gate>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    /// Queue failures for an entity, consumed one per attempt
    pub fn fail(&self, entity: &str, failures: &[Failure]) {
        self.failures
            .lock()
            .unwrap()
            .entry(entity.to_string())
            .or_default()
            .extend(failures.iter().copied());
    }

    pub fn omit_vendor(&self, entity: &str) {
        self.missing_vendor.lock().unwrap().insert(entity.to_string());
    }

    pub fn gate(&self, entity: &str) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Gate {
            entity: entity.to_string(),
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn calls_for(&self, entity: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|e| *e == entity).count()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        session: &dyn RemoteSession,
        entity_ref: &str,
        timeout: Duration,
    ) -> Result<RawPayload> {
        self.calls.lock().unwrap().push(entity_ref.to_string());
        self.log.push(format!("extract:{entity_ref}"));
        session.ping().await?;

        let gate = {
            let mut slot = self.gate.lock().unwrap();
            if slot.as_ref().is_some_and(|g| g.entity == entity_ref) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(entity_ref)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(Failure::Timeout) => return Err(BatchError::timeout("extract", timeout)),
            Some(Failure::Crash) => {
                self.provider.kill_current();
                return Err(BatchError::remote("Protocol error: Target closed"));
            }
            Some(Failure::NotFound) => {
                return Err(BatchError::NotFound(format!("HTTP 404 for {entity_ref}")));
            }
            None => {}
        }

        let mut payload = json!({ "entity": entity_ref, "name": format!("Device {entity_ref}") });
        if !self.missing_vendor.lock().unwrap().contains(entity_ref) {
            payload["vendor"] = json!("acme");
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Transformer and primary-store writer
// ---------------------------------------------------------------------------

/// Requires `vendor`; detects records the primary store already holds
pub struct PrimaryTransformer {
    primary: SqlitePool,
}

#[async_trait]
impl Transformer for PrimaryTransformer {
    async fn transform(&self, entity_ref: &str, payload: &RawPayload) -> Result<TransformOutcome> {
        let existing: Vec<String> = sqlx::query("SELECT id FROM records WHERE entity_ref = ?")
            .bind(entity_ref)
            .fetch_all(&self.primary)
            .await?
            .iter()
            .map(|row| row.try_get::<i64, _>("id").map(|id| id.to_string()))
            .collect::<std::result::Result<_, _>>()?;
        if !existing.is_empty() {
            return Ok(TransformOutcome::AlreadyCommitted {
                existing_ids: existing,
            });
        }

        if payload.get("vendor").is_none_or(serde_json::Value::is_null) {
            return Ok(TransformOutcome::NeedsInput {
                missing_fields: vec!["vendor".to_string()],
            });
        }
        Ok(TransformOutcome::Ready(TransformedRecord {
            entity_ref: entity_ref.to_string(),
            data: payload.clone(),
        }))
    }
}

pub struct RecordWriter {
    log: EventLog,
    stalled: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl PrimaryStoreWriter for RecordWriter {
    async fn write(
        &self,
        record: &TransformedRecord,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<String>> {
        let stalled = self.stalled.lock().unwrap().contains(&record.entity_ref);
        if stalled {
            self.log.push(format!("stalled:{}", record.entity_ref));
            std::future::pending::<()>().await;
        }
        let id = sqlx::query("INSERT INTO records (entity_ref, data) VALUES (?, ?)")
            .bind(&record.entity_ref)
            .bind(record.data.to_string())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        self.log.push(format!("commit:{}", record.entity_ref));
        Ok(vec![id.to_string()])
    }
}

// ---------------------------------------------------------------------------
// Commit failure injection
// ---------------------------------------------------------------------------

/// Fails the first `times` commits reaching `stage`
pub struct FailAtStage {
    pub stage: CommitStage,
    pub remaining: AtomicU32,
    pub transient: bool,
}

impl FailAtStage {
    pub fn new(stage: CommitStage, times: u32, transient: bool) -> Self {
        Self {
            stage,
            remaining: AtomicU32::new(times),
            transient,
        }
    }
}

impl CommitInterceptor for FailAtStage {
    fn check(&self, stage: CommitStage, item_id: &str) -> Result<()> {
        if stage != self.stage {
            return Ok(());
        }
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !took {
            return Ok(());
        }
        if self.transient {
            Err(BatchError::Connection(format!("injected at {stage:?} for {item_id}")))
        } else {
            Err(BatchError::InvalidInput(format!("injected at {stage:?} for {item_id}")))
        }
    }
}

// ---------------------------------------------------------------------------
// State store wrapper
// ---------------------------------------------------------------------------

/// Pauses the session from "another process" when the run reloads its
/// pending items after the last one, just before it marks the session complete
pub struct PauseBeforeCompletion {
    pub inner: Arc<SqliteStateStore>,
    pending_loads: AtomicU32,
}

impl PauseBeforeCompletion {
    pub fn new(inner: Arc<SqliteStateStore>) -> Self {
        Self {
            inner,
            pending_loads: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StateStore for PauseBeforeCompletion {
    async fn create_session(&self, scope_filter: &serde_json::Value) -> Result<Session> {
        self.inner.create_session(scope_filter).await
    }
    async fn create_items(&self, session_id: &str, entity_refs: &[EntityRef]) -> Result<Vec<Item>> {
        self.inner.create_items(session_id, entity_refs).await
    }
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.inner.get_session(session_id).await
    }
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.inner.list_sessions().await
    }
    async fn get_resumable_sessions(&self) -> Result<Vec<Session>> {
        self.inner.get_resumable_sessions().await
    }
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Session> {
        self.inner.update_session_status(session_id, status).await
    }
    async fn refresh_session_counts(&self, session_id: &str) -> Result<SessionCounts> {
        self.inner.refresh_session_counts(session_id).await
    }
    async fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        self.inner.get_item(item_id).await
    }
    async fn list_items(&self, session_id: &str) -> Result<Vec<Item>> {
        self.inner.list_items(session_id).await
    }
    async fn list_pending_items(&self, session_id: &str) -> Result<Vec<Item>> {
        let items = self.inner.list_pending_items(session_id).await?;
        if self.pending_loads.fetch_add(1, Ordering::SeqCst) == 1 {
            self.inner
                .update_session_status(session_id, SessionStatus::Paused)
                .await?;
        }
        Ok(items)
    }
    async fn update_item_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.inner.update_item_status(item_id, status, last_error).await
    }
    async fn update_item_payload(&self, item_id: &str, payload: &RawPayload) -> Result<()> {
        self.inner.update_item_payload(item_id, payload).await
    }
    async fn add_item_retries(&self, item_id: &str, retries: u32) -> Result<()> {
        self.inner.add_item_retries(item_id, retries).await
    }
    async fn record_performance_sample(&self, sample: &NewPerformanceSample) -> Result<i64> {
        self.inner.record_performance_sample(sample).await
    }
    async fn list_performance_samples(&self, session_id: &str) -> Result<Vec<PerformanceSample>> {
        self.inner.list_performance_samples(session_id).await
    }
    async fn recent_successful_durations(
        &self,
        operation: OperationKind,
        limit: usize,
    ) -> Result<Vec<u64>> {
        self.inner.recent_successful_durations(operation, limit).await
    }
    async fn create_checkpoint(&self, session_id: &str, item: &Item) -> Result<Checkpoint> {
        self.inner.create_checkpoint(session_id, item).await
    }
    async fn get_latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.get_latest_checkpoint(session_id).await
    }
    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.inner.delete_session(session_id).await
    }
    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.inner.begin().await
    }
    async fn complete_item_in_tx(
        &self,
        conn: &mut SqliteConnection,
        item_id: &str,
        created_ids: &[String],
    ) -> Result<()> {
        self.inner.complete_item_in_tx(conn, item_id, created_ids).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub state: Arc<SqliteStateStore>,
    pub primary: SqlitePool,
    pub log: EventLog,
    pub source: Arc<ScriptedSource>,
    pub provider: Arc<ScriptedProvider>,
    pub extractor: Arc<ScriptedExtractor>,
    /// Entities whose primary write never returns
    pub stalled_writes: Arc<Mutex<HashSet<String>>>,
}

impl Harness {
    pub async fn new(entities: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.state_database_url =
            format!("sqlite:{}", dir.path().join("state.db").display());
        config.storage.primary_database_url =
            format!("sqlite:{}", dir.path().join("primary.db").display());
        config.storage.payload_dir = dir.path().join("payloads");
        config.retry.max_retries = 3;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.health.probe_timeout_ms = 500;
        config.batch.checkpoint_every = 1;
        config.timeout.seed_from_history = false;

        let state = SqliteStateStore::open(
            &config.storage.state_database_url,
            PayloadStore::new(
                &config.storage.payload_dir,
                config.storage.max_inline_payload_bytes,
            ),
        )
        .await
        .unwrap();
        let primary = DatabaseConnection::new(&config.storage.primary_database_url)
            .await
            .unwrap()
            .pool()
            .clone();
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_ref TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            )",
        )
        .execute(&primary)
        .await
        .unwrap();

        let log = EventLog::default();
        let provider = Arc::new(ScriptedProvider::default());
        let extractor = Arc::new(ScriptedExtractor {
            log: log.clone(),
            provider: provider.clone(),
            failures: Mutex::new(HashMap::new()),
            missing_vendor: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let source = Arc::new(ScriptedSource {
            entities: Mutex::new(entities.iter().map(ToString::to_string).collect()),
            fail: AtomicBool::new(false),
        });

        Self {
            dir,
            config,
            state,
            primary,
            log,
            source,
            provider,
            extractor,
            stalled_writes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn stall_write(&self, entity: &str) {
        self.stalled_writes.lock().unwrap().insert(entity.to_string());
    }

    /// A fresh controller over the same stores, as after a process restart
    pub fn controller(&self) -> BatchController {
        self.try_controller().unwrap()
    }

    pub fn try_controller(&self) -> Result<BatchController> {
        self.controller_over(self.state.clone())
    }

    /// Controller whose state access goes through `state`
    pub fn controller_over(&self, state: Arc<dyn StateStore>) -> Result<BatchController> {
        let collaborators = Collaborators {
            item_source: self.source.clone(),
            session_provider: self.provider.clone(),
            extractor: self.extractor.clone(),
            transformer: Arc::new(PrimaryTransformer {
                primary: self.primary.clone(),
            }),
            writer: Arc::new(RecordWriter {
                log: self.log.clone(),
                stalled: self.stalled_writes.clone(),
            }),
        };
        BatchController::new(&self.config, state, self.primary.clone(), collaborators)
    }

    /// (entity_ref, data) rows of the primary store, ordered by entity
    pub async fn primary_records(&self) -> Vec<(String, String)> {
        sqlx::query_as::<_, (String, String)>(
            "SELECT entity_ref, data FROM records ORDER BY entity_ref",
        )
        .fetch_all(&self.primary)
        .await
        .unwrap()
    }
}

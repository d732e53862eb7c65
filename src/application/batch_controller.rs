//! Batch controller - session lifecycle and the per-item six-phase loop
//!
//! 세션 단위로 하나의 워커만 동작하며, 아이템은 seq 순서대로 하나씩 처리한다.
//!
//! Per item: health check → idempotency check → extraction → transform →
//! commit → checkpoint. Item-level failures are recorded on the item row and
//! never stop the session. Pause and cancel are honoured between items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::application::commit_coordinator::{CommitCoordinator, CommitInterceptor};
use crate::application::health_monitor::{HealthMonitor, HealthStats};
use crate::application::retry_policy::{RetryOutcome, RetryPolicy};
use crate::application::session_admin::SessionAdmin;
use crate::application::timeout_estimator::TimeoutEstimator;
use crate::domain::collaborators::{
    Extractor, ItemSource, PrimaryStoreWriter, RemoteSession, SessionProvider, Transformer,
};
use crate::domain::entities::{
    Item, NewPerformanceSample, RawPayload, Session, SessionCounts, SessionId, SessionReport,
    TransformOutcome,
};
use crate::domain::errors::{BatchError, Result};
use crate::domain::status::{ItemStatus, OperationKind, SessionStatus};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::payload_store::PayloadStore;
use crate::infrastructure::state_store::{SqliteStateStore, StateStore};

/// The pluggable domain side of the engine
pub struct Collaborators {
    pub item_source: Arc<dyn ItemSource>,
    pub session_provider: Arc<dyn SessionProvider>,
    pub extractor: Arc<dyn Extractor>,
    pub transformer: Arc<dyn Transformer>,
    pub writer: Arc<dyn PrimaryStoreWriter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Pause,
    Cancel,
}

/// How a `run` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every item reached a terminal-for-run status
    Completed,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub session_id: SessionId,
    pub outcome: RunOutcome,
    /// Items driven through the loop during this run
    pub processed: u32,
    pub counts: SessionCounts,
}

/// Result of driving one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Complete,
    NeedsManualInput,
    Failed(String),
}

pub struct BatchController {
    state: Arc<dyn StateStore>,
    admin: SessionAdmin,
    item_source: Arc<dyn ItemSource>,
    extractor: Arc<dyn Extractor>,
    transformer: Arc<dyn Transformer>,
    coordinator: CommitCoordinator,
    health: HealthMonitor,
    estimator: TimeoutEstimator,
    retry: RetryPolicy,
    checkpoint_every: u32,
    transform_timeout: Duration,
    seed_from_history: bool,
    window_size: usize,
    /// Session currently being driven by this controller
    active: Mutex<Option<SessionId>>,
    signals: Mutex<HashMap<SessionId, ControlSignal>>,
}

/// Clears the active-session slot when a run ends, however it ends
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<SessionId>>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BatchController {
    /// Build a controller; rejects configurations `AppConfig::validate` refuses
    pub fn new(
        config: &AppConfig,
        state: Arc<dyn StateStore>,
        primary: SqlitePool,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BatchError::Config(e.to_string()))?;

        let coordinator = CommitCoordinator::new(primary, state.clone(), collaborators.writer)
            .with_timeout(config.batch.commit_timeout());
        Ok(Self {
            admin: SessionAdmin::new(state.clone()),
            state,
            item_source: collaborators.item_source,
            extractor: collaborators.extractor,
            transformer: collaborators.transformer,
            coordinator,
            health: HealthMonitor::new(
                collaborators.session_provider,
                config.health.probe_timeout(),
            ),
            estimator: TimeoutEstimator::new(config.timeout.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            checkpoint_every: config.batch.checkpoint_every.max(1),
            transform_timeout: config.batch.transform_timeout(),
            seed_from_history: config.timeout.seed_from_history,
            window_size: config.timeout.window_size,
            active: Mutex::new(None),
            signals: Mutex::new(HashMap::new()),
        })
    }

    /// Open both stores from configuration and build the controller
    pub async fn open(config: &AppConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        let payloads = PayloadStore::new(
            &config.storage.payload_dir,
            config.storage.max_inline_payload_bytes,
        );
        let state = SqliteStateStore::open(&config.storage.state_database_url, payloads).await?;
        let primary = DatabaseConnection::new(&config.storage.primary_database_url).await?;
        Ok(Self::new(config, state, primary.pool().clone(), collaborators)?)
    }

    #[must_use]
    pub fn with_commit_interceptor(mut self, interceptor: Arc<dyn CommitInterceptor>) -> Self {
        self.coordinator = self.coordinator.with_interceptor(interceptor);
        self
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn health_stats(&self) -> HealthStats {
        self.health.stats()
    }

    pub fn current_timeout(&self) -> Duration {
        self.estimator.current_timeout()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        lock(&self.active).clone()
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Create a session and its items; leaves it `ready` (or `complete` when empty)
    pub async fn prepare(&self, scope_filter: serde_json::Value) -> Result<SessionId> {
        let session = self.state.create_session(&scope_filter).await?;
        let session_id = session.id;
        self.state
            .update_session_status(&session_id, SessionStatus::Loading)
            .await?;

        let entities = match self.item_source.list_entities(&scope_filter).await {
            Ok(entities) => entities,
            Err(e) => {
                error!("❌ Item source failed for session {}: {}", session_id, e);
                self.mark_failed(&session_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.state.create_items(&session_id, &entities).await {
            error!("❌ Failed to create items for session {}: {}", session_id, e);
            self.mark_failed(&session_id).await;
            return Err(e);
        }
        self.state
            .update_session_status(&session_id, SessionStatus::Ready)
            .await?;

        if entities.is_empty() {
            info!("📭 Session {} has no items; marking complete", session_id);
            self.state
                .update_session_status(&session_id, SessionStatus::Running)
                .await?;
            self.state
                .update_session_status(&session_id, SessionStatus::Complete)
                .await?;
        } else {
            info!("📋 Session {} prepared with {} items", session_id, entities.len());
        }
        Ok(session_id)
    }

    /// `prepare` followed by `run`
    pub async fn start(&self, scope_filter: serde_json::Value) -> Result<RunSummary> {
        let session_id = self.prepare(scope_filter).await?;
        let session = self.require_session(&session_id).await?;
        if session.status == SessionStatus::Complete {
            return Ok(RunSummary {
                session_id,
                outcome: RunOutcome::Completed,
                processed: 0,
                counts: session.counts,
            });
        }
        self.run(&session_id).await
    }

    /// Sessions in `ready`, `running` or `paused`
    pub async fn list_resumable(&self) -> Result<Vec<Session>> {
        self.admin.list_resumable().await
    }

    /// Continue a resumable session from its remaining non-terminal items
    pub async fn resume(&self, session_id: &str) -> Result<RunSummary> {
        let session = self.admin.require_session(session_id).await?;
        if !session.status.is_resumable() {
            return Err(BatchError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Running,
            });
        }
        self.run(session_id).await
    }

    /// Request a pause; a running loop stops at the next item boundary
    pub async fn pause(&self, session_id: &str) -> Result<Session> {
        let session = self.admin.pause(session_id).await?;
        self.signal(session_id, ControlSignal::Pause);
        Ok(session)
    }

    /// Request cancellation; the session returns to `idle` at the next item boundary
    pub async fn cancel(&self, session_id: &str) -> Result<Session> {
        let session = self.admin.cancel(session_id).await?;
        self.signal(session_id, ControlSignal::Cancel);
        Ok(session)
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        if self.active_session().as_deref() == Some(session_id) {
            return Err(BatchError::SessionBusy(session_id.to_string()));
        }
        lock(&self.signals).remove(session_id);
        self.admin.delete(session_id).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        if let Some(active) = self.active_session() {
            return Err(BatchError::SessionBusy(active));
        }
        lock(&self.signals).clear();
        self.admin.clear_all().await
    }

    pub async fn session_report(&self, session_id: &str) -> Result<SessionReport> {
        self.admin.session_report(session_id).await
    }

    pub async fn retry_item(&self, item_id: &str) -> Result<Item> {
        self.admin.retry_item(item_id).await
    }

    pub async fn resubmit_item(
        &self,
        item_id: &str,
        supplied_fields: serde_json::Value,
    ) -> Result<Item> {
        self.admin.resubmit_item(item_id, supplied_fields).await
    }

    pub async fn skip_item(&self, item_id: &str) -> Result<Item> {
        self.admin.skip_item(item_id).await
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Drive a session until every pending item is terminal, or a pause/cancel arrives
    pub async fn run(&self, session_id: &str) -> Result<RunSummary> {
        let _active = self.claim(session_id)?;
        lock(&self.signals).remove(session_id);

        self.state
            .update_session_status(session_id, SessionStatus::Running)
            .await?;
        info!("▶️ Running session {}", session_id);

        self.seed_estimator().await;

        let items = match self.state.list_pending_items(session_id).await {
            Ok(items) => items,
            Err(e) => {
                error!("❌ Cannot load items of session {}: {}", session_id, e);
                self.mark_failed(session_id).await;
                return Err(e);
            }
        };
        debug!("{} pending items in session {}", items.len(), session_id);

        let mut processed = 0u32;
        for item in &items {
            if let Some(outcome) = self.interruption(session_id).await? {
                return self.finish(session_id, outcome, processed).await;
            }

            let span = info_span!(
                "item",
                session_id = %session_id,
                item_id = %item.id,
                entity_ref = %item.entity_ref
            );
            let outcome = self.process_item(item).instrument(span).await;
            processed += 1;

            match &outcome {
                ItemOutcome::Complete => info!("✅ Item {} complete", item.entity_ref),
                ItemOutcome::NeedsManualInput => {
                    info!("📝 Item {} needs manual input", item.entity_ref);
                }
                ItemOutcome::Failed(reason) => {
                    warn!("❌ Item {} failed: {}", item.entity_ref, reason);
                }
            }

            if let Err(e) = self.state.refresh_session_counts(session_id).await {
                warn!("Failed to refresh counts of session {}: {}", session_id, e);
            }
            if processed % self.checkpoint_every == 0 {
                if let Err(e) = self.state.create_checkpoint(session_id, item).await {
                    warn!("Failed to write checkpoint for {}: {}", item.id, e);
                }
            }
        }

        if let Some(outcome) = self.interruption(session_id).await? {
            return self.finish(session_id, outcome, processed).await;
        }

        let remaining = self.state.list_pending_items(session_id).await?;
        if !remaining.is_empty() {
            // requeued while we were running; leave it for the next resume
            warn!(
                "Session {} still has {} pending items; pausing",
                session_id,
                remaining.len()
            );
            if let Err(e) = self
                .state
                .update_session_status(session_id, SessionStatus::Paused)
                .await
            {
                warn!("Could not pause session {}: {}", session_id, e);
            }
            return self.finish(session_id, RunOutcome::Paused, processed).await;
        }

        match self
            .state
            .update_session_status(session_id, SessionStatus::Complete)
            .await
        {
            Ok(_) => {
                info!("🏁 Session {} complete ({} items this run)", session_id, processed);
                self.finish(session_id, RunOutcome::Completed, processed).await
            }
            Err(e) => {
                // paused or cancelled after the last boundary check
                warn!("Session {} not marked complete: {}", session_id, e);
                let outcome = match self.interruption(session_id).await {
                    Ok(Some(outcome)) => outcome,
                    Ok(None) | Err(_) => RunOutcome::Paused,
                };
                self.finish(session_id, outcome, processed).await
            }
        }
    }

    /// One item through the six phases; never fails the session
    pub async fn process_item(&self, item: &Item) -> ItemOutcome {
        match self.drive_item(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self
                    .state
                    .update_item_status(&item.id, ItemStatus::Error, Some(&message))
                    .await
                {
                    error!("Failed to record error on item {}: {}", item.id, store_err);
                }
                ItemOutcome::Failed(message)
            }
        }
    }

    async fn drive_item(&self, item: &Item) -> Result<ItemOutcome> {
        // 1. health check
        self.set_phase(item, ItemStatus::CheckingHealth).await?;
        let recoveries_before = self.health.stats().recoveries;
        let session = self.health.ensure_healthy().await?;
        let recovered = self.health.stats().recoveries > recoveries_before;

        // 2. idempotency check + 3. extraction
        let payload = match &item.payload {
            Some(payload) => {
                debug!("Extraction already stored; skipping to transform");
                payload.clone()
            }
            None => {
                self.set_phase(item, ItemStatus::Extracting).await?;
                self.extract(item, session, recovered).await?
            }
        };

        // 4. transform
        self.set_phase(item, ItemStatus::Transforming).await?;
        let transformed = self
            .retry
            .execute("transform", |_| {
                let limit = self.transform_timeout;
                let call = self.transformer.transform(&item.entity_ref, &payload);
                async move {
                    tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or_else(|_| Err(BatchError::timeout("transform", limit)))
                }
            })
            .await;
        self.record_samples(item, OperationKind::Transform, &transformed).await;
        self.state
            .add_item_retries(&item.id, transformed.attempts.saturating_sub(1))
            .await?;

        // 5. commit
        match transformed.result? {
            TransformOutcome::NeedsInput { missing_fields } => {
                let message = format!("missing fields: {}", missing_fields.join(", "));
                self.state
                    .update_item_status(&item.id, ItemStatus::NeedsManualInput, Some(&message))
                    .await?;
                Ok(ItemOutcome::NeedsManualInput)
            }
            TransformOutcome::AlreadyCommitted { existing_ids } => {
                self.set_phase(item, ItemStatus::Committing).await?;
                let committed = self
                    .retry
                    .execute("commit", |_| {
                        self.coordinator.complete_existing(&item.id, &existing_ids)
                    })
                    .await;
                self.record_samples(item, OperationKind::Commit, &committed).await;
                committed.result?;
                Ok(ItemOutcome::Complete)
            }
            TransformOutcome::Ready(record) => {
                self.set_phase(item, ItemStatus::Committing).await?;
                let committed = self
                    .retry
                    .execute("commit", |_| self.coordinator.commit(&item.id, &record))
                    .await;
                self.record_samples(item, OperationKind::Commit, &committed).await;
                committed.result?;
                Ok(ItemOutcome::Complete)
            }
        }
    }

    /// Retry-wrapped extraction bounded by the adaptive timeout.
    ///
    /// A crash signature on one attempt lets the next attempt recover the
    /// remote session, unless the health check of this item already did.
    async fn extract(
        &self,
        item: &Item,
        session: Arc<dyn RemoteSession>,
        recovered: bool,
    ) -> Result<RawPayload> {
        let timeout = self.estimator.current_timeout();
        debug!("Extraction timeout {:?}", timeout);

        let handle = Mutex::new(session);
        let crashed = AtomicBool::new(false);
        let recovery_used = AtomicBool::new(recovered);

        let outcome = self
            .retry
            .execute("extract", |attempt| {
                let (handle, crashed, recovery_used) = (&handle, &crashed, &recovery_used);
                async move {
                    if attempt > 1
                        && crashed.load(Ordering::SeqCst)
                        && !recovery_used.swap(true, Ordering::SeqCst)
                    {
                        let fresh = self.health.ensure_healthy().await?;
                        *lock(handle) = fresh;
                    }
                    let session = lock(handle).clone();
                    let result = match tokio::time::timeout(
                        timeout,
                        self.extractor
                            .extract(session.as_ref(), &item.entity_ref, timeout),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(BatchError::timeout("extract", timeout)),
                    };
                    if let Err(e) = &result {
                        crashed.store(e.is_session_crash(), Ordering::SeqCst);
                    }
                    result
                }
            })
            .await;

        self.record_samples(item, OperationKind::Extract, &outcome).await;
        if let Some(elapsed) = outcome.success_elapsed {
            self.estimator.record_success(elapsed);
        }
        self.state
            .add_item_retries(&item.id, outcome.attempts.saturating_sub(1))
            .await?;

        let payload = outcome.result?;
        // persisted before any later phase runs
        self.state.update_item_payload(&item.id, &payload).await?;
        Ok(payload)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn claim(&self, session_id: &str) -> Result<ActiveRun<'_>> {
        let mut active = lock(&self.active);
        if let Some(current) = active.as_ref() {
            return Err(BatchError::SessionBusy(current.clone()));
        }
        *active = Some(session_id.to_string());
        Ok(ActiveRun { slot: &self.active })
    }

    fn signal(&self, session_id: &str, signal: ControlSignal) {
        if self.active_session().as_deref() == Some(session_id) {
            lock(&self.signals).insert(session_id.to_string(), signal);
        }
    }

    /// Checked between items: in-process signals first, then the stored status
    async fn interruption(&self, session_id: &str) -> Result<Option<RunOutcome>> {
        if let Some(signal) = lock(&self.signals).remove(session_id) {
            return Ok(Some(match signal {
                ControlSignal::Pause => RunOutcome::Paused,
                ControlSignal::Cancel => RunOutcome::Cancelled,
            }));
        }
        let session = self.require_session(session_id).await?;
        Ok(match session.status {
            SessionStatus::Running => None,
            SessionStatus::Idle => Some(RunOutcome::Cancelled),
            other => {
                info!("Session {} is now {}; stopping", session_id, other);
                Some(RunOutcome::Paused)
            }
        })
    }

    async fn finish(
        &self,
        session_id: &str,
        outcome: RunOutcome,
        processed: u32,
    ) -> Result<RunSummary> {
        self.health.release().await;
        let counts = self.state.refresh_session_counts(session_id).await?;
        if outcome != RunOutcome::Completed {
            info!("Session {} stopped ({:?}) after {} items", session_id, outcome, processed);
        }
        Ok(RunSummary {
            session_id: session_id.to_string(),
            outcome,
            processed,
            counts,
        })
    }

    async fn seed_estimator(&self) {
        if !self.seed_from_history || !self.estimator.is_empty() {
            return;
        }
        match self
            .state
            .recent_successful_durations(OperationKind::Extract, self.window_size)
            .await
        {
            Ok(durations) => self
                .estimator
                .seed(durations.into_iter().map(Duration::from_millis)),
            Err(e) => warn!("Could not seed timeout estimator: {}", e),
        }
    }

    async fn set_phase(&self, item: &Item, status: ItemStatus) -> Result<()> {
        self.state.update_item_status(&item.id, status, None).await
    }

    /// One success sample and at most one aggregated failure sample per phase
    async fn record_samples<T>(
        &self,
        item: &Item,
        operation: OperationKind,
        outcome: &RetryOutcome<T>,
    ) {
        let mut samples = Vec::with_capacity(2);
        if outcome.failed_attempts() > 0 {
            samples.push((outcome.failed_elapsed, false));
        }
        if let Some(elapsed) = outcome.success_elapsed {
            samples.push((elapsed, true));
        }
        for (duration, success) in samples {
            let sample = NewPerformanceSample {
                session_id: item.session_id.clone(),
                item_id: Some(item.id.clone()),
                operation,
                duration_ms: duration.as_millis() as u64,
                success,
            };
            if let Err(e) = self.state.record_performance_sample(&sample).await {
                warn!("Failed to record {} sample: {}", operation, e);
            }
        }
    }

    async fn mark_failed(&self, session_id: &str) {
        if let Err(e) = self
            .state
            .update_session_status(session_id, SessionStatus::Failed)
            .await
        {
            error!("Failed to mark session {} failed: {}", session_id, e);
        }
    }

    async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.admin.require_session(session_id).await
    }
}

//! Remote session health monitoring and recovery
//!
//! 헬스 체크는 고정된 짧은 타임아웃으로 no-op 왕복을 수행한다.
//! A classified crash triggers at most one recovery per call: a fresh handle
//! is acquired from the provider and probed again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::collaborators::{RemoteSession, SessionProvider};
use crate::domain::errors::{BatchError, Result};

/// Result of one probe against one handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Crash signature or probe timeout: the handle is gone
    Crashed(String),
    /// Failed without a crash signature; recovery would not help
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthStats {
    pub probes: u64,
    pub failures: u64,
    pub recoveries: u64,
}

pub struct HealthMonitor {
    provider: Arc<dyn SessionProvider>,
    session: RwLock<Option<Arc<dyn RemoteSession>>>,
    probe_timeout: Duration,
    probes: AtomicU64,
    failures: AtomicU64,
    recoveries: AtomicU64,
}

impl HealthMonitor {
    pub fn new(provider: Arc<dyn SessionProvider>, probe_timeout: Duration) -> Self {
        Self {
            provider,
            session: RwLock::new(None),
            probe_timeout,
            probes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    pub async fn current_session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session.read().await.clone()
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            probes: self.probes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Trivial round-trip bounded by the fixed probe timeout
    pub async fn probe(&self, session: &dyn RemoteSession) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let outcome = match tokio::time::timeout(self.probe_timeout, session.ping()).await {
            Ok(Ok(())) => ProbeOutcome::Healthy,
            Err(_) => ProbeOutcome::Crashed(format!(
                "health probe timed out after {:?}",
                self.probe_timeout
            )),
            Ok(Err(e)) if e.is_session_crash() || matches!(e, BatchError::Timeout { .. }) => {
                ProbeOutcome::Crashed(e.to_string())
            }
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
        };
        if outcome != ProbeOutcome::Healthy {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Return a usable handle, recovering at most once.
    ///
    /// Fails with `BatchError::Unhealthy` when no usable handle could be obtained;
    /// the next call starts over with a fresh acquisition.
    pub async fn ensure_healthy(&self) -> Result<Arc<dyn RemoteSession>> {
        let current = self.current_session().await;

        if let Some(session) = &current {
            match self.probe(session.as_ref()).await {
                ProbeOutcome::Healthy => {
                    debug!("💚 Remote session healthy: {}", session.handle_id());
                    return Ok(session.clone());
                }
                ProbeOutcome::Failed(reason) => {
                    warn!("⚠️ Remote session unhealthy (no crash signature): {}", reason);
                    return Err(BatchError::Unhealthy(reason));
                }
                ProbeOutcome::Crashed(reason) => {
                    warn!("💥 Remote session crashed: {} ({})", session.handle_id(), reason);
                }
            }
        }

        self.recover(current).await
    }

    async fn recover(&self, old: Option<Arc<dyn RemoteSession>>) -> Result<Arc<dyn RemoteSession>> {
        let is_recovery = old.is_some();
        if let Some(old) = old {
            self.provider.release(old).await;
        }

        let fresh = match self.provider.acquire().await {
            Ok(fresh) => fresh,
            Err(e) => {
                *self.session.write().await = None;
                error!("❌ Failed to acquire remote session: {}", e);
                return Err(BatchError::Unhealthy(format!("acquire failed: {e}")));
            }
        };

        match self.probe(fresh.as_ref()).await {
            ProbeOutcome::Healthy => {
                if is_recovery {
                    self.recoveries.fetch_add(1, Ordering::Relaxed);
                    info!("🔧 Remote session recovered: {}", fresh.handle_id());
                } else {
                    info!("🌐 Remote session ready: {}", fresh.handle_id());
                }
                *self.session.write().await = Some(fresh.clone());
                Ok(fresh)
            }
            ProbeOutcome::Crashed(reason) | ProbeOutcome::Failed(reason) => {
                *self.session.write().await = None;
                self.provider.release(fresh).await;
                error!("❌ Fresh remote session failed its health check: {}", reason);
                Err(BatchError::Unhealthy(format!("fresh handle unhealthy: {reason}")))
            }
        }
    }

    /// Drop and release the current handle, e.g. at the end of a run
    pub async fn release(&self) {
        let current = self.session.write().await.take();
        if let Some(session) = current {
            self.provider.release(session).await;
        }
    }
}

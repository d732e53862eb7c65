//! Application layer module
//!
//! Orchestration on top of the domain seams: the batch controller and the
//! resilience components it consumes.

pub mod batch_controller;
pub mod commit_coordinator;
pub mod health_monitor;
pub mod retry_policy;
pub mod session_admin;
pub mod timeout_estimator;

pub use batch_controller::{BatchController, Collaborators, ItemOutcome, RunOutcome, RunSummary};
pub use commit_coordinator::{CommitCoordinator, CommitInterceptor, CommitStage};
pub use health_monitor::{HealthMonitor, HealthStats, ProbeOutcome};
pub use retry_policy::{RetryOutcome, RetryPolicy};
pub use session_admin::SessionAdmin;
pub use timeout_estimator::TimeoutEstimator;

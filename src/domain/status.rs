//! Closed status types for sessions and items
//!
//! 세션/아이템 상태는 문자열이 아닌 닫힌 enum으로만 다룬다.
//! Persisted as lowercase kebab-case strings; anything else is rejected on read.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::errors::BatchError;

/// Lifecycle state of one batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Idle,
    Loading,
    Ready,
    Running,
    Paused,
    Complete,
    Failed,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Sessions a caller may resume (`ready` is the persisted "queued" state)
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Paused)
    }

    /// Allowed lifecycle edges.
    ///
    /// `idle → loading → ready → running → {paused, complete, failed}`,
    /// `paused → running`, `running → idle` on cancel. Two extra edges exist:
    /// `ready → paused` (pause before the first run) and `complete → paused`
    /// (an item was requeued after the run finished).
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::{Complete, Failed, Idle, Loading, Paused, Ready, Running};
        matches!(
            (self, next),
            (Idle, Loading)
                | (Loading, Ready | Failed)
                | (Ready, Running | Paused | Failed | Idle)
                | (Running, Running | Paused | Complete | Failed | Idle)
                | (Paused, Running | Paused | Idle)
                | (Complete, Paused)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "loading" => Ok(Self::Loading),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(BatchError::UnknownStatus(other.to_string())),
        }
    }
}

/// Per-phase status of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Queued,
    CheckingHealth,
    Extracting,
    Transforming,
    Committing,
    Complete,
    NeedsManualInput,
    Error,
    /// Abandoned by an operator; never picked up again
    Skipped,
}

impl ItemStatus {
    pub const ALL: [Self; 9] = [
        Self::Queued,
        Self::CheckingHealth,
        Self::Extracting,
        Self::Transforming,
        Self::Committing,
        Self::Complete,
        Self::NeedsManualInput,
        Self::Error,
        Self::Skipped,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::CheckingHealth => "checking-health",
            Self::Extracting => "extracting",
            Self::Transforming => "transforming",
            Self::Committing => "committing",
            Self::Complete => "complete",
            Self::NeedsManualInput => "needs-manual-input",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// The item is done for the current run and the controller may move on
    pub const fn is_terminal_for_run(self) -> bool {
        match self {
            Self::Complete | Self::NeedsManualInput | Self::Error | Self::Skipped => true,
            Self::Queued
            | Self::CheckingHealth
            | Self::Extracting
            | Self::Transforming
            | Self::Committing => false,
        }
    }

    /// Once reached, the row is never mutated again
    pub const fn is_immutable(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// Picked up by `run`/`resume`; intermediate phases mean a crash mid-item
    pub const fn is_pending(self) -> bool {
        !self.is_terminal_for_run()
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BatchError::UnknownStatus(s.to_string()))
    }
}

/// Kind of timed operation recorded as a performance sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Extract,
    Transform,
    Commit,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Self::Extract),
            "transform" => Ok(Self::Transform),
            "commit" => Ok(Self::Commit),
            other => Err(BatchError::UnknownStatus(other.to_string())),
        }
    }
}

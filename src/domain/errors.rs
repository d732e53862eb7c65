//! Error taxonomy for the batch engine
//!
//! 에러 분류 체계:
//! 1. transient-remote  → 재시도 (timeout, connection, DNS, crash signature, protocol)
//! 2. terminal-remote   → 즉시 실패 (not-found, forbidden, invalid input)
//! 3. incomplete domain data is NOT an error (see `TransformOutcome::NeedsInput`)
//! 4. store-write failure → rollback, item unchanged

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::status::SessionStatus;

pub type Result<T, E = BatchError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Remote session crashed: {0}")]
    SessionCrashed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Raw message from a collaborator, classified by signature
    #[error("{0}")]
    Remote(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<BatchError> },

    #[error("Remote session unhealthy: {0}")]
    Unhealthy(String),

    #[error("Commit partially applied (primary ids {created_ids:?}): {reason}")]
    PartialCommit {
        created_ids: Vec<String>,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown status value: {0}")]
    UnknownStatus(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Item {0} is immutable")]
    ItemImmutable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Session {0} is already being driven")]
    SessionBusy(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Outcome of classifying an error for the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Retryable(RetryableKind),
    Terminal(TerminalKind),
}

impl ErrorClass {
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryableKind {
    Timeout,
    Connection,
    Dns,
    SessionCrash,
    Protocol,
    StoreBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalKind {
    NotFound,
    AccessDenied,
    InvalidInput,
    Exhausted,
    Store,
    Internal,
    /// No known signature matched; treated as final
    Unclassified,
}

impl BatchError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Retryable(RetryableKind::Timeout),
            Self::Connection(_) => ErrorClass::Retryable(RetryableKind::Connection),
            Self::Dns(_) => ErrorClass::Retryable(RetryableKind::Dns),
            Self::SessionCrashed(_) => ErrorClass::Retryable(RetryableKind::SessionCrash),
            Self::Protocol(_) => ErrorClass::Retryable(RetryableKind::Protocol),
            Self::NotFound(_) => ErrorClass::Terminal(TerminalKind::NotFound),
            Self::AccessDenied(_) => ErrorClass::Terminal(TerminalKind::AccessDenied),
            Self::InvalidInput(_) => ErrorClass::Terminal(TerminalKind::InvalidInput),
            Self::Remote(message) => classify_message(message)
                .unwrap_or(ErrorClass::Terminal(TerminalKind::Unclassified)),
            Self::RetriesExhausted { .. } => ErrorClass::Terminal(TerminalKind::Exhausted),
            Self::Database(e) => classify_sqlx(e),
            // A partial commit must not be replayed blindly; duplicate detection handles it
            Self::PartialCommit { .. } | Self::Io(_) | Self::Serialization(_) => {
                ErrorClass::Terminal(TerminalKind::Store)
            }
            Self::Unhealthy(_)
            | Self::UnknownStatus(_)
            | Self::InvalidTransition { .. }
            | Self::ItemImmutable(_)
            | Self::SessionNotFound(_)
            | Self::ItemNotFound(_)
            | Self::SessionBusy(_)
            | Self::Config(_) => ErrorClass::Terminal(TerminalKind::Internal),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// Whether this error means the remote session itself is gone
    pub fn is_session_crash(&self) -> bool {
        match self {
            Self::SessionCrashed(_) => true,
            Self::Remote(message) | Self::Protocol(message) => is_crash_signature(message),
            _ => false,
        }
    }
}

fn classify_sqlx(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::PoolTimedOut => ErrorClass::Retryable(RetryableKind::StoreBusy),
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            if message.contains("locked") || message.contains("busy") {
                ErrorClass::Retryable(RetryableKind::StoreBusy)
            } else {
                ErrorClass::Terminal(TerminalKind::Store)
            }
        }
        _ => ErrorClass::Terminal(TerminalKind::Store),
    }
}

/// Known message signatures, checked in order (crash before DNS before "not found").
const SIGNATURE_PATTERNS: &[(&str, ErrorClass)] = &[
    (
        r"(?i)target(\s+page,\s+context\s+or\s+browser)?\s+(has\s+been\s+)?closed",
        ErrorClass::Retryable(RetryableKind::SessionCrash),
    ),
    (
        r"(?i)session\s+(closed|deleted|not\s+created)|session\s+with\s+given\s+id\s+not\s+found|invalid\s+session\s+id|no\s+such\s+(window|session)",
        ErrorClass::Retryable(RetryableKind::SessionCrash),
    ),
    (
        r"(?i)browser\s+has\s+(been\s+)?disconnected|websocket\s+(is\s+not\s+open|closed|disconnected)",
        ErrorClass::Retryable(RetryableKind::SessionCrash),
    ),
    (
        r"(?i)execution\s+context\s+(was\s+)?destroyed|cannot\s+find\s+context\s+with\s+specified\s+id|frame\s+(was\s+)?detached",
        ErrorClass::Retryable(RetryableKind::SessionCrash),
    ),
    (
        r"(?i)\benotfound\b|\beai_again\b|getaddrinfo|err_name_not_resolved|dns\s+(error|resolution|lookup)|failed\s+to\s+lookup\s+address",
        ErrorClass::Retryable(RetryableKind::Dns),
    ),
    (
        r"(?i)timed?\s*out|timeout|deadline\s+exceeded",
        ErrorClass::Retryable(RetryableKind::Timeout),
    ),
    (
        r"(?i)\beconnreset\b|\beconnrefused\b|connection\s+(reset|refused|aborted)|broken\s+pipe|err_connection_\w+|network\s+is\s+unreachable",
        ErrorClass::Retryable(RetryableKind::Connection),
    ),
    (
        r"(?i)protocol\s+error|\bcdp\s+error",
        ErrorClass::Retryable(RetryableKind::Protocol),
    ),
    (
        r"(?i)\b40[13]\b|forbidden|access\s+denied|unauthori[sz]ed|permission\s+denied",
        ErrorClass::Terminal(TerminalKind::AccessDenied),
    ),
    (
        r"(?i)\b404\b|not\s+found|no\s+such\s+(entity|record|resource)",
        ErrorClass::Terminal(TerminalKind::NotFound),
    ),
    (
        r"(?i)\b400\b|bad\s+request|malformed|invalid\s+(reference|input|argument|url|id)",
        ErrorClass::Terminal(TerminalKind::InvalidInput),
    ),
];

static SIGNATURES: Lazy<Vec<(Regex, ErrorClass)>> = Lazy::new(|| {
    SIGNATURE_PATTERNS
        .iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, *class)))
        .collect()
});

/// Classify a free-form error message by known signatures
pub fn classify_message(message: &str) -> Option<ErrorClass> {
    SIGNATURES
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, class)| *class)
}

/// Session/target destroyed, protocol-level disconnect, execution context gone
pub fn is_crash_signature(message: &str) -> bool {
    classify_message(message) == Some(ErrorClass::Retryable(RetryableKind::SessionCrash))
}

//! Error types for jobmirror

use std::fmt;

use thiserror::Error;

/// Result type alias for jobmirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Classification of a failed remote mirror call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Credentials rejected or expired beyond refresh
    Auth,
    /// Credentials valid but not allowed to touch the target
    Permission,
    /// Target (or sheet) does not exist
    NotFound,
    /// Sheet creation raced with another writer
    AlreadyExists,
    /// Remote quota exceeded (HTTP 429)
    Throttled,
    /// Timeouts, connection resets, 5xx
    Transient,
    /// Request rejected as malformed
    InvalidRequest,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Auth => "auth",
            RemoteErrorKind::Permission => "permission",
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::AlreadyExists => "already_exists",
            RemoteErrorKind::Throttled => "throttled",
            RemoteErrorKind::Transient => "transient",
            RemoteErrorKind::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

/// Main error type for jobmirror
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "sheets")]
    Http(#[from] reqwest::Error),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Build a remote error of the given kind
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        MirrorError::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Remote error kind, if this is a remote failure
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            MirrorError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            MirrorError::Remote { kind, .. } => {
                matches!(kind, RemoteErrorKind::Throttled | RemoteErrorKind::Transient)
            }
            MirrorError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "sheets")]
            MirrorError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            MirrorError::Io(_) => true,
            _ => false,
        }
    }

    /// Auth, permission and missing-target failures: never retried, escalated
    /// straight into health state.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.remote_kind(),
            Some(RemoteErrorKind::Auth | RemoteErrorKind::Permission | RemoteErrorKind::NotFound)
        ) || matches!(self, MirrorError::Config(_))
    }
}

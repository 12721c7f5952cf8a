//! Error types for recall-core.

use thiserror::Error;

/// Result type alias using recall-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for memory operations
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (never retried)
    #[error("Validation error: {0}")]
    Validation(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Transport errors
    #[error("HTTP error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    BackendUnavailable {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // Background sync errors
    #[error("Sync already running{}", pid.map(|p| format!(" (PID: {p})")).unwrap_or_default())]
    SyncAlreadyRunning { pid: Option<u32> },

    // External collaborator errors (text generation, extraction)
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Http {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a collaborator error
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Create an HTTP error carrying a response status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether the error may succeed on retry.
    ///
    /// Timeouts, connection failures, lock contention, SQLite busy/locked and
    /// HTTP 408/429/5xx are transient. Everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::LockContention(_) => true,
            Self::Http { status: None, .. } => true,
            Self::Http {
                status: Some(status),
                ..
            } => *status == 408 || *status == 429 || *status >= 500,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this is a backend-unavailable error
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

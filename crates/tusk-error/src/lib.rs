//! Primary error type for tuskdb operations.
//!
//! Structured variants for the cases callers dispatch on (missing objects,
//! corruption, busy handles), a generic `Internal` for invariant violations.

use thiserror::Error;

/// Primary error type for tuskdb operations.
#[derive(Error, Debug)]
pub enum TuskError {
    /// Object does not exist (dropped between catalog scan and open, or a
    /// history-store entry vanished between search and re-read).
    #[error("object not found: '{uri}'")]
    NotFound { uri: String },

    /// Object-level corruption detected while reading.
    #[error("object is corrupted: '{uri}': {detail}")]
    Corruption { uri: String, detail: String },

    /// A data handle could not be acquired.
    #[error("'{uri}': unable to open handle, handle is unavailable due to concurrent use")]
    Busy { uri: String },

    /// Rollback-to-stable was invoked while user transactions were running.
    #[error("rollback_to_stable illegal with active transactions")]
    ActiveTransactions,

    /// A prepared update was encountered where none can exist.
    #[error("unexpected prepare conflict")]
    PrepareConflict,

    /// Malformed metadata configuration string.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TuskError {
    /// Create a not-found error.
    pub fn not_found(uri: impl Into<String>) -> Self {
        Self::NotFound { uri: uri.into() }
    }

    /// Create a corruption error.
    pub fn corruption(uri: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corruption {
            uri: uri.into(),
            detail: detail.into(),
        }
    }

    /// Create a busy error.
    pub fn busy(uri: impl Into<String>) -> Self {
        Self::Busy { uri: uri.into() }
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a per-object failure of this kind may be logged and skipped
    /// while the remaining objects are still processed.
    ///
    /// Missing objects are always skippable; corruption is skippable only
    /// when the engine tolerates data corruption.
    #[must_use]
    pub const fn is_object_skippable(&self, tolerate_corruption: bool) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Corruption { .. } => tolerate_corruption,
            _ => false,
        }
    }
}

/// Result type alias using `TuskError`.
pub type Result<T> = std::result::Result<T, TuskError>;

//! Error types for the transactional resource manager.
//!
//! Every driver failure that crosses the crate boundary is reduced to the
//! semantic [`TxError`] taxonomy. Classification happens in exactly one place
//! (the [`crate::translator`] module); classified variants keep the raw
//! [`DriverError`] as their source, so the cause chain of any error produced
//! here terminates at the original driver failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure reported by a database driver.
///
/// `code` is the vendor-specific error code ("23505" on H2/PostgreSQL,
/// "1062" on MySQL, and so on). Drivers that cannot produce a code leave it
/// unset and the translator classifies the failure as [`ErrorKind::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Vendor-specific error code, if the driver reported one.
    pub code: Option<String>,
    /// Driver-supplied message text.
    pub message: String,
}

impl DriverError {
    /// Create a driver error carrying a vendor code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Create a driver error without a vendor code.
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// Semantic classification of a failure.
///
/// Dialect tables map vendor codes to these kinds, which is why the enum is
/// serde data rather than plain type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No connection available within the acquire timeout.
    PoolExhausted,
    /// A leased or freshly opened connection failed validation.
    ConnectionInvalid,
    /// Uniqueness constraint violated.
    DuplicateKey,
    /// Other constraint violated (foreign key, not-null, check).
    DataIntegrityViolation,
    /// Malformed statement.
    SyntaxError,
    /// Driver-reported transient condition (lock timeout, deadlock).
    TransientError,
    /// Operation attempted against a descriptor that is no longer active.
    TransactionClosed,
    /// A context already holds an unresolvable binding.
    AlreadyBound,
    /// Unmapped driver code.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::ConnectionInvalid => "connection_invalid",
            Self::DuplicateKey => "duplicate_key",
            Self::DataIntegrityViolation => "data_integrity_violation",
            Self::SyntaxError => "syntax_error",
            Self::TransientError => "transient_error",
            Self::TransactionClosed => "transaction_closed",
            Self::AlreadyBound => "already_bound",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Semantic error produced by the resource manager.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("no connection available within {waited_ms}ms (pool exhausted)")]
    PoolExhausted { waited_ms: u64 },

    #[error("{message}")]
    ConnectionInvalid {
        message: String,
        #[source]
        cause: Option<DriverError>,
    },

    #[error("{message}")]
    DuplicateKey {
        message: String,
        #[source]
        cause: DriverError,
    },

    #[error("{message}")]
    DataIntegrityViolation {
        message: String,
        #[source]
        cause: DriverError,
    },

    #[error("{message}")]
    SyntaxError {
        message: String,
        #[source]
        cause: DriverError,
    },

    #[error("{message}")]
    TransientError {
        message: String,
        #[source]
        cause: DriverError,
    },

    #[error("transaction {transaction_id} is {status} and no longer accepts operations")]
    TransactionClosed {
        transaction_id: String,
        status: String,
    },

    #[error("context {context} already has an active transaction bound")]
    AlreadyBound { context: String },

    #[error("{message}")]
    Unknown {
        message: String,
        #[source]
        cause: Option<DriverError>,
    },
}

impl TxError {
    /// Build the variant matching a classified kind.
    ///
    /// Only the statement-level kinds can come out of a dialect table; the
    /// control-flow kinds (pool exhaustion, closed transactions, bindings)
    /// are produced by the components that detect them, so a table entry
    /// naming one of those degrades to [`TxError::Unknown`].
    pub(crate) fn classified(kind: ErrorKind, message: String, cause: DriverError) -> Self {
        match kind {
            ErrorKind::DuplicateKey => Self::DuplicateKey { message, cause },
            ErrorKind::DataIntegrityViolation => Self::DataIntegrityViolation { message, cause },
            ErrorKind::SyntaxError => Self::SyntaxError { message, cause },
            ErrorKind::TransientError => Self::TransientError { message, cause },
            ErrorKind::ConnectionInvalid => Self::ConnectionInvalid {
                message,
                cause: Some(cause),
            },
            _ => Self::Unknown {
                message,
                cause: Some(cause),
            },
        }
    }

    /// The semantic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ConnectionInvalid { .. } => ErrorKind::ConnectionInvalid,
            Self::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Self::DataIntegrityViolation { .. } => ErrorKind::DataIntegrityViolation,
            Self::SyntaxError { .. } => ErrorKind::SyntaxError,
            Self::TransientError { .. } => ErrorKind::TransientError,
            Self::TransactionClosed { .. } => ErrorKind::TransactionClosed,
            Self::AlreadyBound { .. } => ErrorKind::AlreadyBound,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// The raw driver error this failure was classified from, if any.
    pub fn cause(&self) -> Option<&DriverError> {
        match self {
            Self::DuplicateKey { cause, .. }
            | Self::DataIntegrityViolation { cause, .. }
            | Self::SyntaxError { cause, .. }
            | Self::TransientError { cause, .. } => Some(cause),
            Self::ConnectionInvalid { cause, .. } | Self::Unknown { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolExhausted | ErrorKind::TransientError
        )
    }
}

/// Result type alias for resource manager operations.
pub type TxResult<T> = Result<T, TxError>;

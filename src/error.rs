//! Error types for pool and driver failures
//!
//! Two layers: [`DbError`] is the value a driver reports — message, SQLSTATE,
//! vendor code, category tag and an optional chained cause — and [`Error`] is
//! what the pool surfaces to callers (acquire timeouts, ownership violations,
//! forced rollbacks, or the underlying driver error).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// SQLSTATE values used when normalising non-driver failures.
pub mod sqlstate {
    /// Connection failure (class 08).
    pub const CONNECTION_FAILURE: &str = "08006";

    /// Connection does not exist.
    pub const CONNECTION_INVALID: &str = "08003";

    /// Dynamic SQL error (class 07).
    pub const DYNAMIC_SQL_ERROR: &str = "07000";
}

/// Category tag a driver attaches to an error, mirroring the subclass
/// hierarchy most drivers expose. Classification (see [`crate::classify`])
/// folds these into a disposition together with SQLSTATE and vendor code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCategory {
    /// No more specific category.
    #[default]
    General,
    /// The operation exceeded a driver-side timeout.
    Timeout,
    /// The failure may succeed if the operation is retried on a new connection.
    Recoverable,
    /// Authorization was rejected during connection setup.
    InvalidAuthorization,
    /// The connection is broken and reconnecting will not help.
    NonTransientConnection,
    /// The connection is broken but reconnecting may help.
    TransientConnection,
    /// The failure will recur until the cause is fixed.
    NonTransient,
    /// The transaction was rolled back by the database (deadlock, serialization).
    TransactionRollback,
    /// The driver does not support the requested feature.
    FeatureNotSupported,
}

/// A database driver error.
///
/// Carries the three inputs classification needs (SQLSTATE, vendor code,
/// category) plus a chained cause. Drivers build these with the fluent
/// constructors; the pool also uses them to normalise I/O and internal
/// failures into the same shape.
#[derive(Debug, Clone)]
pub struct DbError {
    message: String,
    state: Option<String>,
    vendor_code: i32,
    category: ErrorCategory,
    cause: Option<Box<DbError>>,
}

impl DbError {
    /// Create a new error with the given message and no further detail.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state: None,
            vendor_code: 0,
            category: ErrorCategory::General,
            cause: None,
        }
    }

    /// Normalised connection failure (SQLSTATE `08006`), used for I/O-level
    /// errors and failed opens.
    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::new(message).with_state(sqlstate::CONNECTION_FAILURE)
    }

    /// Normalised catch-all for non-driver failures (SQLSTATE `07000`).
    pub fn dynamic_sql(message: impl Into<String>) -> Self {
        Self::new(message).with_state(sqlstate::DYNAMIC_SQL_ERROR)
    }

    /// Error for an operation the driver does not support.
    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        Self::new(message).with_category(ErrorCategory::FeatureNotSupported)
    }

    /// Attach a SQLSTATE.
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Attach a vendor-specific error code.
    #[must_use]
    pub fn with_vendor_code(mut self, code: i32) -> Self {
        self.vendor_code = code;
        self
    }

    /// Attach a category tag.
    #[must_use]
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// Chain a causing error.
    #[must_use]
    pub fn with_cause(mut self, cause: DbError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The SQLSTATE, if the driver reported one.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// The vendor-specific error code (0 when absent).
    pub fn vendor_code(&self) -> i32 {
        self.vendor_code
    }

    /// The category tag.
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// The chained cause, if any.
    pub fn cause(&self) -> Option<&DbError> {
        self.cause.as_deref()
    }

    /// Whether this error reports an unsupported driver feature.
    pub fn is_unsupported(&self) -> bool {
        self.category == ErrorCategory::FeatureNotSupported
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => write!(f, "{} (state {}, code {})", self.message, state, self.vendor_code),
            None => write!(f, "{} (code {})", self.message, self.vendor_code),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::connection_failure(err.to_string())
    }
}

/// Errors surfaced to pool callers.
#[derive(Debug, Error)]
pub enum Error {
    /// The borrow deadline expired with no connection available.
    #[error("timed out after {timeout:?} waiting for a connection")]
    AcquireTimeout {
        /// The configured connection timeout that expired.
        timeout: Duration,
    },

    /// Opening a physical connection failed, or a connection-level
    /// (I/O-class) failure was captured on a live connection.
    #[error("connection failure: {0}")]
    ConnectionFailure(#[source] DbError),

    /// Release was attempted by a caller that does not own the connection.
    #[error("connection has already been released; pass the borrowed connection between calls instead of re-borrowing")]
    AlreadyReleased,

    /// Close found an uncommitted transaction and rolled it back before
    /// releasing the connection.
    #[error("executed forced rollback because the transaction was left uncommitted")]
    ForcedRollback,

    /// The pool has been shut down.
    #[error("pool is shut down")]
    PoolClosed,

    /// A driver error, classifiable via [`crate::classify`].
    #[error(transparent)]
    Db(DbError),
}

/// Convenience alias for pool results.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The underlying driver error, when this error carries one.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::ConnectionFailure(e) | Self::Db(e) => Some(e),
            _ => None,
        }
    }
}

/// Surface a driver error to the caller. Errors normalised to the
/// connection-failure SQLSTATE (failed opens, captured I/O failures) become
/// [`Error::ConnectionFailure`]; everything else passes through as
/// [`Error::Db`].
impl From<DbError> for Error {
    fn from(error: DbError) -> Self {
        if error.state() == Some(sqlstate::CONNECTION_FAILURE) {
            Self::ConnectionFailure(error)
        } else {
            Self::Db(error)
        }
    }
}

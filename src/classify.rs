//! Driver error classification
//!
//! Maps a [`DbError`] to a [`Disposition`] that decides whether the physical
//! connection is still trustworthy. `Communication` and `System` dispositions
//! poison the connection: it fails validation afterwards and is retired on the
//! next borrow or release. `NoData` and `Application` leave the connection in
//! service and surface the error to the caller.

use crate::error::{DbError, ErrorCategory};

/// Maximum number of chained causes walked before giving up.
const MAX_CAUSE_DEPTH: usize = 10;

/// SQLSTATEs outside class 08 that still indicate a lost or dying connection.
const DISCONNECT_STATES: &[&str] = &[
    "01002", "66000", "69000", "57P01", "57P02", "57P03", "JZ0C0", "JZ0C1",
];

/// Vendor codes that indicate a lost connection.
const DISCONNECT_CODES: &[i32] = &[2399, 500_150];

/// SQLSTATEs that indicate a database-side system failure.
const SYSTEM_STATES: &[&str] = &["0A000", "60000", "61000"];

/// Vendor codes that indicate a database-side system failure.
const SYSTEM_CODES: &[i32] = &[600];

/// The outcome of classifying a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The query legitimately produced no data (SQLSTATE class 02).
    NoData,
    /// The physical connection is suspect and must be retired.
    Communication,
    /// The database reported a system-level failure; the connection must be
    /// retired.
    System,
    /// An ordinary application-level failure; the connection stays in service.
    Application,
}

impl Disposition {
    /// Whether a connection that produced this disposition must be retired.
    #[must_use]
    pub const fn poisons_connection(self) -> bool {
        matches!(self, Self::Communication | Self::System)
    }

    /// Short name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoData => "no-data",
            Self::Communication => "communication",
            Self::System => "system",
            Self::Application => "application",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a driver error.
///
/// Walks the chained-cause list up to [`MAX_CAUSE_DEPTH`] links and returns
/// the first non-[`Application`](Disposition::Application) disposition found.
/// Rules are applied in order on each link: class-02 SQLSTATE first, then the
/// communication criteria, then the system criteria.
pub fn classify(error: &DbError) -> Disposition {
    let mut current = Some(error);

    for _ in 0..MAX_CAUSE_DEPTH {
        let Some(err) = current else { break };
        let state = err.state().unwrap_or("");

        if state.starts_with("02") {
            return Disposition::NoData;
        }

        if state.starts_with("08")
            || DISCONNECT_STATES.contains(&state)
            || DISCONNECT_CODES.contains(&err.vendor_code())
            || matches!(
                err.category(),
                ErrorCategory::Timeout
                    | ErrorCategory::Recoverable
                    | ErrorCategory::InvalidAuthorization
                    | ErrorCategory::NonTransientConnection
                    | ErrorCategory::TransientConnection
            )
        {
            return Disposition::Communication;
        }

        if SYSTEM_STATES.contains(&state)
            || SYSTEM_CODES.contains(&err.vendor_code())
            || matches!(
                err.category(),
                ErrorCategory::NonTransient | ErrorCategory::TransactionRollback
            )
        {
            return Disposition::System;
        }

        current = err.cause();
    }

    Disposition::Application
}

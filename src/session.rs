//! Session preparation hooks and clock-skew tracking
//!
//! A [`SessionController`] runs once per successful open to execute any
//! session preamble (identifiers, tracing context, sequence setup) and report
//! the database clock skew. A [`StatementEnhancer`] can substitute prepared
//! statements and provide a database-side clock. Both are optional plug-ins;
//! the pool only defines the contract.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::driver::{RawConnection, RawStatement};
use crate::error::DbError;

/// Data returned by a [`SessionController`] after preparing a session.
#[derive(Debug, Clone)]
pub struct SessionData {
    /// Database-side session identifier, used in telemetry.
    pub session_id: String,
    /// Observed clock skew sample between process and database, in
    /// milliseconds.
    pub time_delta_millis: i64,
}

/// Performs additional actions on a raw connection when it is opened, to
/// prepare the session for use.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Prepare the session. Raising a driver error fails the open; the pool
    /// closes the raw connection and propagates the error.
    async fn prepare_session(
        &self,
        config: &PoolConfig,
        connection: &mut dyn RawConnection,
    ) -> Result<SessionData, DbError>;
}

/// Optional hook that can substitute prepared statements and provide a
/// database-side clock.
#[async_trait]
pub trait StatementEnhancer: Send + Sync {
    /// Produce a replacement statement for the given text and key columns,
    /// or `None` to let the default prepare path run.
    async fn statement(
        &self,
        connection: &mut dyn RawConnection,
        text: &str,
        key_columns: &[String],
    ) -> Result<Option<Box<dyn RawStatement>>, DbError>;

    /// Database-side wall-clock time in milliseconds since the epoch, when
    /// the enhancer can provide one. Consulted by
    /// [`Connection::system_timestamp`](crate::Connection::system_timestamp),
    /// which falls back to the local clock adjusted by the shared
    /// [`TimeDelta`].
    fn system_time_millis(&self) -> Option<i64> {
        None
    }
}

/// Thread-safe running average of the clock skew between this process and the
/// database.
///
/// The first sample is stored as-is; each further sample `s` folds in as
/// `(previous + s) / 2`.
#[derive(Debug, Default)]
pub struct TimeDelta {
    delta: Mutex<i64>,
}

impl TimeDelta {
    /// Create a zeroed tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current running value in milliseconds.
    pub fn get(&self) -> i64 {
        *self.delta.lock().expect("time delta lock poisoned")
    }

    /// Fold a new sample in and return the updated value.
    pub fn update(&self, sample: i64) -> i64 {
        let mut delta = self.delta.lock().expect("time delta lock poisoned");
        *delta = if *delta == 0 { sample } else { (*delta + sample) / 2 };
        *delta
    }
}

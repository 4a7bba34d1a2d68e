//! Connection wrapper and pooled entry
//!
//! [`Entry`] is the pool-side record of one physical connection: identity,
//! age, owner, captured failure, commit-pending flag, statement cache and the
//! driver handle itself. [`Connection`] is the caller-facing handle returned
//! by a borrow; it exposes the driver-connection surface by delegation, times
//! every operation, captures failures for validation, and turns `close` into
//! a release back to the pool — forcing a rollback first when a transaction
//! was left uncommitted.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::classify::classify;
use crate::config::PoolConfig;
use crate::driver::{Driver, RawConnection, RawStatement};
use crate::error::{DbError, Error, Result};
use crate::metadata::Metadata;
use crate::pool::{CallerId, PoolShared};
use crate::session::{SessionController, SessionData, TimeDelta};
use crate::statement::{self, LruCache, Statement, StatementInner};

pub(crate) struct EntryState {
    pub(crate) raw: Option<Box<dyn RawConnection>>,
    pub(crate) statements: LruCache<Arc<StatementInner>>,
}

/// Pool-side record of one physical connection.
pub(crate) struct Entry {
    id: u64,
    created_at: Instant,
    config: Arc<PoolConfig>,
    owner: StdMutex<Option<CallerId>>,
    commit_pending: AtomicBool,
    last_error: StdMutex<Option<DbError>>,
    validation_supported: AtomicBool,
    session: StdMutex<Option<SessionData>>,
    descriptor: StdMutex<String>,
    pub(crate) state: Mutex<EntryState>,
}

impl Entry {
    pub(crate) fn new(id: u64, config: Arc<PoolConfig>) -> Self {
        let statement_cache_size = config.statement_cache_size;
        Self {
            id,
            created_at: Instant::now(),
            config,
            owner: StdMutex::new(None),
            commit_pending: AtomicBool::new(false),
            last_error: StdMutex::new(None),
            validation_supported: AtomicBool::new(false),
            session: StdMutex::new(None),
            descriptor: StdMutex::new(format!("id={id}")),
            state: Mutex::new(EntryState {
                raw: None,
                statements: LruCache::new(statement_cache_size),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Telemetry descriptor: identity plus session and clock skew once known.
    pub(crate) fn descriptor(&self) -> String {
        self.descriptor.lock().expect("descriptor lock poisoned").clone()
    }

    fn rebuild_descriptor(&self, time_delta: &TimeDelta) {
        let session = self.session.lock().expect("session lock poisoned");
        let descriptor = match session.as_ref() {
            Some(data) => format!(
                "id={}, session={}, delta={} ms",
                self.id,
                data.session_id,
                time_delta.get()
            ),
            None => format!("id={}", self.id),
        };
        *self.descriptor.lock().expect("descriptor lock poisoned") = descriptor;
    }

    /// Open the physical connection: driver open bounded by the login
    /// timeout, then session configuration, validation-capability probe and
    /// session preparation. Any failure after the raw open closes the raw
    /// connection and propagates the original error.
    pub(crate) async fn open(
        &self,
        driver: &dyn Driver,
        session_controller: Option<&dyn SessionController>,
        time_delta: &TimeDelta,
    ) -> std::result::Result<(), DbError> {
        let started = Instant::now();
        debug!(
            connection = %self.descriptor(),
            url = %self.config.url,
            "connection attempting to open"
        );

        let result = self
            .open_inner(driver, session_controller, time_delta)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                debug!(connection = %self.descriptor(), duration_ms, "connection opened");
            }
            Err(e) => {
                error!(
                    connection = %self.descriptor(),
                    duration_ms,
                    error = %e,
                    "connection open attempt failed"
                );
                self.capture_error(e);
            }
        }

        result
    }

    async fn open_inner(
        &self,
        driver: &dyn Driver,
        session_controller: Option<&dyn SessionController>,
        time_delta: &TimeDelta,
    ) -> std::result::Result<(), DbError> {
        let login_timeout = self.config.effective_connection_timeout();
        let connect_props = self.config.connect_props();
        let open = driver.open(&self.config.url, &connect_props);
        let mut raw = match tokio::time::timeout(login_timeout, open).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(DbError::connection_failure(format!(
                    "login timed out after {login_timeout:?}"
                )));
            }
        };

        if let Err(e) = self
            .configure(raw.as_mut(), session_controller, time_delta)
            .await
        {
            let _ = raw.close().await;
            return Err(e);
        }

        self.state.lock().await.raw = Some(raw);
        Ok(())
    }

    /// Apply the configured session defaults. Drivers that do not support an
    /// option get a warning, not a failure; only session preparation can fail
    /// the open.
    async fn configure(
        &self,
        raw: &mut dyn RawConnection,
        session_controller: Option<&dyn SessionController>,
        time_delta: &TimeDelta,
    ) -> std::result::Result<(), DbError> {
        let config = &self.config;

        if let Some(catalog) = &config.catalog {
            if raw.set_catalog(catalog).await.is_err() {
                warn!("driver does not support setting catalog");
            }
        }

        if let Some(schema) = &config.schema {
            if raw.set_schema(schema).await.is_err() {
                warn!("driver does not support setting schema");
            }
        }

        if raw.set_read_only(config.read_only).await.is_err() {
            warn!("driver does not support setting read-only mode");
        }

        if let Some(level) = config.isolation {
            if raw.set_isolation(level).await.is_err() {
                warn!("driver does not support setting transaction isolation");
            }
        }

        if raw.set_auto_commit(config.auto_commit).await.is_err() {
            warn!("driver does not support setting auto-commit mode");
        }

        if let Some(name) = &config.application_name {
            if raw.set_client_info("ApplicationName", name).await.is_err()
                && raw.set_client_info("OCSID.CLIENTID", name).await.is_err()
            {
                warn!("driver does not support setting client info");
            }
        }

        match raw.is_valid(config.effective_validation_timeout()).await {
            Ok(_) => self.validation_supported.store(true, Ordering::Release),
            Err(_) => {
                warn!("driver does not support connection validation");
                self.validation_supported.store(false, Ordering::Release);
            }
        }

        if let Some(controller) = session_controller {
            let data = controller.prepare_session(config, raw).await?;
            time_delta.update(data.time_delta_millis);
            *self.session.lock().expect("session lock poisoned") = Some(data);
            self.rebuild_descriptor(time_delta);
        }

        Ok(())
    }

    pub(crate) fn allocate(&self, caller: CallerId) {
        *self.owner.lock().expect("owner lock poisoned") = Some(caller);
        *self.last_error.lock().expect("last error lock poisoned") = None;
    }

    /// Clear ownership, failing when `caller` is not the current owner.
    pub(crate) fn release_owner(&self, caller: CallerId) -> Result<()> {
        let mut owner = self.owner.lock().expect("owner lock poisoned");
        if *owner != Some(caller) {
            return Err(Error::AlreadyReleased);
        }
        *owner = None;
        Ok(())
    }

    /// Clear ownership if held by `caller`; reports whether it was.
    pub(crate) fn try_release_owner(&self, caller: CallerId) -> bool {
        let mut owner = self.owner.lock().expect("owner lock poisoned");
        if *owner == Some(caller) {
            *owner = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_commit_pending(&self, pending: bool) {
        self.commit_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn commit_pending(&self) -> bool {
        self.commit_pending.load(Ordering::Acquire)
    }

    /// Store a failure for later validation, normalising non-driver shapes.
    pub(crate) fn capture_error(&self, error: &DbError) {
        *self.last_error.lock().expect("last error lock poisoned") = Some(error.clone());
    }

    /// Validity judged from the captured failure alone: a communication- or
    /// system-class failure poisons the connection.
    pub(crate) fn is_valid_sync(&self) -> bool {
        let last_error = self.last_error.lock().expect("last error lock poisoned");
        match last_error.as_ref() {
            Some(error) => !classify(error).poisons_connection(),
            None => true,
        }
    }

    /// Full validity check for the borrow path: captured-failure check plus,
    /// when requested and supported, a driver-side probe bounded by the
    /// validation timeout.
    pub(crate) async fn validate(&self, full_validation: bool) -> bool {
        if !self.is_valid_sync() {
            return false;
        }

        if full_validation && self.validation_supported.load(Ordering::Acquire) {
            debug!(connection = %self.descriptor(), "connection is being validated");
            let validation_timeout = self.config.effective_validation_timeout();
            let mut state = self.state.lock().await;
            let Some(raw) = state.raw.as_mut() else {
                return false;
            };
            return match tokio::time::timeout(validation_timeout, raw.is_valid(validation_timeout))
                .await
            {
                Ok(Ok(valid)) => valid,
                _ => false,
            };
        }

        true
    }

    /// Whether the connection's age exceeds the configured maximum lifetime.
    pub(crate) fn is_end_of_life(&self) -> bool {
        !self.config.maximum_lifetime.is_zero()
            && self.created_at.elapsed() > self.config.maximum_lifetime
    }

    /// Terminal close, run on the retirer task: close the driver handle with
    /// best-effort error swallowing and destroy every cached statement.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;

        if let Some(mut raw) = state.raw.take() {
            match raw.close().await {
                Ok(()) => debug!(connection = %self.descriptor(), "connection closed"),
                Err(e) => error!(
                    connection = %self.descriptor(),
                    error = %e,
                    "connection close attempt failed"
                ),
            }
        }

        for cached in state.statements.drain() {
            statement::destroy(&cached).await;
        }
        drop(state);

        *self.session.lock().expect("session lock poisoned") = None;
        *self.descriptor.lock().expect("descriptor lock poisoned") = format!("id={}", self.id);
    }
}

enum PrepareKind<'a> {
    Prepare,
    Call,
    WithKeys(&'a [String]),
}

/// A borrowed pooled connection.
///
/// Acts like a driver connection; `close()` means "return to the pool".
/// Nested borrows by the same task receive clones of the same handle, and the
/// first `close()` releases the connection. Dropping the handle without
/// closing releases it too, but cannot roll back a pending transaction — such
/// connections are retired instead of reused.
pub struct Connection {
    entry: Arc<Entry>,
    shared: Arc<PoolShared>,
    caller: CallerId,
    primary: bool,
    released: AtomicBool,
}

impl Connection {
    pub(crate) fn new(entry: Arc<Entry>, shared: Arc<PoolShared>, caller: CallerId) -> Self {
        Self {
            entry,
            shared,
            caller,
            primary: true,
            released: AtomicBool::new(false),
        }
    }

    /// Stable identity of the underlying pooled connection.
    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    /// Telemetry descriptor (identity, session, clock skew).
    pub fn descriptor(&self) -> String {
        self.entry.descriptor()
    }

    /// Prepare a statement, serving repeats from the statement cache.
    pub async fn prepare(&self, text: &str) -> Result<Statement> {
        self.prepare_internal(text, PrepareKind::Prepare).await
    }

    /// Prepare a call to a stored procedure, cached like [`prepare`](Self::prepare).
    pub async fn prepare_call(&self, text: &str) -> Result<Statement> {
        self.prepare_internal(text, PrepareKind::Call).await
    }

    async fn prepare_internal(&self, text: &str, kind: PrepareKind<'_>) -> Result<Statement> {
        let mut state = self.entry.state.lock().await;

        if state.statements.capacity() > 0
            && let Some(cached) = state.statements.get(text)
        {
            debug!(connection = %self.entry.descriptor(), "using cached statement");
            return Ok(Statement::from_cached(Arc::clone(cached)));
        }

        let raw = self.prepare_raw(&mut state, text, kind).await?;
        let cache_text = (state.statements.capacity() > 0).then(|| text.to_string());
        Ok(Statement::new(raw, cache_text, Arc::clone(&self.entry)))
    }

    /// Prepare a statement that returns generated keys, consulting the
    /// configured statement enhancer first. Never cached.
    pub async fn prepare_with_keys(&self, text: &str, key_columns: &[String]) -> Result<Statement> {
        let mut state = self.entry.state.lock().await;

        if let Some(enhancer) = self.shared.enhancer() {
            let raw_conn = state
                .raw
                .as_mut()
                .ok_or_else(closed_connection)?
                .as_mut();
            match enhancer.statement(raw_conn, text, key_columns).await {
                Ok(Some(enhanced)) => {
                    return Ok(Statement::new(enhanced, None, Arc::clone(&self.entry)));
                }
                Ok(None) => {}
                Err(e) => {
                    self.entry.capture_error(&e);
                    return Err(e.into());
                }
            }
        }

        let raw = self
            .prepare_raw(&mut state, text, PrepareKind::WithKeys(key_columns))
            .await?;
        Ok(Statement::new(raw, None, Arc::clone(&self.entry)))
    }

    /// Create a direct statement. Never cached.
    pub async fn statement(&self, text: &str) -> Result<Statement> {
        let mut state = self.entry.state.lock().await;
        let raw = self.prepare_raw(&mut state, text, PrepareKind::Prepare).await?;
        Ok(Statement::new(raw, None, Arc::clone(&self.entry)))
    }

    async fn prepare_raw(
        &self,
        state: &mut EntryState,
        text: &str,
        kind: PrepareKind<'_>,
    ) -> Result<Box<dyn RawStatement>> {
        let raw = state.raw.as_mut().ok_or_else(closed_connection)?;
        let started = Instant::now();
        let result = match kind {
            PrepareKind::Prepare => raw.prepare(text).await,
            PrepareKind::Call => raw.prepare_call(text).await,
            PrepareKind::WithKeys(columns) => raw.prepare_with_keys(text, columns).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(statement) => {
                debug!(connection = %self.entry.descriptor(), duration_ms, "statement prepared");
                Ok(statement)
            }
            Err(e) => {
                error!(
                    connection = %self.entry.descriptor(),
                    duration_ms,
                    error = %e,
                    "statement prepare failed"
                );
                self.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Commit the current transaction and clear the commit-pending flag.
    pub async fn commit(&self) -> Result<()> {
        let mut state = self.entry.state.lock().await;
        let raw = state.raw.as_mut().ok_or_else(closed_connection)?;
        let started = Instant::now();
        match raw.commit().await {
            Ok(()) => {
                debug!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                self.entry.set_commit_pending(false);
                Ok(())
            }
            Err(e) => {
                error!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "transaction commit failed"
                );
                self.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Roll back the current transaction and clear the commit-pending flag.
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.entry.state.lock().await;
        let raw = state.raw.as_mut().ok_or_else(closed_connection)?;
        let started = Instant::now();
        match raw.rollback().await {
            Ok(()) => {
                debug!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "transaction rolled back"
                );
                self.entry.set_commit_pending(false);
                Ok(())
            }
            Err(e) => {
                error!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "transaction rollback failed"
                );
                self.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Access catalog metadata. Metadata retrieval is side-effect-free, so
    /// it clears the commit-pending flag.
    pub async fn metadata(&self) -> Result<Metadata> {
        let mut state = self.entry.state.lock().await;
        let raw = state.raw.as_mut().ok_or_else(closed_connection)?;
        let started = Instant::now();
        match raw.metadata().await {
            Ok(metadata) => {
                debug!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "metadata retrieved"
                );
                self.entry.set_commit_pending(false);
                Ok(Metadata::new(
                    metadata,
                    Arc::clone(&self.entry),
                    self.entry.config().cache_metadata,
                ))
            }
            Err(e) => {
                error!(
                    connection = %self.entry.descriptor(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "metadata retrieval failed"
                );
                self.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Whether the connection is still valid. With `full_validation`, runs a
    /// driver-side probe when the driver supports one.
    pub async fn is_valid(&self, full_validation: bool) -> bool {
        self.entry.validate(full_validation).await
    }

    /// Database-side wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Prefers the statement enhancer's clock when one is configured and
    /// provides a value; otherwise the local clock adjusted by the pool's
    /// running clock-skew average.
    pub fn system_timestamp(&self) -> i64 {
        if let Some(enhancer) = self.shared.enhancer()
            && let Some(millis) = enhancer.system_time_millis()
        {
            return millis;
        }

        let local = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        local + self.shared.time_delta.get()
    }

    /// Return the connection to the pool.
    ///
    /// If a transaction was left uncommitted, a rollback is executed first
    /// and [`Error::ForcedRollback`] is returned — after the release, which
    /// happens regardless.
    pub async fn close(self) -> Result<()> {
        let mut forced = false;
        let mut rollback_failure: Option<DbError> = None;

        if self.entry.commit_pending() {
            let mut state = self.entry.state.lock().await;
            if let Some(raw) = state.raw.as_mut() {
                let started = Instant::now();
                match raw.rollback().await {
                    Ok(()) => {
                        debug!(
                            connection = %self.entry.descriptor(),
                            duration_ms = started.elapsed().as_millis() as u64,
                            "transaction rolled back"
                        );
                        self.entry.set_commit_pending(false);
                        forced = true;
                    }
                    Err(e) => {
                        error!(
                            connection = %self.entry.descriptor(),
                            duration_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "transaction rollback failed"
                        );
                        self.entry.capture_error(&e);
                        rollback_failure = Some(e);
                    }
                }
            }
        }

        {
            let mut state = self.entry.state.lock().await;
            if let Some(raw) = state.raw.as_mut() {
                let _ = raw.clear_warnings().await;
            }
        }

        self.released.store(true, Ordering::Release);
        let release_result = self.shared.release(&self.entry, self.caller);

        if let Some(e) = rollback_failure {
            return Err(e.into());
        }
        release_result?;

        if forced {
            Err(Error::ForcedRollback)
        } else {
            Ok(())
        }
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            shared: Arc::clone(&self.shared),
            caller: self.caller,
            primary: false,
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.primary && !self.released.load(Ordering::Acquire) {
            self.shared.release_on_drop(&self.entry, self.caller);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.entry.id())
            .field("primary", &self.primary)
            .finish()
    }
}

fn closed_connection() -> Error {
    DbError::connection_failure("connection is closed").into()
}

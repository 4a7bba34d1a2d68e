//! Connection pool
//!
//! The pool opens connections on demand (never synchronously on the borrow
//! path), multiplexes them across concurrent tasks, and retires them when
//! they fail validation, exceed their lifetime, or fall out of use. Three
//! background tasks do the lifecycle work: the opener grows the population
//! under a failure-backoff circuit breaker, the pruner shrinks it toward the
//! recent peak during quiet periods, and the retirer closes what the others
//! discard.
//!
//! Borrows are reentrant per task: nested borrows by the same task receive
//! the same connection without touching the queue.

mod tasks;

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ConfigError, PoolConfig};
use crate::connection::{Connection, Entry};
use crate::constants::pool::AVAILABLE_POLL;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::session::{SessionController, StatementEnhancer, TimeDelta};
use crate::types::{
    ActiveConnections, ChurnedConnections, ConnectionDeficit, PoolStatus, TotalConnections,
};

/// Identity of a borrowing caller: the current tokio task, or the current
/// thread when called from outside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CallerId {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl CallerId {
    pub(crate) fn current() -> Self {
        tokio::task::try_id()
            .map(Self::Task)
            .unwrap_or_else(|| Self::Thread(std::thread::current().id()))
    }
}

/// State shared between the pool handle, connection handles and the
/// background tasks.
pub(crate) struct PoolShared {
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) session_controller: Option<Arc<dyn SessionController>>,
    enhancer: Option<Arc<dyn StatementEnhancer>>,
    pub(crate) time_delta: TimeDelta,

    /// Idle connections, FIFO. `available_items` permits mirror the queue
    /// length so takes can wait with a deadline.
    available: StdMutex<VecDeque<Arc<Entry>>>,
    available_items: Semaphore,

    /// Counting demand signal raised by borrows that found the queue empty.
    pub(crate) demand: Semaphore,

    /// Connections awaiting terminal close on the retirer task.
    retire_tx: mpsc::UnboundedSender<Arc<Entry>>,

    /// Total managed connections, any state.
    pub(crate) total: AtomicUsize,
    /// Signed supply/demand slack: negative is unmet demand.
    pub(crate) supply: AtomicI64,
    /// Connections destroyed due to invalidity.
    pub(crate) churned: AtomicU64,
    /// High-water mark of active connections within the current pruning
    /// window.
    pub(crate) ceiling: AtomicUsize,

    next_id: AtomicU64,
    borrowed: DashMap<CallerId, Connection>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PoolShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn enhancer(&self) -> Option<&dyn StatementEnhancer> {
        self.enhancer.as_deref()
    }

    pub(crate) fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn available_count(&self) -> usize {
        self.available_items.available_permits()
    }

    /// Enqueue an idle connection. The supply counter is the caller's
    /// responsibility; it is always adjusted before enqueueing.
    pub(crate) fn push_available(&self, entry: Arc<Entry>) {
        self.available
            .lock()
            .expect("available queue lock poisoned")
            .push_back(entry);
        self.available_items.add_permits(1);
    }

    fn pop_available(&self) -> Arc<Entry> {
        self.available
            .lock()
            .expect("available queue lock poisoned")
            .pop_front()
            .expect("available permit without queued connection")
    }

    /// Take an idle connection immediately, or `None` when the queue is
    /// empty.
    pub(crate) fn try_take_available(&self) -> Option<Arc<Entry>> {
        match self.available_items.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Some(self.pop_available())
            }
            Err(_) => None,
        }
    }

    /// Take an idle connection, waiting up to `bound`.
    pub(crate) async fn take_available_within(&self, bound: Duration) -> Option<Arc<Entry>> {
        match tokio::time::timeout(bound, self.available_items.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Some(self.pop_available())
            }
            _ => None,
        }
    }

    /// Hand a connection to the retirer task.
    pub(crate) fn retire(&self, entry: Arc<Entry>) {
        if self.retire_tx.send(entry).is_err() {
            debug!("retirer task gone; dropping connection");
        }
    }

    /// Release a borrowed connection: clear the caller slot, verify
    /// ownership, then requeue or retire depending on validity. An invalid
    /// connection does not restore supply — that supply has been destroyed.
    pub(crate) fn release(&self, entry: &Arc<Entry>, caller: CallerId) -> Result<()> {
        self.borrowed.remove(&caller);
        entry.release_owner(caller)?;

        if self.is_closed() {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.retire(Arc::clone(entry));
            return Ok(());
        }

        if !entry.is_valid_sync() {
            debug!(
                connection = %entry.descriptor(),
                "connection is no longer valid and is being retired"
            );
            self.churned.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.retire(Arc::clone(entry));
        } else {
            self.supply.fetch_add(1, Ordering::SeqCst);
            self.push_available(Arc::clone(entry));
            debug!(connection = %entry.descriptor(), "connection released");
        }

        Ok(())
    }

    /// Release path for a handle dropped without `close()`. No rollback can
    /// run here, so a commit-pending or poisoned connection is retired.
    pub(crate) fn release_on_drop(&self, entry: &Arc<Entry>, caller: CallerId) {
        if !entry.try_release_owner(caller) {
            return;
        }
        self.borrowed.remove(&caller);

        if entry.commit_pending() || !entry.is_valid_sync() {
            tracing::warn!(
                connection = %entry.descriptor(),
                "connection dropped without close; retiring"
            );
            self.churned.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.retire(Arc::clone(entry));
        } else {
            tracing::warn!(
                connection = %entry.descriptor(),
                "connection dropped without close; returning to pool"
            );
            self.supply.fetch_add(1, Ordering::SeqCst);
            self.push_available(Arc::clone(entry));
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let total = self.total.load(Ordering::SeqCst);
        let available = self.available_count();
        PoolStatus {
            total: TotalConnections::new(total),
            active: ActiveConnections::from_counts(TotalConnections::new(total), available),
            available,
            deficit: ConnectionDeficit::from_supply(self.supply.load(Ordering::SeqCst)),
            churned: ChurnedConnections::new(self.churned.load(Ordering::SeqCst)),
        }
    }
}

/// A pool of database connections.
///
/// Cheap to clone via [`Pool::builder`]-produced handles; all clones share
/// the same state. Must be created inside a tokio runtime (it spawns its
/// background tasks on construction).
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(driver, PoolConfig::builder("db://localhost/app")
///         .minimum_connections(2)
///         .maximum_connections(20)
///         .build()?)
///     .build()?;
///
/// let conn = pool.get().await?;
/// let stmt = conn.prepare("select name from users where id = ?").await?;
/// // ...
/// conn.close().await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a builder for a pool over the given driver and configuration.
    #[must_use]
    pub fn builder(driver: Arc<dyn Driver>, config: PoolConfig) -> PoolBuilder {
        PoolBuilder {
            driver,
            config,
            session_controller: None,
            enhancer: None,
        }
    }

    /// Create a pool with no session controller or statement enhancer.
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder(driver, config).build()
    }

    /// Borrow a connection.
    ///
    /// Nested borrows by the same task return the same connection. Otherwise
    /// the borrow takes an idle connection from the queue, raising demand for
    /// the opener and waiting up to the connection timeout when none is
    /// available. Dequeued connections are validated (and end-of-life
    /// checked) before being handed out; failures are retired and the wait
    /// continues.
    pub async fn get(&self) -> Result<Connection> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(Error::PoolClosed);
        }

        let caller = CallerId::current();
        if let Some(existing) = shared.borrowed.get(&caller) {
            debug!(
                connection = %existing.descriptor(),
                reuse = true,
                "connection allocated"
            );
            return Ok(existing.clone());
        }

        let timeout = shared.config.effective_connection_timeout();
        shared.supply.fetch_sub(1, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        let entry = loop {
            let entry = match shared.take_available_within(AVAILABLE_POLL).await {
                Some(entry) => entry,
                None => {
                    shared.demand.add_permits(1);
                    debug!("waiting for a connection to become available");

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let waited = if remaining.is_zero() {
                        None
                    } else {
                        shared.take_available_within(remaining).await
                    };
                    match waited {
                        Some(entry) => entry,
                        None => {
                            shared.supply.fetch_add(1, Ordering::SeqCst);
                            return Err(Error::AcquireTimeout { timeout });
                        }
                    }
                }
            };

            if !entry.validate(shared.config.validate_on_borrow).await {
                debug!(
                    connection = %entry.descriptor(),
                    "connection is no longer valid and is being retired"
                );
                shared.supply.fetch_sub(1, Ordering::SeqCst);
                shared.churned.fetch_add(1, Ordering::SeqCst);
                shared.total.fetch_sub(1, Ordering::SeqCst);
                shared.retire(entry);
                continue;
            }

            if entry.is_end_of_life() {
                debug!(
                    connection = %entry.descriptor(),
                    "connection has reached end-of-life and is being retired"
                );
                shared.supply.fetch_sub(1, Ordering::SeqCst);
                shared.total.fetch_sub(1, Ordering::SeqCst);
                shared.retire(entry);
                continue;
            }

            break entry;
        };

        entry.allocate(caller);

        let active = shared
            .total
            .load(Ordering::SeqCst)
            .saturating_sub(shared.available_count());
        shared.ceiling.fetch_max(active, Ordering::SeqCst);

        let connection = Connection::new(Arc::clone(&entry), Arc::clone(shared), caller);
        shared.borrowed.insert(caller, connection.clone());

        debug!(
            connection = %entry.descriptor(),
            reuse = false,
            status = %shared.status(),
            "connection allocated"
        );

        Ok(connection)
    }

    /// A point-in-time snapshot of pool statistics.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Shut the pool down: stop the background tasks and close all idle
    /// connections. Borrows fail afterwards; connections still held by
    /// callers are closed when released.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connection pool");

        let _ = self.shared.shutdown_tx.send(());

        while let Some(entry) = self.shared.try_take_available() {
            self.shared.supply.fetch_sub(1, Ordering::SeqCst);
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
            entry.close().await;
        }

        info!("connection pool shut down");
    }
}

/// Builder for [`Pool`], wiring in the optional collaborator hooks.
pub struct PoolBuilder {
    driver: Arc<dyn Driver>,
    config: PoolConfig,
    session_controller: Option<Arc<dyn SessionController>>,
    enhancer: Option<Arc<dyn StatementEnhancer>>,
}

impl PoolBuilder {
    /// Install a session controller, invoked once per successful open.
    #[must_use]
    pub fn session_controller(mut self, controller: Arc<dyn SessionController>) -> Self {
        self.session_controller = Some(controller);
        self
    }

    /// Install a statement enhancer, consulted by
    /// [`Connection::prepare_with_keys`](crate::Connection::prepare_with_keys).
    #[must_use]
    pub fn statement_enhancer(mut self, enhancer: Arc<dyn StatementEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    /// Validate the configuration, start the background tasks and produce
    /// the pool.
    pub fn build(self) -> std::result::Result<Pool, ConfigError> {
        self.config.validate()?;

        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(PoolShared {
            config: Arc::new(self.config),
            driver: self.driver,
            session_controller: self.session_controller,
            enhancer: self.enhancer,
            time_delta: TimeDelta::new(),
            available: StdMutex::new(VecDeque::new()),
            available_items: Semaphore::new(0),
            demand: Semaphore::new(0),
            retire_tx,
            total: AtomicUsize::new(0),
            supply: AtomicI64::new(0),
            churned: AtomicU64::new(0),
            ceiling: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            borrowed: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        tasks::spawn(&shared, retire_rx);

        // Kick the opener once so the pool grows toward the configured floor.
        if shared.config.minimum_connections > 0 {
            shared.demand.add_permits(1);
        }

        info!(
            min = shared.config.minimum_connections,
            max = shared.config.maximum_connections,
            "connection pool created"
        );

        Ok(Pool {
            shared: Arc::clone(&shared),
        })
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status().to_string())
            .finish()
    }
}

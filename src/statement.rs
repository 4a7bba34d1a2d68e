//! Statement wrapper and per-connection statement cache
//!
//! [`Statement`] proxies a driver statement: it renders bind parameters into
//! a lazy argument buffer when argument logging is enabled, applies the
//! configured request timeout before executes, logs execution timing, marks
//! the owning connection commit-pending on non-query executes, and intercepts
//! `close` to return the statement to its connection's LRU cache instead of
//! destroying it.
//!
//! A statement resident in the cache remains resident while reused; closing a
//! resident statement is a no-op. Eviction from the cache destroys the
//! statement (driver close) exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::connection::Entry;
use crate::driver::{RawRows, RawStatement, Value};
use crate::error::{DbError, Error, Result};

/// Insertion-order LRU map with string keys.
///
/// `get` promotes to most-recently-used; `insert` evicts the least-recently-
/// used entry when at capacity and returns it so the caller can destroy it.
pub(crate) struct LruCache<T> {
    capacity: usize,
    map: HashMap<String, T>,
    order: VecDeque<String>,
}

impl<T> LruCache<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Look up a key, promoting it to most-recently-used on a hit.
    pub(crate) fn get(&mut self, key: &str) -> Option<&T> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.promote(key);
        self.map.get(key)
    }

    /// Insert a value. Returns the displaced value for an existing key, or
    /// the evicted least-recently-used value when at capacity.
    pub(crate) fn insert(&mut self, key: String, value: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(value);
        }

        if self.map.contains_key(&key) {
            self.promote(&key);
            return self.map.insert(key, value);
        }

        let evicted = if self.map.len() >= self.capacity {
            self.order
                .pop_front()
                .and_then(|oldest| self.map.remove(&oldest))
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.map.insert(key, value);
        evicted
    }

    /// Remove and return every entry, emptying the cache.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.order.clear();
        self.map.drain().map(|(_, v)| v).collect()
    }

    fn promote(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
            self.order.push_back(key.to_string());
        }
    }
}

pub(crate) struct StatementState {
    pub(crate) raw: Option<Box<dyn RawStatement>>,
    /// Rendered bind parameters, accumulated only when argument logging is on.
    arguments: Option<String>,
    /// Whether this statement is resident in its connection's cache.
    cached: bool,
}

pub(crate) struct StatementInner {
    /// Statement text; present only when the statement is bound to the cache.
    text: Option<String>,
    entry: Arc<Entry>,
    pub(crate) state: Mutex<StatementState>,
}

/// Destroy a statement: close the driver statement and release state.
/// Close failures are logged, not surfaced.
pub(crate) async fn destroy(inner: &Arc<StatementInner>) {
    let mut state = inner.state.lock().await;
    state.cached = false;
    state.arguments = None;
    if let Some(mut raw) = state.raw.take() {
        if let Err(e) = raw.close().await {
            error!(error = %e, "failed to close statement");
        }
    }
}

/// A pooled statement handle.
///
/// Obtained from [`Connection::prepare`](crate::Connection::prepare) and
/// friends. `close()` returns the statement to the connection's cache when
/// eligible; otherwise it destroys it.
pub struct Statement {
    inner: Arc<StatementInner>,
}

impl Statement {
    pub(crate) fn new(
        raw: Box<dyn RawStatement>,
        cache_text: Option<String>,
        entry: Arc<Entry>,
    ) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                text: cache_text,
                entry,
                state: Mutex::new(StatementState {
                    raw: Some(raw),
                    arguments: None,
                    cached: false,
                }),
            }),
        }
    }

    pub(crate) fn from_cached(inner: Arc<StatementInner>) -> Self {
        Self { inner }
    }

    /// Bind a parameter at 1-based `index`.
    pub async fn bind(&self, index: usize, value: Value) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        if self.inner.entry.config().log_arguments {
            let buffer = state.arguments.get_or_insert_with(String::new);
            if !buffer.is_empty() {
                buffer.push_str(", ");
            }
            buffer.push('{');
            buffer.push_str(&index.to_string());
            buffer.push(',');
            buffer.push_str(&value.to_string());
            buffer.push('}');
        }

        let raw = state.raw.as_mut().ok_or_else(closed_statement)?;
        match raw.bind(index, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Execute and return a row cursor.
    ///
    /// Queries never mark the connection commit-pending.
    pub async fn execute_query(&self) -> Result<Rows> {
        let mut state = self.inner.state.lock().await;
        self.before_execute(&mut state);

        let raw = state.raw.as_mut().ok_or_else(closed_statement)?;
        let started = Instant::now();
        match raw.execute_query().await {
            Ok(rows) => {
                debug!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "statement executed"
                );
                Ok(Rows::new(rows, Arc::clone(&self.inner.entry)))
            }
            Err(e) => self.execute_failed(started, e),
        }
    }

    /// Execute a non-query statement, returning the affected row count.
    ///
    /// With auto-commit off, a successful execute marks the owning connection
    /// commit-pending; closing the connection without a commit then forces a
    /// rollback.
    pub async fn execute_update(&self) -> Result<u64> {
        let mut state = self.inner.state.lock().await;
        self.before_execute(&mut state);

        let raw = state.raw.as_mut().ok_or_else(closed_statement)?;
        let started = Instant::now();
        match raw.execute_update().await {
            Ok(count) => {
                debug!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    rows = count,
                    "statement executed"
                );
                if !self.inner.entry.config().auto_commit {
                    self.inner.entry.set_commit_pending(true);
                }
                Ok(count)
            }
            Err(e) => self.execute_failed(started, e),
        }
    }

    /// Close the statement.
    ///
    /// A cache-bound, poolable statement is returned to its connection's
    /// cache (no driver close); anything else is destroyed. Closing a
    /// statement already resident in the cache is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.cached {
            return Ok(());
        }

        let poolable = state.raw.as_ref().is_some_and(|r| r.is_poolable());
        let capacity = self.inner.entry.config().statement_cache_size;

        if let Some(text) = &self.inner.text
            && capacity != 0
            && poolable
        {
            state.cached = true;
            let text = text.clone();
            drop(state);

            let evicted = {
                let mut entry_state = self.inner.entry.state.lock().await;
                entry_state.statements.insert(text, Arc::clone(&self.inner))
            };
            if let Some(evicted) = evicted {
                destroy(&evicted).await;
            }
            return Ok(());
        }

        drop(state);
        destroy(&self.inner).await;
        Ok(())
    }

    fn before_execute(&self, state: &mut StatementState) {
        let config = self.inner.entry.config();

        if !config.request_timeout.is_zero()
            && let Some(raw) = state.raw.as_mut()
        {
            raw.set_query_timeout(Some(config.request_timeout));
        }

        if config.log_arguments
            && let Some(arguments) = state.arguments.take()
            && !arguments.is_empty()
        {
            debug!(arguments = %arguments, "statement arguments");
        }
    }

    fn execute_failed<T>(&self, started: Instant, error: DbError) -> Result<T> {
        error!(
            duration_ms = started.elapsed().as_millis() as u64,
            error = %error,
            "statement execution failed"
        );
        self.inner.entry.capture_error(&error);
        Err(error.into())
    }
}

fn closed_statement() -> Error {
    DbError::dynamic_sql("statement is closed").into()
}

/// A row cursor produced by [`Statement::execute_query`].
pub struct Rows {
    raw: Option<Box<dyn RawRows>>,
    entry: Arc<Entry>,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("open", &self.raw.is_some())
            .finish()
    }
}

impl Rows {
    pub(crate) fn new(raw: Box<dyn RawRows>, entry: Arc<Entry>) -> Self {
        Self {
            raw: Some(raw),
            entry,
        }
    }

    /// Column names, in result order.
    pub fn columns(&self) -> &[String] {
        self.raw.as_ref().map(|r| r.columns()).unwrap_or(&[])
    }

    /// Fetch the next row, or `None` at end of data.
    pub async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let raw = self
            .raw
            .as_mut()
            .ok_or_else(|| Error::from(DbError::dynamic_sql("row cursor is closed")))?;
        match raw.next_row().await {
            Ok(row) => Ok(row),
            Err(e) => {
                self.entry.capture_error(&e);
                Err(e.into())
            }
        }
    }

    /// Close the cursor.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut raw) = self.raw.take() {
            if let Err(e) = raw.close().await {
                self.entry.capture_error(&e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

//! Metadata proxy with materialised row-set caching
//!
//! Metadata queries are expensive and repeated heavily by upstream frameworks.
//! [`Metadata`] fronts the driver's metadata access with a small bounded cache
//! keyed by item name and arguments. Live cursors are materialised into
//! [`RowSnapshot`]s — scroll-insensitive copies that can be replayed without
//! holding a driver cursor — and the live cursor is closed immediately.
//! `close` on a snapshot is a no-op: snapshots are owned by the cache and
//! outlive individual callers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::Entry;
use crate::constants::pool::METADATA_CACHE_CAPACITY;
use crate::driver::{MetadataResult, RawMetadata, RawRows, Value};
use crate::error::{DbError, Result};

/// A materialised, replayable snapshot of a metadata row set.
///
/// Cloning the handle shares the snapshot and its cursor position.
#[derive(Clone)]
pub struct RowSnapshot {
    state: Arc<StdMutex<SnapshotState>>,
}

struct SnapshotState {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    cursor: usize,
}

impl RowSnapshot {
    fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            state: Arc::new(StdMutex::new(SnapshotState {
                columns,
                rows,
                cursor: 0,
            })),
        }
    }

    /// Column names, in result order.
    pub fn columns(&self) -> Vec<String> {
        self.state.lock().expect("snapshot lock poisoned").columns.clone()
    }

    /// Total number of rows in the snapshot.
    pub fn row_count(&self) -> usize {
        self.state.lock().expect("snapshot lock poisoned").rows.len()
    }

    /// Fetch the next row, or `None` past the last row.
    pub fn next_row(&self) -> Option<Vec<Value>> {
        let mut state = self.state.lock().expect("snapshot lock poisoned");
        let row = state.rows.get(state.cursor).cloned();
        if row.is_some() {
            state.cursor += 1;
        }
        row
    }

    /// Reposition before the first row.
    pub fn before_first(&self) {
        self.state.lock().expect("snapshot lock poisoned").cursor = 0;
    }

    /// No-op: snapshots are owned by the metadata cache, not by callers.
    pub fn close(&self) {}
}

/// A cached metadata fetch result.
#[derive(Clone)]
enum CachedResult {
    Scalar(Value),
    Rows(RowSnapshot),
}

/// Bounded insertion-order cache for metadata results. No promotion on
/// lookup; the oldest insertion is dropped when at capacity.
struct MetaCache {
    capacity: usize,
    map: HashMap<String, CachedResult>,
    order: VecDeque<String>,
}

impl MetaCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&CachedResult> {
        self.map.get(key)
    }

    fn insert(&mut self, key: String, value: CachedResult) {
        if self.capacity == 0 {
            return;
        }
        if !self.map.contains_key(&key) {
            if self.map.len() >= self.capacity
                && let Some(oldest) = self.order.pop_front()
            {
                self.map.remove(&oldest);
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// The result of a metadata fetch through the proxy.
pub enum MetadataValue {
    Scalar(Value),
    Rows(RowSnapshot),
}

/// Wrapper around the driver's metadata access.
///
/// Obtained from [`Connection::metadata`](crate::Connection::metadata).
/// Caching is active only when `cache_metadata` is configured; results are
/// always materialised so they can be consumed without holding a cursor.
pub struct Metadata {
    entry: Arc<Entry>,
    state: Mutex<MetaState>,
}

struct MetaState {
    raw: Box<dyn RawMetadata>,
    cache: Option<MetaCache>,
}

impl Metadata {
    pub(crate) fn new(raw: Box<dyn RawMetadata>, entry: Arc<Entry>, cache_enabled: bool) -> Self {
        Self {
            entry,
            state: Mutex::new(MetaState {
                raw,
                cache: cache_enabled.then(|| MetaCache::new(METADATA_CACHE_CAPACITY)),
            }),
        }
    }

    /// Fetch a metadata item, serving repeated fetches from the cache.
    ///
    /// A cached row set is repositioned before its first row on every hit.
    pub async fn fetch(&self, item: &str, args: &[&str]) -> Result<MetadataValue> {
        let key = cache_key(item, args);
        let mut state = self.state.lock().await;

        if let Some(cache) = &state.cache
            && let Some(hit) = cache.get(&key)
        {
            debug!(key = %key, "using cached metadata result");
            return Ok(match hit.clone() {
                CachedResult::Scalar(value) => MetadataValue::Scalar(value),
                CachedResult::Rows(snapshot) => {
                    snapshot.before_first();
                    MetadataValue::Rows(snapshot)
                }
            });
        }

        let owned_args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let result = match state.raw.fetch(item, &owned_args).await {
            Ok(result) => result,
            Err(e) => {
                self.entry.capture_error(&e);
                return Err(e.into());
            }
        };

        match result {
            MetadataResult::Scalar(value) => {
                if let Some(cache) = &mut state.cache {
                    cache.insert(key, CachedResult::Scalar(value.clone()));
                }
                Ok(MetadataValue::Scalar(value))
            }
            MetadataResult::Rows(cursor) => {
                let snapshot = match materialise(cursor).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.entry.capture_error(&e);
                        return Err(e.into());
                    }
                };
                if let Some(cache) = &mut state.cache {
                    cache.insert(key, CachedResult::Rows(snapshot.clone()));
                }
                Ok(MetadataValue::Rows(snapshot))
            }
        }
    }
}

fn cache_key(item: &str, args: &[&str]) -> String {
    if args.is_empty() {
        item.to_string()
    } else {
        format!("{item}-{}", args.join("-"))
    }
}

/// Drain a live cursor into a snapshot, closing the cursor regardless of the
/// outcome.
async fn materialise(mut cursor: Box<dyn RawRows>) -> std::result::Result<RowSnapshot, DbError> {
    let columns = cursor.columns().to_vec();
    let mut rows = Vec::new();
    let mut failure = None;

    loop {
        match cursor.next_row().await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if let Err(e) = cursor.close().await {
        debug!(error = %e, "failed to close metadata cursor");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(RowSnapshot::new(columns, rows)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(rows: usize) -> RowSnapshot {
        let data = (0..rows).map(|i| vec![Value::Int(i as i64)]).collect();
        RowSnapshot::new(vec!["n".to_string()], data)
    }

    #[test]
    fn test_snapshot_iteration_and_rewind() {
        let snapshot = snapshot_of(3);
        assert_eq!(snapshot.row_count(), 3);
        assert_eq!(snapshot.next_row(), Some(vec![Value::Int(0)]));
        assert_eq!(snapshot.next_row(), Some(vec![Value::Int(1)]));
        assert_eq!(snapshot.next_row(), Some(vec![Value::Int(2)]));
        assert_eq!(snapshot.next_row(), None);

        snapshot.before_first();
        assert_eq!(snapshot.next_row(), Some(vec![Value::Int(0)]));
    }

    #[test]
    fn test_snapshot_close_is_noop() {
        let snapshot = snapshot_of(2);
        snapshot.next_row();
        snapshot.close();
        // Still replayable after close.
        assert_eq!(snapshot.next_row(), Some(vec![Value::Int(1)]));
    }

    #[test]
    fn test_snapshot_clone_shares_cursor() {
        let snapshot = snapshot_of(2);
        let other = snapshot.clone();
        snapshot.next_row();
        assert_eq!(other.next_row(), Some(vec![Value::Int(1)]));
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("tables", &[]), "tables");
        assert_eq!(cache_key("columns", &["app", "users"]), "columns-app-users");
    }

    #[test]
    fn test_meta_cache_bounded() {
        let mut cache = MetaCache::new(2);
        cache.insert("a".into(), CachedResult::Scalar(Value::Int(1)));
        cache.insert("b".into(), CachedResult::Scalar(Value::Int(2)));
        cache.insert("c".into(), CachedResult::Scalar(Value::Int(3)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_meta_cache_replace_existing() {
        let mut cache = MetaCache::new(2);
        cache.insert("a".into(), CachedResult::Scalar(Value::Int(1)));
        cache.insert("a".into(), CachedResult::Scalar(Value::Int(9)));
        assert_eq!(cache.len(), 1);
        match cache.get("a") {
            Some(CachedResult::Scalar(Value::Int(9))) => {}
            _ => panic!("expected replaced scalar"),
        }
    }

    #[test]
    fn test_meta_cache_zero_capacity() {
        let mut cache = MetaCache::new(0);
        cache.insert("a".into(), CachedResult::Scalar(Value::Int(1)));
        assert_eq!(cache.len(), 0);
    }
}

//! Driver abstraction the pool sits on
//!
//! The pool owns connection lifecycle and multiplexing; the driver owns the
//! wire. A driver implementation provides [`Driver::open`] plus the standard
//! statement and row-cursor operations behind the traits below. All traits
//! are object-safe so the pool can hold `Box<dyn ...>` handles.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// A parameter or column value crossing the driver boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// String properties passed to [`Driver::open`] alongside the URL.
///
/// The pool populates `user` and `password` from its configuration; callers
/// may add driver-specific keys.
#[derive(Debug, Clone, Default)]
pub struct ConnectProps {
    entries: HashMap<String, String>,
}

impl ConnectProps {
    /// Create an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Get a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Remove a property.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Iterate over all properties.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// Vendor extension (e.g. SQL Server snapshot isolation).
    Snapshot,
}

/// A database driver: the single capability the pool requires for growing its
/// population.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Open a new physical connection to `url` with the given properties.
    ///
    /// The pool bounds the call with its connection timeout; implementations
    /// should also honour any driver-level login timeout they support.
    async fn open(&self, url: &str, props: &ConnectProps) -> Result<Box<dyn RawConnection>, DbError>;
}

/// One physical database connection as exposed by the driver.
#[async_trait]
pub trait RawConnection: Send {
    /// Prepare a statement from SQL text.
    async fn prepare(&mut self, text: &str) -> Result<Box<dyn RawStatement>, DbError>;

    /// Prepare a call to a stored procedure.
    async fn prepare_call(&mut self, text: &str) -> Result<Box<dyn RawStatement>, DbError> {
        self.prepare(text).await
    }

    /// Prepare a statement that returns generated keys for the named columns.
    async fn prepare_with_keys(
        &mut self,
        text: &str,
        _key_columns: &[String],
    ) -> Result<Box<dyn RawStatement>, DbError> {
        self.prepare(text).await
    }

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Probe whether the connection is still usable, bounded by `timeout`.
    ///
    /// Drivers without a validation mechanism should return an error; the
    /// pool records the capability at open time and stops probing.
    async fn is_valid(&mut self, timeout: Duration) -> Result<bool, DbError>;

    async fn set_catalog(&mut self, catalog: &str) -> Result<(), DbError>;

    async fn set_schema(&mut self, schema: &str) -> Result<(), DbError>;

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), DbError>;

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DbError>;

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DbError>;

    /// Set a client-identification property (e.g. `ApplicationName`).
    async fn set_client_info(&mut self, key: &str, value: &str) -> Result<(), DbError>;

    /// Discard any accumulated warnings.
    async fn clear_warnings(&mut self) -> Result<(), DbError>;

    /// Access catalog metadata.
    async fn metadata(&mut self) -> Result<Box<dyn RawMetadata>, DbError>;

    /// Close the physical connection.
    async fn close(&mut self) -> Result<(), DbError>;
}

/// A prepared (or direct) statement.
#[async_trait]
pub trait RawStatement: Send {
    /// Bind a parameter at 1-based `index`.
    async fn bind(&mut self, index: usize, value: Value) -> Result<(), DbError>;

    /// Execute and return a row cursor.
    async fn execute_query(&mut self) -> Result<Box<dyn RawRows>, DbError>;

    /// Execute a non-query statement, returning the affected row count.
    async fn execute_update(&mut self) -> Result<u64, DbError>;

    /// Apply a driver-side execution timeout to subsequent executes.
    /// `None` clears it.
    fn set_query_timeout(&mut self, timeout: Option<Duration>);

    /// Whether the driver allows this statement to be pooled. Defaults to
    /// poolable; drivers mark statements holding non-reusable resources.
    fn is_poolable(&self) -> bool {
        true
    }

    /// Close the statement and release driver resources.
    async fn close(&mut self) -> Result<(), DbError>;
}

/// A forward-only row cursor.
#[async_trait]
pub trait RawRows: Send {
    /// Column names, in result order.
    fn columns(&self) -> &[String];

    /// Fetch the next row, or `None` at end of data.
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;

    /// Close the cursor.
    async fn close(&mut self) -> Result<(), DbError>;
}

/// Driver-side access to catalog metadata.
///
/// `item` names the metadata item (`tables`, `columns`, `database-version`,
/// ...); `args` scope it (catalog, schema, name patterns). The pool caches
/// results keyed on both.
#[async_trait]
pub trait RawMetadata: Send {
    async fn fetch(&mut self, item: &str, args: &[String]) -> Result<MetadataResult, DbError>;
}

/// Result of a metadata fetch: a scalar or a live row cursor.
pub enum MetadataResult {
    Scalar(Value),
    Rows(Box<dyn RawRows>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Text("abc".into()).to_string(), "abc");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_string(), "<3 bytes>");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }

    #[test]
    fn test_connect_props_roundtrip() {
        let mut props = ConnectProps::new();
        props.set("user", "alice");
        props.set("password", "secret");
        assert_eq!(props.get("user"), Some("alice"));
        assert_eq!(props.get("missing"), None);

        props.remove("password");
        assert_eq!(props.get("password"), None);
        assert_eq!(props.iter().count(), 1);
    }

    #[test]
    fn test_connect_props_replace() {
        let mut props = ConnectProps::new();
        props.set("user", "alice");
        props.set("user", "bob");
        assert_eq!(props.get("user"), Some("bob"));
    }
}

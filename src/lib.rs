//! # sqlpool
//!
//! A pooled database connection manager that sits between an application and
//! a low-level database driver. The pool owns the lifecycle of a bounded
//! population of physical connections, multiplexes them across concurrent
//! tasks, and enforces correctness and resilience properties a naked driver
//! does not provide:
//!
//! - demand-driven opening with a failure-backoff circuit breaker
//! - timed borrow with validation-on-borrow and end-of-life retirement
//! - high-water-mark inactivity pruning
//! - reentrant per-task borrows
//! - auto-rollback of uncommitted transactions on release
//! - failure classification feeding back into pool invalidation
//! - per-connection LRU statement caching with close-intercepted reuse
//! - metadata result caching over materialised row snapshots
//!
//! ## Architecture
//!
//! - **driver**: the minimal abstraction the pool sits on ([`Driver`],
//!   [`RawConnection`], [`RawStatement`], [`RawRows`], [`RawMetadata`])
//! - **pool**: borrow/release, supply-demand accounting, and the opener,
//!   pruner and retirer background tasks
//! - **connection**: the wrapper callers hold; `close()` means release
//! - **statement**: statement wrapper and the per-connection LRU cache
//! - **metadata**: metadata proxy with replayable row snapshots
//! - **classify**: maps driver errors to dispositions that drive retirement
//! - **session**: optional session-controller and statement-enhancer hooks
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlpool::{Pool, PoolConfig, Value};
//!
//! let config = PoolConfig::builder("db://localhost/app")
//!     .username("app")
//!     .minimum_connections(2)
//!     .maximum_connections(20)
//!     .build()?;
//! let pool = Pool::new(Arc::new(MyDriver::new()), config)?;
//!
//! let conn = pool.get().await?;
//! let stmt = conn.prepare("update accounts set balance = ? where id = ?").await?;
//! stmt.bind(1, Value::Int(100)).await?;
//! stmt.bind(2, Value::Int(7)).await?;
//! stmt.execute_update().await?;
//! stmt.close().await?;
//! conn.commit().await?;
//! conn.close().await?;
//! ```

pub mod classify;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod session;
pub mod types;

mod connection;
mod metadata;
mod pool;
mod statement;

pub use classify::{classify, Disposition};
pub use config::{load_config, ConfigError, PoolConfig, PoolConfigBuilder};
pub use connection::Connection;
pub use driver::{
    ConnectProps, Driver, IsolationLevel, MetadataResult, RawConnection, RawMetadata, RawRows,
    RawStatement, Value,
};
pub use error::{DbError, Error, ErrorCategory, Result};
pub use metadata::{Metadata, MetadataValue, RowSnapshot};
pub use pool::{Pool, PoolBuilder};
pub use session::{SessionController, SessionData, StatementEnhancer, TimeDelta};
pub use statement::{Rows, Statement};
pub use types::PoolStatus;

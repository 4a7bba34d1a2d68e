//! Pool metric newtypes
//!
//! Type-safe wrappers for pool statistics so the different counters cannot be
//! mixed up at call sites.

use std::fmt;

/// Total number of connections currently managed by the pool, in any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TotalConnections(usize);

impl TotalConnections {
    #[inline]
    pub const fn new(count: usize) -> Self {
        Self(count)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for TotalConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of connections currently owned by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActiveConnections(usize);

impl ActiveConnections {
    #[inline]
    pub const fn new(count: usize) -> Self {
        Self(count)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Derive from the total and the idle-queue length.
    #[inline]
    pub fn from_counts(total: TotalConnections, available: usize) -> Self {
        Self(total.get().saturating_sub(available))
    }
}

impl fmt::Display for ActiveConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unmet demand: the number of borrows currently waiting beyond supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionDeficit(usize);

impl ConnectionDeficit {
    #[inline]
    pub const fn new(count: usize) -> Self {
        Self(count)
    }

    /// Derive from the signed supply counter: negative supply is deficit.
    #[inline]
    pub fn from_supply(supply: i64) -> Self {
        Self(supply.min(0).unsigned_abs() as usize)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionDeficit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connections destroyed due to invalidity rather than normal lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChurnedConnections(u64);

impl ChurnedConnections {
    #[inline]
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChurnedConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point-in-time snapshot of pool statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Total managed connections.
    pub total: TotalConnections,
    /// Connections owned by callers.
    pub active: ActiveConnections,
    /// Connections idle in the available queue.
    pub available: usize,
    /// Borrows waiting beyond supply.
    pub deficit: ConnectionDeficit,
    /// Connections destroyed due to invalidity since pool start.
    pub churned: ChurnedConnections,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={}, active={}, available={}, deficit={}, churn={}",
            self.total, self.active, self.available, self.deficit, self.churned
        )
    }
}

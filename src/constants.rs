//! Constants used throughout the pool
//!
//! Centralizes tuning values and configuration defaults.

use std::time::Duration;

/// Pool-internal tuning values.
pub mod pool {
    use super::Duration;

    /// Short bounded poll applied to the available queue before registering
    /// demand with the opener.
    pub const AVAILABLE_POLL: Duration = Duration::from_millis(1);

    /// Capacity of the per-metadata-handle result cache.
    pub const METADATA_CACHE_CAPACITY: usize = 1000;
}

/// Configuration defaults (see [`crate::config::PoolConfig`]).
pub mod defaults {
    use super::Duration;

    /// Deadline for borrow and for driver login.
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Bound on the driver validation probe.
    pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Driver-side per-execute timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Initial backoff after a failed open.
    pub const BACKOFF_PERIOD: Duration = Duration::from_secs(1);

    /// Idle dwell before the pruner shrinks the population.
    pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

    /// Pruner tick cadence.
    pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

    /// Per-connection statement cache capacity.
    pub const STATEMENT_CACHE_SIZE: usize = 100;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_relationships() {
        assert!(defaults::VALIDATION_TIMEOUT <= defaults::CONNECTION_TIMEOUT);
        assert!(defaults::PRUNE_INTERVAL <= defaults::INACTIVITY_TIMEOUT);
        assert!(pool::AVAILABLE_POLL < Duration::from_secs(1));
    }

    #[test]
    fn test_cache_capacities_nonzero() {
        const _: () = assert!(pool::METADATA_CACHE_CAPACITY > 0);
        const _: () = assert!(defaults::STATEMENT_CACHE_SIZE > 0);
    }
}

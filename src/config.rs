//! Pool configuration
//!
//! [`PoolConfig`] covers the data source coordinates (url, credentials,
//! session defaults) and the pool tuning knobs (population bounds, timeouts,
//! backoff, pruning, caching). Loadable from TOML, buildable fluently, and
//! validated before a pool accepts it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::defaults;
use crate::driver::{ConnectProps, IsolationLevel};

/// Serde helpers for durations expressed in whole seconds, the unit used in
/// config files.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a connection pool.
///
/// All durations are whole seconds in serialized form. A zero
/// `connection_timeout` falls back to `request_timeout`; a zero
/// `validation_timeout` falls back to `connection_timeout`. Zero
/// `inactivity_timeout` or `prune_interval` disables pruning; zero
/// `maximum_lifetime` disables end-of-life retirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Connection URL handed to the driver.
    pub url: String,

    /// User name; also set as the `user` connect property.
    pub username: Option<String>,

    /// Password; also set as the `password` connect property.
    pub password: Option<String>,

    /// Catalog applied to each new connection.
    pub catalog: Option<String>,

    /// Schema applied to each new connection.
    pub schema: Option<String>,

    /// Whether connections are opened read-only.
    pub read_only: bool,

    /// Transaction isolation applied to each new connection; `None` leaves
    /// the driver default.
    pub isolation: Option<IsolationLevel>,

    /// Auto-commit mode applied to each new connection.
    pub auto_commit: bool,

    /// Client identification applied via `ApplicationName` (with a vendor
    /// fallback) on each new connection.
    pub application_name: Option<String>,

    /// Opener target floor.
    pub minimum_connections: usize,

    /// Opener ceiling and borrow-side cap.
    pub maximum_connections: usize,

    /// Deadline for borrow and for driver login.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Run a full driver validation on every borrow.
    pub validate_on_borrow: bool,

    /// Bound on the validation probe.
    #[serde(with = "duration_serde")]
    pub validation_timeout: Duration,

    /// Driver-side per-execute timeout; zero disables it.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Initial backoff after a failed open.
    #[serde(with = "duration_serde")]
    pub backoff_period: Duration,

    /// Backoff growth factor per successive open failure.
    pub backoff_multiplier: f64,

    /// Upper clamp on the grown backoff; zero means unclamped.
    #[serde(with = "duration_serde")]
    pub backoff_limit: Duration,

    /// Idle dwell before the pruner shrinks the population; zero disables
    /// pruning.
    #[serde(with = "duration_serde")]
    pub inactivity_timeout: Duration,

    /// End-of-life age for connections; zero means never.
    #[serde(with = "duration_serde")]
    pub maximum_lifetime: Duration,

    /// Pruner tick cadence; zero disables pruning.
    #[serde(with = "duration_serde")]
    pub prune_interval: Duration,

    /// Cache metadata query results per metadata handle.
    pub cache_metadata: bool,

    /// Per-connection statement cache capacity; zero disables the cache.
    pub statement_cache_size: usize,

    /// Log rendered statement parameters at debug level.
    pub log_arguments: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            catalog: None,
            schema: None,
            read_only: false,
            isolation: None,
            auto_commit: false,
            application_name: None,
            minimum_connections: 0,
            maximum_connections: usize::MAX,
            connection_timeout: defaults::CONNECTION_TIMEOUT,
            validate_on_borrow: false,
            validation_timeout: defaults::VALIDATION_TIMEOUT,
            request_timeout: defaults::REQUEST_TIMEOUT,
            backoff_period: defaults::BACKOFF_PERIOD,
            backoff_multiplier: 1.0,
            backoff_limit: Duration::ZERO,
            inactivity_timeout: defaults::INACTIVITY_TIMEOUT,
            maximum_lifetime: Duration::ZERO,
            prune_interval: defaults::PRUNE_INTERVAL,
            cache_metadata: false,
            statement_cache_size: defaults::STATEMENT_CACHE_SIZE,
            log_arguments: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for the given URL with defaults everywhere else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create a builder for the given URL.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> PoolConfigBuilder {
        PoolConfigBuilder::new(url)
    }

    /// The effective borrow/login deadline: falls back to `request_timeout`
    /// when configured as zero.
    #[must_use]
    pub fn effective_connection_timeout(&self) -> Duration {
        if self.connection_timeout.is_zero() {
            self.request_timeout
        } else {
            self.connection_timeout
        }
    }

    /// The effective validation bound: falls back to the connection timeout
    /// when configured as zero.
    #[must_use]
    pub fn effective_validation_timeout(&self) -> Duration {
        if self.validation_timeout.is_zero() {
            self.effective_connection_timeout()
        } else {
            self.validation_timeout
        }
    }

    /// Connect properties derived from the configuration (credentials).
    #[must_use]
    pub fn connect_props(&self) -> ConnectProps {
        let mut props = ConnectProps::new();
        if let Some(username) = &self.username {
            props.set("user", username.clone());
        }
        if let Some(password) = &self.password {
            props.set("password", password.clone());
        }
        props
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty, the population bounds are
    /// inverted or zero, or the backoff multiplier is negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".into()));
        }
        if self.maximum_connections == 0 {
            return Err(ConfigError::Invalid(
                "maximum_connections must be at least 1".into(),
            ));
        }
        if self.minimum_connections > self.maximum_connections {
            return Err(ConfigError::Invalid(format!(
                "minimum_connections ({}) may not exceed maximum_connections ({})",
                self.minimum_connections, self.maximum_connections
            )));
        }
        if self.backoff_multiplier < 0.0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier may not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Load a pool configuration from a TOML file and validate it.
pub fn load_config(path: impl AsRef<Path>) -> Result<PoolConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: PoolConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    config.validate()?;

    Ok(config)
}

/// Fluent builder for [`PoolConfig`].
///
/// # Examples
///
/// ```
/// use sqlpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::builder("db://localhost/app")
///     .username("app")
///     .password("secret")
///     .minimum_connections(2)
///     .maximum_connections(20)
///     .connection_timeout(Duration::from_secs(10))
///     .build()
///     .unwrap();
/// assert_eq!(config.minimum_connections, 2);
/// ```
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Create a builder for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(url),
        }
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.config.catalog = Some(catalog.into());
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.config.isolation = Some(level);
        self
    }

    #[must_use]
    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.config.auto_commit = auto_commit;
        self
    }

    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn minimum_connections(mut self, min: usize) -> Self {
        self.config.minimum_connections = min;
        self
    }

    #[must_use]
    pub fn maximum_connections(mut self, max: usize) -> Self {
        self.config.maximum_connections = max;
        self
    }

    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn validate_on_borrow(mut self, validate: bool) -> Self {
        self.config.validate_on_borrow = validate;
        self
    }

    #[must_use]
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn backoff_period(mut self, period: Duration) -> Self {
        self.config.backoff_period = period;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn backoff_limit(mut self, limit: Duration) -> Self {
        self.config.backoff_limit = limit;
        self
    }

    #[must_use]
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout = timeout;
        self
    }

    #[must_use]
    pub fn maximum_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.maximum_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.config.prune_interval = interval;
        self
    }

    #[must_use]
    pub fn cache_metadata(mut self, cache: bool) -> Self {
        self.config.cache_metadata = cache;
        self
    }

    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.config.statement_cache_size = size;
        self
    }

    #[must_use]
    pub fn log_arguments(mut self, log: bool) -> Self {
        self.config.log_arguments = log;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = PoolConfig::default();
        assert_eq!(config.minimum_connections, 0);
        assert_eq!(config.maximum_connections, usize::MAX);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert!(!config.validate_on_borrow);
        assert_eq!(config.validation_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.backoff_period, Duration::from_secs(1));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.backoff_limit, Duration::ZERO);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(300));
        assert_eq!(config.maximum_lifetime, Duration::ZERO);
        assert_eq!(config.prune_interval, Duration::from_secs(60));
        assert!(!config.cache_metadata);
        assert_eq!(config.statement_cache_size, 100);
        assert!(!config.log_arguments);
        assert!(!config.auto_commit);
        assert!(!config.read_only);
    }

    #[test]
    fn test_connection_timeout_falls_back_to_request_timeout() {
        let mut config = PoolConfig::new("db://x");
        config.connection_timeout = Duration::ZERO;
        config.request_timeout = Duration::from_secs(45);
        assert_eq!(config.effective_connection_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_validation_timeout_falls_back_to_connection_timeout() {
        let mut config = PoolConfig::new("db://x");
        config.validation_timeout = Duration::ZERO;
        config.connection_timeout = Duration::from_secs(12);
        assert_eq!(config.effective_validation_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_validation_fallback_chains_through_request_timeout() {
        let mut config = PoolConfig::new("db://x");
        config.validation_timeout = Duration::ZERO;
        config.connection_timeout = Duration::ZERO;
        config.request_timeout = Duration::from_secs(7);
        assert_eq!(config.effective_validation_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_connect_props_from_credentials() {
        let config = PoolConfig::builder("db://x")
            .username("alice")
            .password("secret")
            .build()
            .unwrap();
        let props = config.connect_props();
        assert_eq!(props.get("user"), Some("alice"));
        assert_eq!(props.get("password"), Some("secret"));
    }

    #[test]
    fn test_connect_props_without_credentials() {
        let props = PoolConfig::new("db://x").connect_props();
        assert_eq!(props.get("user"), None);
        assert_eq!(props.get("password"), None);
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        assert!(PoolConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let result = PoolConfig::builder("db://x")
            .minimum_connections(10)
            .maximum_connections(5)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_max() {
        let result = PoolConfig::builder("db://x").maximum_connections(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_negative_multiplier() {
        let result = PoolConfig::builder("db://x").backoff_multiplier(-1.0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_chaining() {
        let config = PoolConfig::builder("db://localhost/app")
            .minimum_connections(2)
            .maximum_connections(8)
            .validate_on_borrow(true)
            .statement_cache_size(16)
            .maximum_lifetime(Duration::from_secs(1800))
            .build()
            .unwrap();

        assert_eq!(config.minimum_connections, 2);
        assert_eq!(config.maximum_connections, 8);
        assert!(config.validate_on_borrow);
        assert_eq!(config.statement_cache_size, 16);
        assert_eq!(config.maximum_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_src = r#"
            url = "db://localhost/app"
            username = "app"
            minimum_connections = 1
            maximum_connections = 10
            connection_timeout = 15
            inactivity_timeout = 120
            statement_cache_size = 32
        "#;
        let config: PoolConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.url, "db://localhost/app");
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert_eq!(config.inactivity_timeout, Duration::from_secs(120));
        assert_eq!(config.statement_cache_size, 32);
        // Unspecified fields keep their defaults.
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_toml_isolation_level() {
        let config: PoolConfig =
            toml::from_str("url = \"db://x\"\nisolation = \"read-committed\"").unwrap();
        assert_eq!(
            config.isolation,
            Some(crate::driver::IsolationLevel::ReadCommitted)
        );
    }
}

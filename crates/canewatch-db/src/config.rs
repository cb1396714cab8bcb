//! Typed persistence configuration.
//!
//! The configuration lives in `canewatch.yaml`. Every field has a default, so
//! an empty document (or no file at all) yields a usable local setup:
//!
//! ```yaml
//! connection:
//!   host: localhost
//!   port: 5432
//!   database: canewatch
//! pool:
//!   min: 1
//!   max: 5
//!   increment: 1
//!   timeout_secs: 60
//! retry:
//!   max_attempts: 3
//!   initial_delay_seconds: 1.0
//!   backoff_factor: 2.0
//!   max_delay_seconds: 30.0
//! simulated_mode: false
//! ```
//!
//! Credentials should come from the environment. `CANEWATCH_DB_USERNAME`
//! and `CANEWATCH_DB_PASSWORD` win over any value in the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable overriding `connection.username`.
pub const ENV_USERNAME: &str = "CANEWATCH_DB_USERNAME";
/// Environment variable overriding `connection.password`.
pub const ENV_PASSWORD: &str = "CANEWATCH_DB_PASSWORD";
/// Environment variable overriding `connection.host`.
pub const ENV_HOST: &str = "CANEWATCH_DB_HOST";
/// Environment variable overriding `connection.port`.
pub const ENV_PORT: &str = "CANEWATCH_DB_PORT";
/// Environment variable overriding `connection.database`.
pub const ENV_DATABASE: &str = "CANEWATCH_DB_NAME";
/// Environment variable overriding `simulated_mode` (`true`/`false`/`1`/`0`).
pub const ENV_SIMULATED: &str = "CANEWATCH_SIMULATED";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// A password that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reveal the secret for handing to the driver.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Top-level persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersistenceConfig {
    /// Where the database lives and how to authenticate.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Connection pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Serve every operation from memory without touching a database.
    #[serde(default)]
    pub simulated_mode: bool,
}

impl PersistenceConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment overrides are applied after parsing, then the result is
    /// validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, applying process
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(yaml, |key| std::env::var(key).ok())
    }

    /// Parse configuration from a YAML string, resolving overrides through
    /// `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`PersistenceConfig::parse`].
    pub fn parse_with_env(
        yaml: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides resolved through `lookup`.
    ///
    /// Credentials are overridden per field: a username from the
    /// environment and a password from the file is a valid combination.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(ENV_HOST) {
            self.connection.host = val;
        }
        if let Some(port) = lookup(ENV_PORT).and_then(|val| val.parse().ok()) {
            self.connection.port = port;
        }
        if let Some(val) = lookup(ENV_DATABASE) {
            self.connection.database = val;
        }
        if let Some(val) = lookup(ENV_SIMULATED) {
            self.simulated_mode = matches!(val.trim(), "1" | "true" | "yes");
        }

        let env_username = lookup(ENV_USERNAME);
        let env_password = lookup(ENV_PASSWORD);
        let from_file = (env_username.is_none() && self.connection.username.is_some())
            || (env_password.is_none() && self.connection.password.is_some());
        if let Some(val) = env_username {
            self.connection.username = Some(val);
        }
        if let Some(val) = env_password {
            self.connection.password = Some(Secret::new(val));
        }
        if from_file && !self.simulated_mode {
            tracing::warn!(
                "Using database credentials from the config file; prefer {ENV_USERNAME} and {ENV_PASSWORD}"
            );
        }
    }

    /// Check ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max == 0 {
            return Err(ConfigError::Invalid("pool.max must be at least 1".to_owned()));
        }
        if pool.min > pool.max {
            return Err(ConfigError::Invalid(format!(
                "pool.min ({}) exceeds pool.max ({})",
                pool.min, pool.max
            )));
        }
        if pool.increment == 0 {
            return Err(ConfigError::Invalid(
                "pool.increment must be at least 1".to_owned(),
            ));
        }
        if pool.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pool.timeout_secs must be at least 1".to_owned(),
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if !(retry.initial_delay_seconds.is_finite() && retry.initial_delay_seconds > 0.0) {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_seconds must be positive".to_owned(),
            ));
        }
        if !(retry.max_delay_seconds.is_finite()
            && retry.max_delay_seconds >= retry.initial_delay_seconds)
        {
            return Err(ConfigError::Invalid(
                "retry.max_delay_seconds must be at least retry.initial_delay_seconds".to_owned(),
            ));
        }
        if !(retry.backoff_factor.is_finite() && retry.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.backoff_factor must be at least 1.0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Database location and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Database host name.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database (catalog) name.
    #[serde(default = "default_database")]
    pub database: String,

    /// Login user. Prefer [`ENV_USERNAME`].
    #[serde(default)]
    pub username: Option<String>,

    /// Login password. Prefer [`ENV_PASSWORD`].
    #[serde(default)]
    pub password: Option<Secret>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: None,
            password: None,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open while idle.
    #[serde(default = "default_pool_min")]
    pub min: u32,

    /// Upper bound on open connections.
    #[serde(default = "default_pool_max")]
    pub max: u32,

    /// Connections opened per growth step.
    #[serde(default = "default_pool_increment")]
    pub increment: u32,

    /// Seconds to wait for a free connection before failing.
    #[serde(default = "default_pool_timeout_secs")]
    pub timeout_secs: u64,
}

impl PoolConfig {
    /// Acquisition timeout as a [`Duration`].
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            increment: default_pool_increment(),
            timeout_secs: default_pool_timeout_secs(),
        }
    }
}

/// Retry policy parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: f64,

    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Ceiling on the pre-jitter delay, in seconds.
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_seconds: default_initial_delay_seconds(),
            backoff_factor: default_backoff_factor(),
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_owned()
}

const fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "canewatch".to_owned()
}

const fn default_pool_min() -> u32 {
    1
}

const fn default_pool_max() -> u32 {
    5
}

const fn default_pool_increment() -> u32 {
    1
}

const fn default_pool_timeout_secs() -> u64 {
    60
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_seconds() -> f64 {
    1.0
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_delay_seconds() -> f64 {
    30.0
}

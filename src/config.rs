//! Store configuration

use crate::error::{MemoryError, Result};
use crate::maintenance::DEFAULT_HALF_LIFE_DAYS;
use std::time::Duration;

/// Environment variable holding an explicit database path (or `:memory:`).
pub const ENV_DB_PATH: &str = "MAGPIE_DB";
/// Environment variable overriding the busy timeout, in milliseconds.
pub const ENV_BUSY_TIMEOUT_MS: &str = "MAGPIE_BUSY_TIMEOUT_MS";
/// Environment variable overriding the default decay half-life.
pub const ENV_HALF_LIFE_DAYS: &str = "MAGPIE_HALF_LIFE_DAYS";

/// Configuration for opening a [`crate::FragmentStore`]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Explicit database path, `:memory:`, or `None` for the XDG default
    pub db_path: Option<String>,
    /// How long a writer waits on another process's lock
    pub busy_timeout: Duration,
    /// Pool size for file-backed stores (in-memory stores always use one)
    pub max_connections: u32,
    /// Half-life used by maintenance when the caller does not pass one
    pub half_life_days: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout: Duration::from_secs(5),
            max_connections: 4,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
        }
    }
}

impl StoreConfig {
    /// Configuration for a private in-memory store
    pub fn in_memory() -> Self {
        Self {
            db_path: Some(crate::paths::IN_MEMORY.to_string()),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `MAGPIE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.trim().is_empty() {
                config.db_path = Some(path);
            }
        }

        if let Ok(raw) = std::env::var(ENV_BUSY_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                MemoryError::Configuration(format!("{ENV_BUSY_TIMEOUT_MS} must be an integer, got {raw:?}"))
            })?;
            config.busy_timeout = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var(ENV_HALF_LIFE_DAYS) {
            let days: f64 = raw.trim().parse().map_err(|_| {
                MemoryError::Configuration(format!("{ENV_HALF_LIFE_DAYS} must be a number, got {raw:?}"))
            })?;
            config.half_life_days = days;
        }

        Ok(config)
    }
}

/// Builder for store config
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    pub fn db_path(mut self, path: impl Into<String>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.config.busy_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max.max(1);
        self
    }

    pub fn half_life_days(mut self, days: f64) -> Self {
        self.config.half_life_days = days;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

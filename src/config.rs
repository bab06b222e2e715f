use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CAPACITY: u64 = 10;
pub const DEFAULT_RATE: u64 = 1;
pub const DEFAULT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_PORT: u16 = 8080;

/// Parameters of a single token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket holds (burst size).
    pub capacity: u64,
    /// Tokens added on every refill tick.
    pub rate: u64,
    /// Milliseconds between refill ticks.
    pub interval_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            rate: DEFAULT_RATE,
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl BucketConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        if self.rate == 0 {
            return Err(Error::ZeroRate);
        }
        if self.interval_ms == 0 {
            return Err(Error::ZeroInterval);
        }
        Ok(())
    }
}

/// Settings for the HTTP host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub port: u16,
    pub bucket: BucketConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bucket: BucketConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Reads a JSON config file. Fields missing from the file keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

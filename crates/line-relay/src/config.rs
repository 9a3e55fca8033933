// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration.
//!
//! The relay is configured once at startup from a TOML file, layered with environment
//! overrides. Environment variables use the `RELAY_` prefix and `__` to descend into a
//! section, e.g. `RELAY_BATCH__SIZE=500` or `RELAY_LOG_LEVEL=debug`.
//!
//! ```toml
//! log_level = "info"
//!
//! [batch]
//! size = 1000
//! max_wait = "1s"
//! buffer_size = 10000
//!
//! [cache]
//! enabled = true
//! directory = "/var/lib/relay/cache"
//! batch_size = 100
//! wait = "10s"
//!
//! [write]
//! timeout = "10s"
//! threads = 4
//! repeat = 3
//! delay_time = "1s"
//!
//! [[write.streams]]
//! listen = "0.0.0.0:6086"
//! location = ["http://influx-a:8086", "http://influx-b:8086"]
//!
//! [monit]
//! listen = "0.0.0.0:9096"
//!
//! [limits.per_host]
//! regexp = '^(\w+),.*host=([^,\s]+).*'
//! replace = "$1:$2"
//! limit = 100000
//! unmatched = "pass"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::limits::UnmatchedPolicy;

const ENV_PREFIX: &str = "RELAY_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub write: WriteConfig,
    pub read: ReadConfig,
    pub monit: MonitConfig,
    pub limits: BTreeMap<String, LimitConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Lines per batch before it is flushed immediately
    pub size: usize,
    /// Dispatcher polling window, also the latest a partial batch waits
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Capacity of each destination queue, in write requests
    pub buffer_size: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    /// Maximum entries replayed per cycle
    pub batch_size: usize,
    /// Replay polling interval
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Per-call timeout for downstream writes
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Concurrent deliveries per destination
    pub threads: usize,
    /// Delivery attempts per batch
    pub repeat: u32,
    /// Sleep between attempts
    #[serde(with = "humantime_serde")]
    pub delay_time: Duration,
    /// Largest accepted write body, in bytes
    pub max_request_size: usize,
    /// Pending deliveries per destination above which `/ping` reports unhealthy
    pub max_pending: usize,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub listen: String,
    pub location: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitConfig {
    pub listen: Option<String>,
    /// Collection interval; tag counters reset on every collection
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub regexp: String,
    #[serde(default)]
    pub replace: String,
    /// Ceiling per tag and collection interval, 0 disables it
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            write: WriteConfig::default(),
            read: ReadConfig::default(),
            monit: MonitConfig::default(),
            limits: BTreeMap::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            max_wait: Duration::from_secs(1),
            buffer_size: 10_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            batch_size: 100,
            wait: Duration::from_secs(10),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            threads: 4,
            repeat: 3,
            delay_time: Duration::from_secs(1),
            max_request_size: 10 * 1024 * 1024, // 10MB in Bytes
            max_pending: 10_000,
            streams: Vec::new(),
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            streams: Vec::new(),
        }
    }
}

impl Default for MonitConfig {
    fn default() -> Self {
        Self {
            listen: None,
            interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Loads the TOML file at `path`, applies `RELAY_` environment overrides and validates
    /// the result.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Invalid(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Config, ConfigError> {
        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Every distinct write destination, in configuration order.
    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = Vec::new();
        for stream in &self.write.streams {
            for location in &stream.location {
                let location = normalize_location(location);
                if !destinations.contains(&location) {
                    destinations.push(location);
                }
            }
        }
        destinations
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.batch.size == 0 {
            return Err(invalid("batch.size must be greater than 0"));
        }
        if self.batch.buffer_size == 0 {
            return Err(invalid("batch.buffer_size must be greater than 0"));
        }
        if self.batch.max_wait.is_zero() {
            return Err(invalid("batch.max_wait must be greater than 0"));
        }
        if self.write.threads == 0 {
            return Err(invalid("write.threads must be greater than 0"));
        }
        if self.write.repeat == 0 {
            return Err(invalid("write.repeat must be greater than 0"));
        }
        if self.write.streams.is_empty() {
            return Err(invalid("at least one write stream is required"));
        }
        if self.cache.enabled {
            if self.cache.directory.is_none() {
                return Err(invalid("cache.directory is required when the cache is enabled"));
            }
            if self.cache.batch_size == 0 {
                return Err(invalid("cache.batch_size must be greater than 0"));
            }
        }
        if self.monit.interval.is_zero() {
            return Err(invalid("monit.interval must be greater than 0"));
        }
        for stream in self.write.streams.iter().chain(&self.read.streams) {
            if stream.location.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream {} has no locations",
                    stream.listen
                )));
            }
            for location in &stream.location {
                validate_location(location)?;
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

fn validate_location(location: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(ConfigError::Invalid(format!(
            "location {location} has unsupported scheme '{}'",
            url.scheme()
        ))),
        Err(e) => Err(ConfigError::Invalid(format!(
            "location {location} is not a valid URL: {e}"
        ))),
    }
}

/// Destinations are identified by their base URL without a trailing slash.
pub fn normalize_location(location: &str) -> String {
    location.trim().trim_end_matches('/').to_string()
}

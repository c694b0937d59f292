//! Engine configuration.
//!
//! Settings are layered: defaults, then an optional TOML file with an
//! `[engine]` table, then `SF_*` environment variables. The CLI applies its
//! own flags last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_OBJECT_STORE_URL: &str = "SF_OBJECT_STORE_URL";
pub const ENV_MAX_FUEL: &str = "SF_MAX_FUEL";
pub const ENV_GUEST_TIMEOUT_MS: &str = "SF_GUEST_TIMEOUT_MS";
pub const ENV_MAX_WORKERS: &str = "SF_MAX_WORKERS";
pub const ENV_SAVE_INTERVAL: &str = "SF_SAVE_INTERVAL";
pub const ENV_SUBREQUEST_SPLIT_SIZE: &str = "SF_SUBREQUEST_SPLIT_SIZE";
pub const ENV_VM_BACKEND: &str = "SF_VM_BACKEND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of all module state and output files.
    pub object_store_url: Option<String>,
    /// Per-call fuel budget; 0 disables fuel metering.
    pub max_fuel: u64,
    pub guest_timeout_ms: u64,
    pub max_workers: usize,
    /// Store snapshot and exec-output segment size, in blocks.
    pub save_interval: u64,
    /// Largest backfill job, in blocks. Defaults to the save interval.
    pub subrequest_split_size: Option<u64>,
    pub progress_interval_ms: u64,
    pub append_limit: u64,
    pub item_size_limit: u64,
    pub total_size_limit: u64,
    pub decimal_scale: i64,
    /// Blocks kept in memory as reversible before finality. Older blocks
    /// are treated as final; `0` keeps everything until finality.
    pub reorg_window: u64,
    pub vm_backend: String,
    pub guest_memory_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            object_store_url: None,
            max_fuel: 0,
            guest_timeout_ms: 30_000,
            max_workers: default_workers(),
            save_interval: 1_000,
            subrequest_split_size: None,
            progress_interval_ms: 200,
            append_limit: 8 * 1024 * 1024,
            item_size_limit: 10 * 1024 * 1024,
            total_size_limit: 1024 * 1024 * 1024,
            decimal_scale: 34,
            reorg_window: 256,
            vm_backend: "wasmtime".to_string(),
            guest_memory_limit: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    /// Load the `[engine]` table of a TOML file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        Ok(file.engine)
    }

    /// Apply `SF_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `SF_*` variables from an arbitrary lookup.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_OBJECT_STORE_URL).filter(|v| !v.is_empty()) {
            self.object_store_url = Some(url);
        }
        if let Some(v) = lookup(ENV_MAX_FUEL) {
            self.max_fuel = parse_num(ENV_MAX_FUEL, &v)?;
        }
        if let Some(v) = lookup(ENV_GUEST_TIMEOUT_MS) {
            self.guest_timeout_ms = parse_num(ENV_GUEST_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_WORKERS) {
            self.max_workers = parse_num(ENV_MAX_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_SAVE_INTERVAL) {
            self.save_interval = parse_num(ENV_SAVE_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_SUBREQUEST_SPLIT_SIZE) {
            self.subrequest_split_size = Some(parse_num(ENV_SUBREQUEST_SPLIT_SIZE, &v)?);
        }
        if let Some(v) = lookup(ENV_VM_BACKEND) {
            self.vm_backend = v;
        }
        Ok(self)
    }

    /// Check the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_store_url.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Missing(ENV_OBJECT_STORE_URL));
        }
        let positive = [
            ("save_interval", self.save_interval),
            ("guest_timeout_ms", self.guest_timeout_ms),
            ("max_workers", self.max_workers as u64),
            ("progress_interval_ms", self.progress_interval_ms),
            ("split_size", self.split_size()),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        if self.decimal_scale < 0 {
            return Err(ConfigError::InvalidValue {
                key: "decimal_scale".to_string(),
                value: self.decimal_scale.to_string(),
            });
        }
        Ok(())
    }

    pub fn split_size(&self) -> u64 {
        self.subrequest_split_size.unwrap_or(self.save_interval)
    }

    pub fn guest_timeout(&self) -> Duration {
        Duration::from_millis(self.guest_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Fuel budget, `None` when metering is disabled.
    pub fn fuel(&self) -> Option<u64> {
        (self.max_fuel > 0).then_some(self.max_fuel)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

//! Host configuration.

use std::time::Duration;

use substreams_core::EngineConfig;

/// Bytes of guest log kept per call.
pub const DEFAULT_LOG_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Per-call fuel; `None` disables metering.
    pub max_fuel: Option<u64>,
    /// Wall-clock bound on one call.
    pub timeout: Duration,
    /// Largest linear memory a guest may grow to.
    pub memory_limit: usize,
    pub table_limit: u32,
    pub log_limit: usize,
    pub backend: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl HostConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_fuel: config.fuel(),
            timeout: config.guest_timeout(),
            memory_limit: config.guest_memory_limit,
            table_limit: 10_000,
            log_limit: DEFAULT_LOG_LIMIT,
            backend: config.vm_backend.clone(),
        }
    }

    pub fn with_fuel(mut self, fuel: Option<u64>) -> Self {
        self.max_fuel = fuel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_log_limit(mut self, bytes: usize) -> Self {
        self.log_limit = bytes;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }
}

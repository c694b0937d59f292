//! Per-store configuration.

use substreams_core::{EngineConfig, ModuleDef, UpdatePolicy, ValueType};

/// Size and precision bounds shared by every store of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Largest value an `append` may accumulate under one key.
    pub append_limit: u64,
    pub item_size_limit: u64,
    pub total_size_limit: u64,
    pub decimal_scale: i64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl StoreLimits {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            append_limit: config.append_limit,
            item_size_limit: config.item_size_limit,
            total_size_limit: config.total_size_limit,
            decimal_scale: config.decimal_scale,
        }
    }

    pub fn with_append_limit(mut self, limit: u64) -> Self {
        self.append_limit = limit;
        self
    }

    pub fn with_total_size_limit(mut self, limit: u64) -> Self {
        self.total_size_limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub name: String,
    /// Hex module hash; every snapshot lives under it.
    pub module_hash: String,
    pub module_start: u64,
    pub policy: UpdatePolicy,
    pub value_type: ValueType,
    pub limits: StoreLimits,
}

impl StoreConfig {
    pub fn new(
        name: impl Into<String>,
        module_hash: impl Into<String>,
        module_start: u64,
        policy: UpdatePolicy,
        value_type: ValueType,
    ) -> Self {
        Self {
            name: name.into(),
            module_hash: module_hash.into(),
            module_start,
            policy,
            value_type,
            limits: StoreLimits::default(),
        }
    }

    /// Config for a store module, `None` for other kinds.
    pub fn from_module(module: &ModuleDef, module_hash: &str, limits: StoreLimits) -> Option<Self> {
        let (policy, value_type) = module.store_kind()?;
        Some(Self {
            limits,
            ..Self::new(
                module.name.clone(),
                module_hash,
                module.initial_block,
                policy,
                value_type.clone(),
            )
        })
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }
}

//! Runtime — compiled-module cache and instance pool over one backend.
//!
//! ```text
//! Runtime
//!   ├── Backend (wasmtime engine + linker, or native exports)
//!   ├── module cache (binary index → Module)
//!   └── idle instances per module name
//! ```
//!
//! The runtime is shared by every pipeline of a request, including backfill
//! workers, so all state sits behind mutexes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use substreams_core::Clock;
use tracing::{debug, info};

use crate::backend::{Backend, BackendRegistry, Instance, Module};
use crate::config::HostConfig;
use crate::context::CallContext;
use crate::error::GuestResult;
use crate::extensions::ExtensionRegistry;

/// Idle instances kept per module.
const MAX_IDLE: usize = 4;

pub struct Runtime {
    backend: Backend,
    config: HostConfig,
    extensions: Arc<ExtensionRegistry>,
    modules: Mutex<HashMap<usize, Module>>,
    idle: Mutex<HashMap<String, VecDeque<Instance>>>,
}

impl Runtime {
    /// Runtime over the backend named in `config`.
    pub fn new(config: HostConfig, extensions: ExtensionRegistry) -> GuestResult<Self> {
        let backend = BackendRegistry::default().create(&config, &extensions)?;
        Ok(Self::with_backend(backend, config, extensions))
    }

    pub fn with_backend(backend: Backend, config: HostConfig, extensions: ExtensionRegistry) -> Self {
        info!(backend = backend.name(), "guest runtime initialized");
        Self {
            backend,
            config,
            extensions: Arc::new(extensions),
            modules: Mutex::new(HashMap::new()),
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Compile binary `index`, once per runtime.
    pub fn load_module(&self, index: usize, name: &str, bytes: &[u8]) -> GuestResult<Module> {
        if let Some(module) = self.modules.lock().get(&index) {
            return Ok(module.clone());
        }
        let module = self.backend.compile(name, bytes)?;
        debug!(index, module = name, "binary compiled");
        self.modules.lock().insert(index, module.clone());
        Ok(module)
    }

    /// An idle instance for `name`, or a fresh one of `module`.
    pub fn acquire(&self, name: &str, module: &Module) -> GuestResult<Instance> {
        if let Some(instance) = self.idle.lock().get_mut(name).and_then(VecDeque::pop_front) {
            return Ok(instance);
        }
        self.backend.instantiate(module, &self.config)
    }

    /// Return a healthy instance for reuse. Instances whose last call failed
    /// must be dropped instead.
    pub fn release(&self, name: &str, instance: Instance) {
        let mut idle = self.idle.lock();
        let queue = idle.entry(name.to_string()).or_default();
        if queue.len() < MAX_IDLE {
            queue.push_back(instance);
        }
    }

    /// Call context carrying this runtime's extensions and log cap.
    pub fn context(&self, module: &str, clock: Clock) -> CallContext {
        CallContext::new(module, clock)
            .with_extensions(self.extensions.clone())
            .with_log_limit(self.config.log_limit)
    }
}

//! Backend selection.
//!
//! A backend compiles module binaries and creates instances. Modules and
//! instances are tagged by the backend that produced them; the registry maps
//! backend names to factories so configuration can pick one by name.

use std::collections::BTreeMap;

use crate::config::HostConfig;
use crate::context::{CallArg, CallContext, CallOutcome};
use crate::error::{CallError, GuestError, GuestResult};
use crate::extensions::ExtensionRegistry;
use crate::native::{NativeBackend, NativeInstance, NativeModule};
use crate::wasm::{WasmtimeBackend, WasmtimeInstance};

pub const WASMTIME: &str = "wasmtime";
pub const NATIVE: &str = "native";

#[derive(Clone)]
pub enum Backend {
    Wasmtime(WasmtimeBackend),
    Native(NativeBackend),
}

#[derive(Clone)]
pub enum Module {
    Wasmtime { name: String, module: wasmtime::Module },
    Native(NativeModule),
}

pub enum Instance {
    Wasmtime(WasmtimeInstance),
    Native(NativeInstance),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Wasmtime(_) => WASMTIME,
            Backend::Native(_) => NATIVE,
        }
    }

    pub fn compile(&self, name: &str, bytes: &[u8]) -> GuestResult<Module> {
        match self {
            Backend::Wasmtime(b) => Ok(Module::Wasmtime {
                name: name.to_string(),
                module: b.compile(name, bytes)?,
            }),
            Backend::Native(b) => Ok(Module::Native(b.compile(name))),
        }
    }

    pub fn instantiate(&self, module: &Module, config: &HostConfig) -> GuestResult<Instance> {
        match (self, module) {
            (Backend::Wasmtime(b), Module::Wasmtime { name, module }) => {
                Ok(Instance::Wasmtime(b.instantiate(name, module)?))
            }
            (Backend::Native(b), Module::Native(module)) => {
                Ok(Instance::Native(b.instantiate(module, config)))
            }
            _ => Err(GuestError::Backend(format!(
                "module was not compiled by the {} backend",
                self.name()
            ))),
        }
    }
}

impl Instance {
    pub fn module(&self) -> &str {
        match self {
            Instance::Wasmtime(i) => i.module(),
            Instance::Native(i) => i.module(),
        }
    }

    /// Run `entrypoint` once. Bytes arguments are copied into guest memory
    /// and freed when the call returns.
    pub fn call(
        &mut self,
        entrypoint: &str,
        args: &[CallArg],
        ctx: CallContext,
    ) -> Result<CallOutcome, CallError> {
        match self {
            Instance::Wasmtime(i) => i.call(entrypoint, args, ctx),
            Instance::Native(i) => i.call(entrypoint, args, ctx),
        }
    }
}

pub type BackendFactory = fn(&HostConfig, &ExtensionRegistry) -> GuestResult<Backend>;

pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register(WASMTIME, |config, extensions| {
            Ok(Backend::Wasmtime(WasmtimeBackend::new(config, extensions)?))
        });
        registry.register(NATIVE, |_, _| Ok(Backend::Native(NativeBackend::new())));
        registry
    }
}

impl BackendRegistry {
    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the backend named by `config.backend`.
    pub fn create(&self, config: &HostConfig, extensions: &ExtensionRegistry) -> GuestResult<Backend> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| GuestError::UnknownBackend(config.backend.clone()))?;
        factory(config, extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtin_backends() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![NATIVE, WASMTIME]);

        let config = HostConfig::default().with_backend("native");
        let backend = registry.create(&config, &ExtensionRegistry::new()).unwrap();
        assert_eq!(backend.name(), NATIVE);

        let config = HostConfig::default().with_backend("v8");
        assert!(matches!(
            registry.create(&config, &ExtensionRegistry::new()),
            Err(GuestError::UnknownBackend(name)) if name == "v8"
        ));
    }
}

//! Extension host functions.
//!
//! Deployments may expose extra imports to guests under their own namespace.
//! Every extension takes the same shape as the built-in readers: the guest
//! passes `(ptr, len, out_ptr)` and receives the handler's output through
//! `out_ptr`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use substreams_core::Clock;

/// What an extension handler knows about the calling module.
#[derive(Debug)]
pub struct ExtensionCall<'a> {
    pub module: &'a str,
    pub clock: &'a Clock,
}

pub type ExtensionFn =
    Arc<dyn Fn(&ExtensionCall<'_>, &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    handlers: BTreeMap<(String, String), ExtensionFn>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `namespace::name`, replacing an earlier handler.
    pub fn register<F>(&mut self, namespace: &str, name: &str, handler: F)
    where
        F: Fn(&ExtensionCall<'_>, &[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.handlers
            .insert((namespace.to_string(), name.to_string()), Arc::new(handler));
    }

    pub fn with<F>(mut self, namespace: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&ExtensionCall<'_>, &[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.register(namespace, name, handler);
        self
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&ExtensionFn> {
        self.handlers
            .get(&(namespace.to_string(), name.to_string()))
    }

    /// Registered `(namespace, name)` pairs, sorted.
    pub fn names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handlers.keys().map(|(ns, n)| (ns.as_str(), n.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

//! substreams-host — runs module code in a sandbox.
//!
//! - **Backends**: wasmtime for wasm guests, native for Rust closures; both
//!   share the host imports in [`imports`]
//! - **Limits**: fuel, an epoch deadline and a memory cap per call
//! - **Contract**: readers see foreign stores as of the previous block,
//!   writes go to the module's own store, logs are capped per call
//!
//! ```text
//! Runtime ── Backend ──┬── WasmtimeBackend ── Linker<HostState> ─┐
//!                      └── NativeBackend ── NativeHost ──────────┴── imports ── CallContext
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod extensions;
pub mod imports;
pub mod limiter;
pub mod native;
pub mod runtime;
pub mod wasm;

pub use backend::{Backend, BackendFactory, BackendRegistry, Instance, Module};
pub use cancel::{CancelHandle, CancelToken};
pub use config::HostConfig;
pub use context::{CallArg, CallContext, CallOutcome, CallStats, PanicInfo, SharedKvStore};
pub use error::{CallError, GuestError, GuestResult};
pub use extensions::{ExtensionCall, ExtensionRegistry};
pub use native::{NativeBackend, NativeHost};
pub use runtime::Runtime;
pub use wasm::WasmtimeBackend;

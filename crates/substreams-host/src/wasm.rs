//! Wasmtime backend.
//!
//! Guests are core wasm modules exporting `memory`, `alloc(len) -> ptr` and
//! `dealloc(ptr, len)`. Host imports live under the `env`, `logger` and
//! `state` namespaces plus any registered extension namespaces. Fuel bounds
//! instructions per call; an epoch ticker bounds wall-clock time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Memory, Module, OptLevel, Store, Trap, TypedFunc, Val,
};

use crate::config::HostConfig;
use crate::context::{CallArg, CallContext, CallOutcome};
use crate::error::{CallError, GuestError, GuestResult};
use crate::extensions::ExtensionRegistry;
use crate::imports::{self, HostEnv};
use crate::limiter::GuestLimiter;

const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Store data of every wasmtime instance.
pub struct HostState {
    ctx: CallContext,
    /// Guest allocations made by the host during the current call.
    allocations: Vec<(i32, i32)>,
    limiter: GuestLimiter,
}

/// Increments the engine epoch until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        thread::Builder::new()
            .name("substreams-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| warn!(error = %e, "epoch ticker not started, guest timeouts disabled"));
        Self { stop }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct WasmtimeBackend {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    config: HostConfig,
    _ticker: Arc<EpochTicker>,
}

impl WasmtimeBackend {
    pub fn new(config: &HostConfig, extensions: &ExtensionRegistry) -> GuestResult<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.consume_fuel(config.max_fuel.is_some());
        wasm_config.cranelift_opt_level(OptLevel::Speed);
        // NaN bit patterns would otherwise leak host differences into outputs.
        wasm_config.cranelift_nan_canonicalization(true);
        wasm_config.wasm_threads(false);

        let engine = Engine::new(&wasm_config).map_err(|e| GuestError::Backend(e.to_string()))?;
        let mut linker = Linker::new(&engine);
        link_imports(&mut linker, extensions)?;

        let ticker = EpochTicker::start(engine.clone());
        debug!(fuel = ?config.max_fuel, timeout_ms = config.timeout.as_millis() as u64, "wasmtime backend ready");
        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config: config.clone(),
            _ticker: Arc::new(ticker),
        })
    }

    pub fn compile(&self, name: &str, bytes: &[u8]) -> GuestResult<Module> {
        Module::new(&self.engine, bytes).map_err(|e| GuestError::Compile {
            module: name.to_string(),
            reason: format!("{e:#}"),
        })
    }

    pub fn instantiate(&self, name: &str, module: &Module) -> GuestResult<WasmtimeInstance> {
        let state = HostState {
            ctx: CallContext::idle(),
            allocations: Vec::new(),
            limiter: GuestLimiter::new(self.config.memory_limit, self.config.table_limit),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|s| &mut s.limiter);
        arm(&mut store, &self.config)?;

        let instantiate_err = |reason: String| GuestError::Instantiate {
            module: name.to_string(),
            reason,
        };
        let instance = self
            .linker
            .instantiate(&mut store, module)
            .map_err(|e| instantiate_err(format!("{e:#}")))?;

        let missing = |export: &str| GuestError::MissingExport {
            module: name.to_string(),
            export: export.to_string(),
        };
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| missing("memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|_| missing("alloc"))?;
        let dealloc = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "dealloc")
            .map_err(|_| missing("dealloc"))?;

        Ok(WasmtimeInstance {
            module: name.to_string(),
            store,
            instance,
            memory,
            alloc,
            dealloc,
            config: self.config.clone(),
        })
    }
}

/// Refill fuel and push the epoch deadline out by one timeout.
fn arm(store: &mut Store<HostState>, config: &HostConfig) -> GuestResult<()> {
    if let Some(fuel) = config.max_fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| GuestError::Backend(e.to_string()))?;
    }
    let ticks = (config.timeout.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64 + 1;
    store.set_epoch_deadline(ticks);
    store.epoch_deadline_trap();
    Ok(())
}

fn classify(module: &str, err: wasmtime::Error) -> GuestError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => GuestError::OutOfFuel {
            module: module.to_string(),
        },
        Some(Trap::Interrupt) => GuestError::Timeout {
            module: module.to_string(),
        },
        Some(trap) => GuestError::Trap {
            module: module.to_string(),
            reason: trap.to_string(),
        },
        None => GuestError::Trap {
            module: module.to_string(),
            reason: format!("{err:#}"),
        },
    }
}

pub struct WasmtimeInstance {
    module: String,
    store: Store<HostState>,
    instance: wasmtime::Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: TypedFunc<(i32, i32), ()>,
    config: HostConfig,
}

impl WasmtimeInstance {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn call(
        &mut self,
        entrypoint: &str,
        args: &[CallArg],
        ctx: CallContext,
    ) -> Result<CallOutcome, CallError> {
        self.store.data_mut().ctx = ctx;
        let trap = self.invoke(entrypoint, args).err();
        self.release();
        let ctx = std::mem::replace(&mut self.store.data_mut().ctx, CallContext::idle());
        ctx.finish(trap)
    }

    fn invoke(&mut self, entrypoint: &str, args: &[CallArg]) -> GuestResult<()> {
        arm(&mut self.store, &self.config)?;
        let func = self
            .instance
            .get_func(&mut self.store, entrypoint)
            .ok_or_else(|| GuestError::MissingExport {
                module: self.module.clone(),
                export: entrypoint.to_string(),
            })?;

        let mut params = Vec::with_capacity(args.len() * 2);
        for arg in args {
            match arg {
                CallArg::Bytes(bytes) => {
                    let ptr = self.write(bytes)?;
                    params.push(Val::I32(ptr));
                    params.push(Val::I32(bytes.len() as i32));
                }
                CallArg::StoreIndex(idx) => params.push(Val::I32(*idx as i32)),
            }
        }

        func.call(&mut self.store, &params, &mut [])
            .map_err(|e| classify(&self.module, e))
    }

    /// Copy `bytes` into a fresh guest allocation, freed after the call.
    pub fn write(&mut self, bytes: &[u8]) -> GuestResult<i32> {
        let ptr = self
            .alloc
            .call(&mut self.store, bytes.len() as i32)
            .map_err(|e| classify(&self.module, e))?;
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| GuestError::Trap {
                module: self.module.clone(),
                reason: format!("alloc returned an invalid pointer: {e}"),
            })?;
        self.store.data_mut().allocations.push((ptr, bytes.len() as i32));
        Ok(ptr)
    }

    pub fn read(&mut self, ptr: i32, len: i32) -> GuestResult<Vec<u8>> {
        let mut buf = vec![0u8; len.max(0) as usize];
        self.memory
            .read(&self.store, ptr as usize, &mut buf)
            .map_err(|e| GuestError::Trap {
                module: self.module.clone(),
                reason: e.to_string(),
            })?;
        Ok(buf)
    }

    /// Free every allocation the host made during the call.
    fn release(&mut self) {
        let allocations = std::mem::take(&mut self.store.data_mut().allocations);
        if allocations.is_empty() {
            return;
        }
        if arm(&mut self.store, &self.config).is_err() {
            return;
        }
        for (ptr, len) in allocations {
            if let Err(e) = self.dealloc.call(&mut self.store, (ptr, len)) {
                debug!(module = %self.module, error = %e, "guest dealloc failed");
                break;
            }
        }
    }
}

// ── Host environment over a wasmtime caller ────────────────────────

fn exported_memory(caller: &mut Caller<'_, HostState>) -> GuestResult<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(GuestError::MissingExport {
            module: caller.data().ctx.module.clone(),
            export: "memory".into(),
        }),
    }
}

impl HostEnv for Caller<'_, HostState> {
    fn ctx(&mut self) -> &mut CallContext {
        &mut self.data_mut().ctx
    }

    fn read(&mut self, ptr: i32, len: i32) -> GuestResult<Vec<u8>> {
        let memory = exported_memory(self)?;
        let mut buf = vec![0u8; len as usize];
        match memory.read(&*self, ptr as usize, &mut buf) {
            Ok(()) => Ok(buf),
            Err(_) => Err(self
                .ctx()
                .violation(format!("read of {len} bytes at {ptr} is out of bounds"))),
        }
    }

    fn write(&mut self, ptr: i32, bytes: &[u8]) -> GuestResult<()> {
        let memory = exported_memory(self)?;
        match memory.write(&mut *self, ptr as usize, bytes) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.ctx().violation(format!(
                "write of {} bytes at {ptr} is out of bounds",
                bytes.len()
            ))),
        }
    }

    fn alloc(&mut self, len: i32) -> GuestResult<i32> {
        let module = self.data().ctx.module.clone();
        let func = match self.get_export("alloc") {
            Some(Extern::Func(func)) => func,
            _ => {
                return Err(GuestError::MissingExport {
                    module,
                    export: "alloc".into(),
                });
            }
        };
        let alloc = func
            .typed::<i32, i32>(&*self)
            .map_err(|_| GuestError::MissingExport {
                module: module.clone(),
                export: "alloc".into(),
            })?;
        let ptr = alloc
            .call(&mut *self, len)
            .map_err(|e| classify(&module, e))?;
        self.data_mut().allocations.push((ptr, len));
        Ok(ptr)
    }
}

// ── Linking ────────────────────────────────────────────────────────

/// Record a failed import in the call context and trap the guest.
fn trap<T>(caller: &mut Caller<'_, HostState>, result: GuestResult<T>) -> wasmtime::Result<T> {
    result.map_err(|err| {
        let message = err.to_string();
        caller.data_mut().ctx.fail(err);
        wasmtime::Error::msg(message)
    })
}

macro_rules! host_fn {
    ($linker:ident, $ns:literal, $name:literal, $func:path, ($($arg:ident : $ty:ty),*) -> $ret:ty) => {
        $linker
            .func_wrap(
                $ns,
                $name,
                |mut caller: Caller<'_, HostState>, $($arg: $ty),*| -> wasmtime::Result<$ret> {
                    let result = $func(&mut caller, $($arg),*);
                    trap(&mut caller, result)
                },
            )
            .map_err(|e| GuestError::Backend(format!("linking {}::{}: {e}", $ns, $name)))?;
    };
}

fn link_imports(linker: &mut Linker<HostState>, extensions: &ExtensionRegistry) -> GuestResult<()> {
    host_fn!(linker, "env", "output", imports::output, (ptr: i32, len: i32) -> ());
    host_fn!(linker, "env", "register_panic", imports::register_panic,
        (msg_ptr: i32, msg_len: i32, file_ptr: i32, file_len: i32, line: i32, column: i32) -> ());
    host_fn!(linker, "logger", "println", imports::println, (ptr: i32, len: i32) -> ());

    host_fn!(linker, "state", "set", imports::set,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "set_if_not_exists", imports::set_if_not_exists,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "append", imports::append,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "delete_prefix", imports::delete_prefix,
        (ord: i64, pp: i32, pl: i32) -> ());

    host_fn!(linker, "state", "add_int64", imports::add_int64, (ord: i64, kp: i32, kl: i32, v: i64) -> ());
    host_fn!(linker, "state", "add_float64", imports::add_float64, (ord: i64, kp: i32, kl: i32, v: f64) -> ());
    host_fn!(linker, "state", "add_bigint", imports::add_bigint,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "add_bigdecimal", imports::add_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "add_bigfloat", imports::add_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());

    host_fn!(linker, "state", "set_min_int64", imports::set_min_int64, (ord: i64, kp: i32, kl: i32, v: i64) -> ());
    host_fn!(linker, "state", "set_min_float64", imports::set_min_float64, (ord: i64, kp: i32, kl: i32, v: f64) -> ());
    host_fn!(linker, "state", "set_min_bigint", imports::set_min_bigint,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "set_min_bigdecimal", imports::set_min_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "set_min_bigfloat", imports::set_min_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());

    host_fn!(linker, "state", "set_max_int64", imports::set_max_int64, (ord: i64, kp: i32, kl: i32, v: i64) -> ());
    host_fn!(linker, "state", "set_max_float64", imports::set_max_float64, (ord: i64, kp: i32, kl: i32, v: f64) -> ());
    host_fn!(linker, "state", "set_max_bigint", imports::set_max_bigint,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "set_max_bigdecimal", imports::set_max_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());
    host_fn!(linker, "state", "set_max_bigfloat", imports::set_max_bigdecimal,
        (ord: i64, kp: i32, kl: i32, vp: i32, vl: i32) -> ());

    host_fn!(linker, "state", "get_at", imports::get_at,
        (idx: i32, ord: i64, kp: i32, kl: i32, out: i32) -> i32);
    host_fn!(linker, "state", "get_first", imports::get_first, (idx: i32, kp: i32, kl: i32, out: i32) -> i32);
    host_fn!(linker, "state", "get_last", imports::get_last, (idx: i32, kp: i32, kl: i32, out: i32) -> i32);
    host_fn!(linker, "state", "has_at", imports::has_at, (idx: i32, ord: i64, kp: i32, kl: i32) -> i32);
    host_fn!(linker, "state", "has_first", imports::has_first, (idx: i32, kp: i32, kl: i32) -> i32);
    host_fn!(linker, "state", "has_last", imports::has_last, (idx: i32, kp: i32, kl: i32) -> i32);

    for (namespace, name) in extensions.names() {
        let (ns, n) = (namespace.to_string(), name.to_string());
        linker
            .func_wrap(
                namespace,
                name,
                move |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, out_ptr: i32| -> wasmtime::Result<()> {
                    let result = imports::extension(&mut caller, &ns, &n, ptr, len, out_ptr);
                    trap(&mut caller, result)
                },
            )
            .map_err(|e| GuestError::Backend(format!("linking {namespace}::{name}: {e}")))?;
    }
    Ok(())
}

//! Native backend: guests written as Rust closures.
//!
//! A native guest sees the same calling convention as a wasm guest. It owns a
//! byte-addressed heap, receives `(ptr, len)` pairs and store indices as
//! `i32` arguments, and reaches the host through [`NativeHost`], which routes
//! every request through the same imports the wasm backend links. Native
//! guests are not fuel metered; the call deadline is checked at each host call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use substreams_core::Clock;

use crate::config::HostConfig;
use crate::context::{CallArg, CallContext, CallOutcome};
use crate::error::{CallError, GuestError, GuestResult};
use crate::imports::{self, HostEnv};

/// Address of the first allocation; 0 stays null.
const HEAP_BASE: usize = 8;

pub type NativeFn = Arc<dyn Fn(&mut NativeHost<'_>, &[i32]) -> GuestResult<()> + Send + Sync>;

/// Exported entrypoints, by name.
#[derive(Clone, Default)]
pub struct NativeBackend {
    exports: BTreeMap<String, NativeFn>,
}

impl fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBackend")
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export<F>(mut self, entrypoint: &str, guest: F) -> Self
    where
        F: Fn(&mut NativeHost<'_>, &[i32]) -> GuestResult<()> + Send + Sync + 'static,
    {
        self.exports.insert(entrypoint.to_string(), Arc::new(guest));
        self
    }

    /// Native binaries carry no code; the module exposes every registered export.
    pub fn compile(&self, name: &str) -> NativeModule {
        NativeModule {
            name: name.to_string(),
            exports: Arc::new(self.exports.clone()),
        }
    }

    pub fn instantiate(&self, module: &NativeModule, config: &HostConfig) -> NativeInstance {
        NativeInstance {
            module: module.name.clone(),
            exports: module.exports.clone(),
            heap: NativeHeap::new(config.memory_limit),
            config: config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct NativeModule {
    name: String,
    exports: Arc<BTreeMap<String, NativeFn>>,
}

impl NativeModule {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Bump-allocated guest memory, emptied after every call.
struct NativeHeap {
    data: Vec<u8>,
    limit: usize,
}

impl NativeHeap {
    fn new(limit: usize) -> Self {
        Self {
            data: vec![0; HEAP_BASE],
            limit,
        }
    }

    fn alloc(&mut self, len: usize) -> Option<usize> {
        let ptr = self.data.len().next_multiple_of(8);
        let end = ptr.checked_add(len)?;
        if end > self.limit || end > i32::MAX as usize {
            return None;
        }
        self.data.resize(end, 0);
        Some(ptr)
    }

    fn slice(&self, ptr: usize, len: usize) -> Option<&[u8]> {
        self.data.get(ptr..ptr.checked_add(len)?)
    }

    fn slice_mut(&mut self, ptr: usize, len: usize) -> Option<&mut [u8]> {
        self.data.get_mut(ptr..ptr.checked_add(len)?)
    }

    fn reset(&mut self) {
        self.data.truncate(HEAP_BASE);
    }
}

pub struct NativeInstance {
    module: String,
    exports: Arc<BTreeMap<String, NativeFn>>,
    heap: NativeHeap,
    config: HostConfig,
}

impl NativeInstance {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn call(
        &mut self,
        entrypoint: &str,
        args: &[CallArg],
        ctx: CallContext,
    ) -> Result<CallOutcome, CallError> {
        let ctx = ctx.with_deadline(Instant::now() + self.config.timeout);
        let mut host = NativeHost {
            ctx,
            heap: &mut self.heap,
        };
        let trap = invoke(&self.exports, &self.module, &mut host, entrypoint, args).err();
        let NativeHost { ctx, heap } = host;
        heap.reset();
        ctx.finish(trap)
    }
}

fn invoke(
    exports: &BTreeMap<String, NativeFn>,
    module: &str,
    host: &mut NativeHost<'_>,
    entrypoint: &str,
    args: &[CallArg],
) -> GuestResult<()> {
    let guest = exports
        .get(entrypoint)
        .ok_or_else(|| GuestError::MissingExport {
            module: module.to_string(),
            export: entrypoint.to_string(),
        })?;
    let mut params = Vec::with_capacity(args.len() * 2);
    for arg in args {
        match arg {
            CallArg::Bytes(bytes) => {
                let (ptr, len) = host.place(bytes)?;
                params.push(ptr);
                params.push(len);
            }
            CallArg::StoreIndex(idx) => params.push(*idx as i32),
        }
    }
    guest(host, &params)
}

/// The host as seen from a native guest.
pub struct NativeHost<'a> {
    ctx: CallContext,
    heap: &'a mut NativeHeap,
}

impl HostEnv for NativeHost<'_> {
    fn ctx(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    fn read(&mut self, ptr: i32, len: i32) -> GuestResult<Vec<u8>> {
        match self.heap.slice(ptr as usize, len as usize) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(self
                .ctx
                .violation(format!("read of {len} bytes at {ptr} is out of bounds"))),
        }
    }

    fn write(&mut self, ptr: i32, bytes: &[u8]) -> GuestResult<()> {
        match self.heap.slice_mut(ptr as usize, bytes.len()) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(self.ctx.violation(format!(
                "write of {} bytes at {ptr} is out of bounds",
                bytes.len()
            ))),
        }
    }

    fn alloc(&mut self, len: i32) -> GuestResult<i32> {
        self.heap
            .alloc(len.max(0) as usize)
            .map(|ptr| ptr as i32)
            .ok_or_else(|| GuestError::Trap {
                module: self.ctx.module.clone(),
                reason: "out of memory".into(),
            })
    }
}

impl NativeHost<'_> {
    pub fn clock(&self) -> &Clock {
        &self.ctx.clock
    }

    /// Bytes of an `(ptr, len)` argument pair.
    pub fn input(&mut self, ptr: i32, len: i32) -> GuestResult<Vec<u8>> {
        HostEnv::read(self, ptr, len)
    }

    fn place(&mut self, bytes: &[u8]) -> GuestResult<(i32, i32)> {
        let ptr = self.alloc(bytes.len() as i32)?;
        self.write(ptr, bytes)?;
        Ok((ptr, bytes.len() as i32))
    }

    /// Same contract as the wasm trap path: the failure is recorded and the
    /// guest only sees that the call did not succeed.
    fn guard<T>(&mut self, result: GuestResult<T>) -> GuestResult<T> {
        result.map_err(|err| {
            let reason = err.to_string();
            self.ctx.fail(err);
            GuestError::Trap {
                module: self.ctx.module.clone(),
                reason,
            }
        })
    }

    fn read_result(&mut self, found: i32, out: i32) -> GuestResult<Option<Vec<u8>>> {
        if found == 0 {
            return Ok(None);
        }
        let pair = HostEnv::read(self, out, 8)?;
        let ptr = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let len = i32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        HostEnv::read(self, ptr, len).map(Some)
    }

    pub fn output(&mut self, data: &[u8]) -> GuestResult<()> {
        let (ptr, len) = self.place(data)?;
        let result = imports::output(self, ptr, len);
        self.guard(result)
    }

    pub fn println(&mut self, line: &str) -> GuestResult<()> {
        let (ptr, len) = self.place(line.as_bytes())?;
        let result = imports::println(self, ptr, len);
        self.guard(result)
    }

    pub fn register_panic(&mut self, message: &str, file: &str, line: u32, column: u32) -> GuestResult<()> {
        let (mp, ml) = self.place(message.as_bytes())?;
        let (fp, fl) = self.place(file.as_bytes())?;
        let result = imports::register_panic(self, mp, ml, fp, fl, line as i32, column as i32);
        self.guard(result)
    }

    pub fn set(&mut self, ord: u64, key: &str, value: &[u8]) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value)?;
        let result = imports::set(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn set_if_not_exists(&mut self, ord: u64, key: &str, value: &[u8]) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value)?;
        let result = imports::set_if_not_exists(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn append(&mut self, ord: u64, key: &str, value: &[u8]) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value)?;
        let result = imports::append(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn delete_prefix(&mut self, ord: u64, prefix: &str) -> GuestResult<()> {
        let (pp, pl) = self.place(prefix.as_bytes())?;
        let result = imports::delete_prefix(self, ord as i64, pp, pl);
        self.guard(result)
    }

    pub fn add_int64(&mut self, ord: u64, key: &str, value: i64) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::add_int64(self, ord as i64, kp, kl, value);
        self.guard(result)
    }

    pub fn add_float64(&mut self, ord: u64, key: &str, value: f64) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::add_float64(self, ord as i64, kp, kl, value);
        self.guard(result)
    }

    pub fn add_bigint(&mut self, ord: u64, key: &str, value: &str) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value.as_bytes())?;
        let result = imports::add_bigint(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn add_bigdecimal(&mut self, ord: u64, key: &str, value: &str) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value.as_bytes())?;
        let result = imports::add_bigdecimal(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn set_min_int64(&mut self, ord: u64, key: &str, value: i64) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::set_min_int64(self, ord as i64, kp, kl, value);
        self.guard(result)
    }

    pub fn set_max_int64(&mut self, ord: u64, key: &str, value: i64) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::set_max_int64(self, ord as i64, kp, kl, value);
        self.guard(result)
    }

    pub fn set_max_bigint(&mut self, ord: u64, key: &str, value: &str) -> GuestResult<()> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (vp, vl) = self.place(value.as_bytes())?;
        let result = imports::set_max_bigint(self, ord as i64, kp, kl, vp, vl);
        self.guard(result)
    }

    pub fn get_at(&mut self, store_idx: i32, ord: u64, key: &str) -> GuestResult<Option<Vec<u8>>> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (out, _) = self.place(&[0; 8])?;
        let result = imports::get_at(self, store_idx, ord as i64, kp, kl, out);
        let found = self.guard(result)?;
        self.read_result(found, out)
    }

    pub fn get_first(&mut self, store_idx: i32, key: &str) -> GuestResult<Option<Vec<u8>>> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (out, _) = self.place(&[0; 8])?;
        let result = imports::get_first(self, store_idx, kp, kl, out);
        let found = self.guard(result)?;
        self.read_result(found, out)
    }

    pub fn get_last(&mut self, store_idx: i32, key: &str) -> GuestResult<Option<Vec<u8>>> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let (out, _) = self.place(&[0; 8])?;
        let result = imports::get_last(self, store_idx, kp, kl, out);
        let found = self.guard(result)?;
        self.read_result(found, out)
    }

    pub fn has_at(&mut self, store_idx: i32, ord: u64, key: &str) -> GuestResult<bool> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::has_at(self, store_idx, ord as i64, kp, kl);
        Ok(self.guard(result)? == 1)
    }

    pub fn has_last(&mut self, store_idx: i32, key: &str) -> GuestResult<bool> {
        let (kp, kl) = self.place(key.as_bytes())?;
        let result = imports::has_last(self, store_idx, kp, kl);
        Ok(self.guard(result)? == 1)
    }

    pub fn extension(&mut self, namespace: &str, name: &str, input: &[u8]) -> GuestResult<Vec<u8>> {
        let (ip, il) = self.place(input)?;
        let (out, _) = self.place(&[0; 8])?;
        let result = imports::extension(self, namespace, name, ip, il, out);
        self.guard(result)?;
        Ok(self.read_result(1, out)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocations_are_aligned_and_bounded() {
        let mut heap = NativeHeap::new(64);
        let a = heap.alloc(3).unwrap();
        let b = heap.alloc(5).unwrap();
        assert_eq!(a, HEAP_BASE);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 3);
        assert!(heap.alloc(100).is_none());
        heap.reset();
        assert_eq!(heap.alloc(1), Some(HEAP_BASE));
    }

    #[test]
    fn missing_entrypoint() {
        let backend = NativeBackend::new();
        let module = backend.compile("m");
        let mut instance = backend.instantiate(&module, &HostConfig::default());
        let err = instance
            .call("map_m", &[], CallContext::new("m", Clock::default()))
            .unwrap_err();
        assert!(matches!(err.error, GuestError::MissingExport { .. }));
    }
}

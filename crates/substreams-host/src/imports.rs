//! Host imports, independent of the VM backend.
//!
//! Every function takes guest-native arguments (`i32` pointers and lengths,
//! `i64` ordinals) and a [`HostEnv`] giving access to guest memory and the
//! current [`CallContext`]. Backends only adapt calling conventions.
//!
//! Readers write their result as a fresh guest allocation and store
//! `(ptr: u32 LE, len: u32 LE)` at `out_ptr`, returning 1 when found and 0
//! otherwise.

use substreams_store::{KvStore, StoreError, StoreResult};
use tracing::debug;

use crate::context::{CallContext, PanicInfo};
use crate::error::{GuestError, GuestResult};
use crate::extensions::ExtensionCall;

/// What an import needs from the backend.
pub trait HostEnv {
    fn ctx(&mut self) -> &mut CallContext;

    /// Copy `len` bytes at `ptr` out of guest memory.
    fn read(&mut self, ptr: i32, len: i32) -> GuestResult<Vec<u8>>;

    fn write(&mut self, ptr: i32, bytes: &[u8]) -> GuestResult<()>;

    /// Allocate through the guest allocator. The host frees tracked
    /// allocations when the call ends.
    fn alloc(&mut self, len: i32) -> GuestResult<i32>;
}

fn enter<E: HostEnv + ?Sized>(env: &mut E) -> GuestResult<()> {
    let ctx = env.ctx();
    ctx.stats.host_calls += 1;
    ctx.check()
}

fn read_bytes<E: HostEnv + ?Sized>(env: &mut E, ptr: i32, len: i32) -> GuestResult<Vec<u8>> {
    if ptr < 0 || len < 0 {
        let ctx = env.ctx();
        return Err(ctx.violation(format!("negative pointer or length ({ptr}, {len})")));
    }
    let bytes = env.read(ptr, len)?;
    env.ctx().stats.bytes_read += bytes.len() as u64;
    Ok(bytes)
}

fn read_string<E: HostEnv + ?Sized>(env: &mut E, ptr: i32, len: i32, what: &str) -> GuestResult<String> {
    let bytes = read_bytes(env, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| env.ctx().violation(format!("{what} is not valid UTF-8")))
}

/// Hand `bytes` to the guest through `out_ptr`.
fn return_bytes<E: HostEnv + ?Sized>(env: &mut E, bytes: &[u8], out_ptr: i32) -> GuestResult<()> {
    let ptr = env.alloc(bytes.len() as i32)?;
    env.write(ptr, bytes)?;
    let mut pair = [0u8; 8];
    pair[..4].copy_from_slice(&(ptr as u32).to_le_bytes());
    pair[4..].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    env.write(out_ptr, &pair)?;
    env.ctx().stats.bytes_written += bytes.len() as u64;
    Ok(())
}

fn ordinal(ctx: &CallContext, ord: i64) -> GuestResult<u64> {
    u64::try_from(ord).map_err(|_| ctx.violation(format!("negative ordinal {ord}")))
}

fn store_error(module: &str, err: StoreError) -> GuestError {
    match err {
        StoreError::UnsupportedOperation { .. } => GuestError::ContractViolation {
            module: module.to_string(),
            reason: err.to_string(),
        },
        other => GuestError::Store {
            module: module.to_string(),
            source: other,
        },
    }
}

fn with_writer<E, T>(env: &mut E, f: impl FnOnce(&mut KvStore) -> StoreResult<T>) -> GuestResult<T>
where
    E: HostEnv + ?Sized,
{
    let ctx = env.ctx();
    let writer = ctx
        .writer
        .clone()
        .ok_or_else(|| ctx.violation("state write from a module without a writable store"))?;
    let mut store = writer.lock();
    f(&mut store).map_err(|e| store_error(&ctx.module, e))
}

fn with_reader<E, T>(env: &mut E, store_idx: i32, f: impl FnOnce(&KvStore) -> T) -> GuestResult<T>
where
    E: HostEnv + ?Sized,
{
    let ctx = env.ctx();
    let reader = usize::try_from(store_idx)
        .ok()
        .and_then(|i| ctx.readers.get(i))
        .cloned()
        .ok_or_else(|| ctx.violation(format!("no readable store at index {store_idx}")))?;
    let store = reader.lock();
    Ok(f(&store))
}

// ── env ────────────────────────────────────────────────────────────

pub fn output<E: HostEnv + ?Sized>(env: &mut E, ptr: i32, len: i32) -> GuestResult<()> {
    enter(env)?;
    let data = read_bytes(env, ptr, len)?;
    env.ctx().output = Some(data);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn register_panic<E: HostEnv + ?Sized>(
    env: &mut E,
    msg_ptr: i32,
    msg_len: i32,
    file_ptr: i32,
    file_len: i32,
    line: i32,
    column: i32,
) -> GuestResult<()> {
    let message = String::from_utf8_lossy(&read_bytes(env, msg_ptr, msg_len)?).into_owned();
    let file = if file_len > 0 {
        String::from_utf8_lossy(&read_bytes(env, file_ptr, file_len)?).into_owned()
    } else {
        String::new()
    };
    let ctx = env.ctx();
    debug!(module = %ctx.module, %message, %file, line, column, "guest panic registered");
    ctx.panic = Some(PanicInfo {
        message,
        file,
        line: line.max(0) as u32,
        column: column.max(0) as u32,
    });
    Ok(())
}

// ── logger ─────────────────────────────────────────────────────────

pub fn println<E: HostEnv + ?Sized>(env: &mut E, ptr: i32, len: i32) -> GuestResult<()> {
    enter(env)?;
    let line = String::from_utf8_lossy(&read_bytes(env, ptr, len)?).into_owned();
    let ctx = env.ctx();
    debug!(module = %ctx.module, block = ctx.clock.number, "{line}");
    ctx.logs.push(line);
    Ok(())
}

// ── state: writers ─────────────────────────────────────────────────

macro_rules! bytes_writer {
    ($(#[$doc:meta])* $name:ident, $op:ident) => {
        $(#[$doc])*
        pub fn $name<E: HostEnv + ?Sized>(
            env: &mut E,
            ord: i64,
            key_ptr: i32,
            key_len: i32,
            val_ptr: i32,
            val_len: i32,
        ) -> GuestResult<()> {
            enter(env)?;
            let ord = ordinal(env.ctx(), ord)?;
            let key = read_string(env, key_ptr, key_len, "key")?;
            let value = read_bytes(env, val_ptr, val_len)?;
            with_writer(env, |s| s.$op(ord, &key, &value))
        }
    };
}

macro_rules! scalar_writer {
    ($name:ident, $op:ident, $ty:ty) => {
        pub fn $name<E: HostEnv + ?Sized>(
            env: &mut E,
            ord: i64,
            key_ptr: i32,
            key_len: i32,
            value: $ty,
        ) -> GuestResult<()> {
            enter(env)?;
            let ord = ordinal(env.ctx(), ord)?;
            let key = read_string(env, key_ptr, key_len, "key")?;
            with_writer(env, |s| s.$op(ord, &key, value))
        }
    };
}

bytes_writer!(set, set);
bytes_writer!(set_if_not_exists, set_if_not_exists);
bytes_writer!(
    /// Bytes are appended to the current value.
    append,
    append
);
bytes_writer!(add_bigint, add_bigint);
bytes_writer!(add_bigdecimal, add_bigdecimal);
bytes_writer!(set_min_bigint, set_min_bigint);
bytes_writer!(set_min_bigdecimal, set_min_bigdecimal);
bytes_writer!(set_max_bigint, set_max_bigint);
bytes_writer!(set_max_bigdecimal, set_max_bigdecimal);

scalar_writer!(add_int64, add_int64, i64);
scalar_writer!(add_float64, add_float64, f64);
scalar_writer!(set_min_int64, set_min_int64, i64);
scalar_writer!(set_min_float64, set_min_float64, f64);
scalar_writer!(set_max_int64, set_max_int64, i64);
scalar_writer!(set_max_float64, set_max_float64, f64);

pub fn delete_prefix<E: HostEnv + ?Sized>(
    env: &mut E,
    ord: i64,
    prefix_ptr: i32,
    prefix_len: i32,
) -> GuestResult<()> {
    enter(env)?;
    let ord = ordinal(env.ctx(), ord)?;
    let prefix = read_string(env, prefix_ptr, prefix_len, "prefix")?;
    with_writer(env, |s| s.delete_prefix(ord, &prefix))
}

// ── state: readers ─────────────────────────────────────────────────
//
// Readers of another module's store see it as of the end of the previous
// block through `get_first`/`get_last`; `get_at` exposes the writes of the
// current block up to an ordinal.

pub fn get_at<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    ord: i64,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let ord = ordinal(env.ctx(), ord)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    let value = with_reader(env, store_idx, |s| s.get_at(ord, &key).map(<[u8]>::to_vec))?;
    found(env, value, out_ptr)
}

pub fn get_first<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    let value = with_reader(env, store_idx, |s| s.get_first(&key).map(<[u8]>::to_vec))?;
    found(env, value, out_ptr)
}

pub fn get_last<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    // The producing module has already run for this block; its pre-block
    // value is the one the reader is entitled to.
    let value = with_reader(env, store_idx, |s| s.get_first(&key).map(<[u8]>::to_vec))?;
    found(env, value, out_ptr)
}

pub fn has_at<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    ord: i64,
    key_ptr: i32,
    key_len: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let ord = ordinal(env.ctx(), ord)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    with_reader(env, store_idx, |s| s.has_at(ord, &key) as i32)
}

pub fn has_first<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    key_ptr: i32,
    key_len: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    with_reader(env, store_idx, |s| s.has_first(&key) as i32)
}

pub fn has_last<E: HostEnv + ?Sized>(
    env: &mut E,
    store_idx: i32,
    key_ptr: i32,
    key_len: i32,
) -> GuestResult<i32> {
    enter(env)?;
    let key = read_string(env, key_ptr, key_len, "key")?;
    with_reader(env, store_idx, |s| s.has_first(&key) as i32)
}

fn found<E: HostEnv + ?Sized>(env: &mut E, value: Option<Vec<u8>>, out_ptr: i32) -> GuestResult<i32> {
    match value {
        Some(bytes) => {
            return_bytes(env, &bytes, out_ptr)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

// ── extensions ─────────────────────────────────────────────────────

pub fn extension<E: HostEnv + ?Sized>(
    env: &mut E,
    namespace: &str,
    name: &str,
    ptr: i32,
    len: i32,
    out_ptr: i32,
) -> GuestResult<()> {
    enter(env)?;
    let input = read_bytes(env, ptr, len)?;
    let ctx = env.ctx();
    let handler = ctx.extensions.get(namespace, name).cloned().ok_or_else(|| {
        ctx.violation(format!("extension {namespace}::{name} is not registered"))
    })?;
    let call = ExtensionCall {
        module: &ctx.module,
        clock: &ctx.clock,
    };
    let result = handler(&call, &input).map_err(|reason| GuestError::Extension {
        module: ctx.module.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason,
    })?;
    return_bytes(env, &result, out_ptr)
}

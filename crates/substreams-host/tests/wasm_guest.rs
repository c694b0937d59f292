//! Wasm guests written in WAT, run through the wasmtime backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use substreams_core::{Clock, UpdatePolicy, ValueType};
use substreams_host::{
    CallArg, CallContext, CancelToken, ExtensionRegistry, GuestError, HostConfig, Instance,
    Runtime, SharedKvStore,
};
use substreams_store::{KvStore, StoreConfig};

const GUEST: &str = r#"
(module
  (import "env" "output" (func $output (param i32 i32)))
  (import "env" "register_panic" (func $panic (param i32 i32 i32 i32 i32 i32)))
  (import "logger" "println" (func $println (param i32 i32)))
  (import "state" "add_int64" (func $add (param i64 i32 i32 i64)))
  (import "state" "get_last" (func $get_last (param i32 i32 i32 i32) (result i32)))
  (import "state" "get_at" (func $get_at (param i32 i64 i32 i32 i32) (result i32)))
  (import "ext" "upper" (func $upper (param i32 i32 i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (data (i32.const 0) "count")
  (data (i32.const 16) "boom")
  (data (i32.const 32) "m.rs")
  (data (i32.const 48) "hello")
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))
  (func (export "dealloc") (param i32 i32))
  (func (export "map_echo") (param $ptr i32) (param $len i32)
    (call $output (local.get $ptr) (local.get $len)))
  (func (export "map_panic") (param i32 i32)
    (call $panic (i32.const 16) (i32.const 4) (i32.const 32) (i32.const 4) (i32.const 42) (i32.const 3)))
  (func (export "map_spin") (param i32 i32)
    (loop $l (br $l)))
  (func (export "map_log") (param i32 i32)
    (call $println (i32.const 48) (i32.const 5)))
  (func (export "store_count") (param i32 i32) (param $store i32)
    (call $add (i64.const 1) (i32.const 0) (i32.const 5) (i64.const 1)))
  (func (export "map_read") (param i32 i32) (param $store i32)
    (if (call $get_last (local.get $store) (i32.const 0) (i32.const 5) (i32.const 64))
      (then (call $output (i32.load (i32.const 64)) (i32.load (i32.const 68))))))
  (func (export "map_read_at") (param i32 i32) (param $store i32)
    (if (call $get_at (local.get $store) (i64.const 10) (i32.const 0) (i32.const 5) (i32.const 64))
      (then (call $output (i32.load (i32.const 64)) (i32.load (i32.const 68))))))
  (func (export "map_ext") (param $ptr i32) (param $len i32)
    (call $upper (local.get $ptr) (local.get $len) (i32.const 64))
    (call $output (i32.load (i32.const 64)) (i32.load (i32.const 68))))
)
"#;

fn extensions() -> ExtensionRegistry {
    ExtensionRegistry::new().with("ext", "upper", |_, input| Ok(input.to_ascii_uppercase()))
}

fn runtime(config: HostConfig) -> Runtime {
    Runtime::new(config.with_backend("wasmtime"), extensions()).unwrap()
}

fn instance(runtime: &Runtime) -> Instance {
    let bytes = wat::parse_str(GUEST).unwrap();
    let module = runtime.load_module(0, "m", &bytes).unwrap();
    runtime.acquire("m", &module).unwrap()
}

fn clock(number: u64) -> Clock {
    Clock {
        id: format!("{number:x}"),
        number,
        timestamp_ns: 0,
    }
}

fn counter_store() -> SharedKvStore {
    let config = StoreConfig::new("m", "00", 0, UpdatePolicy::Add, ValueType::Int64);
    Arc::new(Mutex::new(KvStore::new_full(config)))
}

fn block_arg() -> CallArg {
    CallArg::Bytes(b"block".to_vec())
}

#[test]
fn output_is_captured() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let outcome = instance
        .call("map_echo", &[CallArg::Bytes(b"payload".to_vec())], runtime.context("m", clock(1)))
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some(&b"payload"[..]));
    assert!(outcome.stats.host_calls >= 1);
}

#[test]
fn registered_panic_fails_the_call() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let err = instance
        .call("map_panic", &[block_arg()], runtime.context("m", clock(1)))
        .unwrap_err();
    match err.error {
        GuestError::Panic {
            module,
            message,
            file,
            line,
            column,
        } => {
            assert_eq!(module, "m");
            assert_eq!(message, "boom");
            assert_eq!(file, "m.rs");
            assert_eq!((line, column), (42, 3));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn fuel_exhaustion() {
    let runtime = runtime(HostConfig::default().with_fuel(Some(10_000)));
    let mut instance = instance(&runtime);
    let err = instance
        .call("map_spin", &[block_arg()], runtime.context("m", clock(1)))
        .unwrap_err();
    assert!(matches!(err.error, GuestError::OutOfFuel { .. }), "{:?}", err.error);
}

#[test]
fn wall_clock_deadline() {
    let runtime = runtime(HostConfig::default().with_timeout(Duration::from_millis(50)));
    let mut instance = instance(&runtime);
    let err = instance
        .call("map_spin", &[block_arg()], runtime.context("m", clock(1)))
        .unwrap_err();
    assert!(matches!(err.error, GuestError::Timeout { .. }), "{:?}", err.error);
}

#[test]
fn logs_are_returned() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let outcome = instance
        .call("map_log", &[block_arg()], runtime.context("m", clock(1)))
        .unwrap();
    assert_eq!(outcome.logs, vec!["hello"]);
    assert!(!outcome.logs_truncated);
}

#[test]
fn store_module_writes_its_own_store() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let store = counter_store();

    for block in 1..=3 {
        let ctx = runtime.context("m", clock(block)).with_writer(store.clone());
        instance
            .call("store_count", &[block_arg(), CallArg::StoreIndex(0)], ctx)
            .unwrap();
        store.lock().reset();
    }
    assert_eq!(store.lock().get_last("count"), Some(&b"3"[..]));
}

#[test]
fn write_without_store_is_a_contract_violation() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let err = instance
        .call("store_count", &[block_arg(), CallArg::StoreIndex(0)], runtime.context("m", clock(1)))
        .unwrap_err();
    assert!(matches!(err.error, GuestError::ContractViolation { .. }), "{:?}", err.error);
}

#[test]
fn foreign_store_reads_see_previous_block() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let store = counter_store();
    {
        let mut s = store.lock();
        s.add_int64(1, "count", 7).unwrap();
        s.reset();
        // Written by the producing module during the current block.
        s.add_int64(5, "count", 2).unwrap();
    }

    let ctx = runtime.context("r", clock(2)).with_readers(vec![store.clone()]);
    let outcome = instance
        .call("map_read", &[block_arg(), CallArg::StoreIndex(0)], ctx)
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some(&b"7"[..]));

    let ctx = runtime.context("r", clock(2)).with_readers(vec![store.clone()]);
    let outcome = instance
        .call("map_read_at", &[block_arg(), CallArg::StoreIndex(0)], ctx)
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some(&b"9"[..]));
}

#[test]
fn reading_a_missing_store_index_fails() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let err = instance
        .call("map_read", &[block_arg(), CallArg::StoreIndex(3)], runtime.context("r", clock(1)))
        .unwrap_err();
    assert!(matches!(err.error, GuestError::ContractViolation { .. }));
}

#[test]
fn extension_results_reach_the_guest() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let outcome = instance
        .call("map_ext", &[CallArg::Bytes(b"abc".to_vec())], runtime.context("m", clock(1)))
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some(&b"ABC"[..]));
}

#[test]
fn cancellation_is_observed_at_host_calls() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    let (handle, token) = CancelToken::new();
    handle.cancel();
    let ctx = runtime
        .context("m", clock(1))
        .with_writer(counter_store())
        .with_cancel(token);
    let err = instance
        .call("store_count", &[block_arg(), CallArg::StoreIndex(0)], ctx)
        .unwrap_err();
    assert!(matches!(err.error, GuestError::Canceled));
}

#[test]
fn wasi_imports_are_rejected() {
    let runtime = runtime(HostConfig::default());
    let bytes = wat::parse_str(
        r#"(module
             (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
             (memory (export "memory") 1))"#,
    )
    .unwrap();
    let module = runtime.load_module(1, "w", &bytes).unwrap();
    assert!(matches!(
        runtime.acquire("w", &module),
        Err(GuestError::Instantiate { .. })
    ));
}

#[test]
fn instance_survives_many_calls() {
    let runtime = runtime(HostConfig::default());
    let mut instance = instance(&runtime);
    for n in 0..100 {
        let outcome = instance
            .call("map_echo", &[CallArg::Bytes(vec![n as u8; 16])], runtime.context("m", clock(n)))
            .unwrap();
        assert_eq!(outcome.output.unwrap(), vec![n as u8; 16]);
    }
}

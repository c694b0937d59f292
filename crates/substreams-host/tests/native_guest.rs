//! Native guests share the wasm host contract.

use std::sync::Arc;

use parking_lot::Mutex;
use substreams_core::{Clock, UpdatePolicy, ValueType};
use substreams_host::{
    Backend, CallArg, ExtensionRegistry, GuestError, HostConfig, NativeBackend, Runtime,
};
use substreams_store::{KvStore, StoreConfig};

fn runtime(backend: NativeBackend) -> Runtime {
    Runtime::with_backend(Backend::Native(backend), HostConfig::default(), ExtensionRegistry::new())
}

#[test]
fn native_store_module() {
    let backend = NativeBackend::new().with_export("store_sum", |host, args| {
        let input = host.input(args[0], args[1])?;
        let amount: i64 = std::str::from_utf8(&input).unwrap_or("0").parse().unwrap_or(0);
        host.add_int64(1, "sum", amount)?;
        host.println(&format!("added {amount}"))
    });
    let runtime = runtime(backend);
    let module = runtime.load_module(0, "sum", b"").unwrap();
    let mut instance = runtime.acquire("sum", &module).unwrap();

    let config = StoreConfig::new("sum", "00", 0, UpdatePolicy::Add, ValueType::Int64);
    let store = Arc::new(Mutex::new(KvStore::new_full(config)));
    for amount in ["5", "7"] {
        let ctx = runtime.context("sum", Clock::default()).with_writer(store.clone());
        let outcome = instance
            .call("store_sum", &[CallArg::Bytes(amount.as_bytes().to_vec()), CallArg::StoreIndex(0)], ctx)
            .unwrap();
        assert_eq!(outcome.logs, vec![format!("added {amount}")]);
        store.lock().reset();
    }
    assert_eq!(store.lock().get_last("sum"), Some(&b"12"[..]));
}

#[test]
fn policy_mismatch_is_a_contract_violation() {
    let backend = NativeBackend::new().with_export("store_bad", |host, _| {
        host.set(1, "k", b"v")
    });
    let runtime = runtime(backend);
    let module = runtime.load_module(0, "bad", b"").unwrap();
    let mut instance = runtime.acquire("bad", &module).unwrap();

    let config = StoreConfig::new("bad", "00", 0, UpdatePolicy::Add, ValueType::Int64);
    let store = Arc::new(Mutex::new(KvStore::new_full(config)));
    let ctx = runtime.context("bad", Clock::default()).with_writer(store);
    let err = instance.call("store_bad", &[], ctx).unwrap_err();
    assert!(matches!(err.error, GuestError::ContractViolation { .. }), "{:?}", err.error);
}

#[test]
fn native_panic_and_output() {
    let backend = NativeBackend::new()
        .with_export("map_ok", |host, args| {
            let input = host.input(args[0], args[1])?;
            host.output(&input)
        })
        .with_export("map_boom", |host, _| host.register_panic("boom", "m.rs", 42, 3));
    let runtime = runtime(backend);
    let module = runtime.load_module(0, "m", b"").unwrap();
    let mut instance = runtime.acquire("m", &module).unwrap();

    let outcome = instance
        .call("map_ok", &[CallArg::Bytes(b"x".to_vec())], runtime.context("m", Clock::default()))
        .unwrap();
    assert_eq!(outcome.output, Some(b"x".to_vec()));

    let err = instance
        .call("map_boom", &[], runtime.context("m", Clock::default()))
        .unwrap_err();
    assert!(matches!(err.error, GuestError::Panic { line: 42, column: 3, .. }));
}

#[test]
fn failed_call_reports_the_latest_logs() {
    let backend = NativeBackend::new().with_export("map_chatty", |host, _| {
        for i in 0..100 {
            host.println(&format!("line-{i:03}"))?;
        }
        host.register_panic("gave up", "m.rs", 7, 1)
    });
    let config = HostConfig::default().with_log_limit(32);
    let runtime = Runtime::with_backend(Backend::Native(backend), config, ExtensionRegistry::new());
    let module = runtime.load_module(0, "m", b"").unwrap();
    let mut instance = runtime.acquire("m", &module).unwrap();

    let err = instance
        .call("map_chatty", &[], runtime.context("m", Clock::default()))
        .unwrap_err();
    assert!(err.logs_truncated);
    assert_eq!(err.logs, vec!["line-096", "line-097", "line-098", "line-099"]);
}

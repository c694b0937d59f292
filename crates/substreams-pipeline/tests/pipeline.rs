//! Pipeline behavior over native guests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use substreams_core::{
    Block, BlockEvent, BlockRef, BlockSource, BlockSourceFactory, InputSpec, MemoryBlockSource, ModuleDef,
    ModuleKind, Step, StoreMode, UpdatePolicy, ValueType,
};
use substreams_host::{Backend, CancelToken, ExtensionRegistry, GuestError, HostConfig, NativeBackend, Runtime};
use substreams_pipeline::response::channel;
use substreams_pipeline::{
    Pipeline, PipelineContext, PipelineError, PipelineOptions, RequestModules, Response, ResponseRx,
    StopReason, Tier,
};
use substreams_storage::{SharedStore, memory_store};
use substreams_store::{KvStore, StoreConfig, StoreLimits, load_full_at};

// ── Fixtures ───────────────────────────────────────────────────────

fn block(number: u64, id: &str, payload: &str) -> Block {
    Block {
        number,
        id: id.to_string(),
        parent_id: format!("p{}", number.saturating_sub(1)),
        timestamp_ns: number as i64 * 1_000,
        payload: payload.as_bytes().to_vec(),
    }
}

fn event(block: Block, step: Step, final_block: u64) -> BlockEvent {
    BlockEvent {
        block,
        step,
        final_block: BlockRef::new(final_block, format!("f{final_block}")),
    }
}

fn map(name: &str, entrypoint: &str, start: u64, inputs: Vec<InputSpec>) -> ModuleDef {
    ModuleDef {
        name: name.into(),
        kind: ModuleKind::Map {
            output_type: "proto:test.Value".into(),
        },
        initial_block: start,
        binary_index: 0,
        entrypoint: entrypoint.into(),
        inputs,
    }
}

fn store(name: &str, entrypoint: &str, start: u64, inputs: Vec<InputSpec>) -> ModuleDef {
    ModuleDef {
        name: name.into(),
        kind: ModuleKind::Store {
            policy: UpdatePolicy::Add,
            value_type: ValueType::Int64,
        },
        initial_block: start,
        binary_index: 0,
        entrypoint: entrypoint.into(),
        inputs,
    }
}

fn source() -> InputSpec {
    InputSpec::Source {
        r#type: "sf.test.Block".into(),
    }
}

/// `a` echoes the block payload, `b` sums it, `c` reads the sum.
fn guests(a_calls: Arc<AtomicUsize>) -> NativeBackend {
    NativeBackend::new()
        .with_export("map_a", move |host, args| {
            a_calls.fetch_add(1, Ordering::SeqCst);
            let payload = host.input(args[0], args[1])?;
            host.output(&payload)
        })
        .with_export("store_b", |host, args| {
            let input = host.input(args[0], args[1])?;
            let amount: i64 = std::str::from_utf8(&input).unwrap().parse().unwrap();
            host.add_int64(1, "total", amount)
        })
        .with_export("map_c", |host, args| {
            let total = host.get_last(args[0], "total")?.unwrap_or_default();
            host.println(&format!("total is {}", String::from_utf8_lossy(&total)))?;
            host.output(&total)
        })
        .with_export("map_boom", |host, _| {
            host.register_panic("boom", "m.rs", 42, 3)
        })
}

fn chain_modules() -> Vec<ModuleDef> {
    vec![
        map("a", "map_a", 10, vec![source()]),
        store("b", "store_b", 10, vec![InputSpec::Map { module: "a".into() }]),
        map(
            "c",
            "map_c",
            10,
            vec![InputSpec::Store {
                module: "b".into(),
                mode: StoreMode::Get,
            }],
        ),
        map("boom", "map_boom", 0, vec![InputSpec::Clock]),
    ]
}

struct Harness {
    modules: Arc<RequestModules>,
    runtime: Arc<Runtime>,
    objstore: SharedStore,
    a_calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new(modules: Vec<ModuleDef>) -> Self {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let backend = Backend::Native(guests(a_calls.clone()));
        Self {
            modules: Arc::new(RequestModules::new(modules, vec![Vec::new()]).unwrap()),
            runtime: Arc::new(Runtime::with_backend(backend, HostConfig::default(), ExtensionRegistry::new())),
            objstore: memory_store().unwrap(),
            a_calls,
        }
    }

    fn context(&self, save_interval: u64) -> PipelineContext {
        PipelineContext {
            modules: self.modules.clone(),
            runtime: self.runtime.clone(),
            objstore: self.objstore.clone(),
            limits: StoreLimits::default(),
            save_interval,
            reorg_window: 256,
            cancel: CancelToken::never(),
        }
    }

    fn store_config(&self, name: &str, start: u64) -> StoreConfig {
        let hash = self.modules.hash_hex(name).unwrap();
        StoreConfig::new(name, hash, start, UpdatePolicy::Add, ValueType::Int64)
    }
}

fn live(outputs: &[&str], start: u64, stop: u64) -> PipelineOptions {
    PipelineOptions {
        tier: Tier::Live {
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            emit_from: start,
        },
        start,
        stop,
    }
}

fn drain(rx: &mut ResponseRx) -> Vec<Response> {
    let mut out = Vec::new();
    while let Ok(response) = rx.try_recv() {
        out.push(response);
    }
    out
}

fn stream(events: Vec<BlockEvent>) -> Box<dyn BlockSource> {
    MemoryBlockSource::new(events).live(0).unwrap()
}

fn linear(range: std::ops::Range<u64>) -> Box<dyn BlockSource> {
    MemoryBlockSource::linear(range.map(|n| block(n, &format!("b{n}"), "1")).collect())
        .live(0)
        .unwrap()
}

// ── Tests ──────────────────────────────────────────────────────────

#[test]
fn map_store_map_chain_respects_the_fence() {
    let h = Harness::new(chain_modules());
    let (tx, mut rx) = channel();
    let pipeline = Pipeline::new(h.context(2), live(&["a", "b", "c"], 10, 14), tx).unwrap();
    let termination = pipeline.run(linear(10..20).as_mut()).unwrap();
    assert_eq!(termination.reason, StopReason::StopBlock);

    let data: Vec<_> = drain(&mut rx).into_iter().filter_map(|r| r.as_data().cloned()).collect();
    assert_eq!(data.len(), 4);
    for d in &data {
        let a = d.outputs.iter().find(|o| o.name == "a").unwrap();
        assert_eq!(a.payload, b"1");
    }

    // `c` sees the total before the current block.
    let last = &data[3];
    assert_eq!(last.clock.number, 13);
    let c = last.outputs.iter().find(|o| o.name == "c").unwrap();
    assert_eq!(c.payload, b"3");
    assert_eq!(c.logs, vec!["total is 3".to_string()]);
    let b = &last.debug_store_deltas[0];
    assert_eq!(b.name, "b");
    assert_eq!(b.deltas[0].new_value, b"4");

    let at_12 = load_full_at(h.objstore.as_ref(), &h.store_config("b", 10), 12).unwrap();
    assert_eq!(at_12.get_last("total"), Some(&b"2"[..]));
    let at_14 = load_full_at(h.objstore.as_ref(), &h.store_config("b", 10), 14).unwrap();
    assert_eq!(at_14.get_last("total"), Some(&b"4"[..]));
}

#[test]
fn guest_panic_reports_module_failure() {
    let h = Harness::new(chain_modules());
    let (tx, mut rx) = channel();
    let pipeline = Pipeline::new(h.context(100), live(&["boom"], 5, 0), tx).unwrap();
    let err = pipeline.run(linear(5..8).as_mut()).unwrap_err();
    match &err {
        PipelineError::Guest {
            module,
            source: GuestError::Panic {
                message,
                file,
                line,
                column,
                ..
            },
            ..
        } => {
            assert_eq!(module, "boom");
            assert_eq!((message.as_str(), file.as_str(), *line, *column), ("boom", "m.rs", 42, 3));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.exit_code(), 5);

    let responses = drain(&mut rx);
    assert!(responses.iter().all(|r| r.as_data().is_none()));
    match responses.last() {
        Some(Response::ModuleFailed(failure)) => assert_eq!(failure.module, "boom"),
        other => panic!("expected a failure record, got {other:?}"),
    }
}

#[test]
fn reorg_reverts_store_and_emits_undo() {
    let modules = vec![
        map("a", "map_a", 100, vec![source()]),
        store("b", "store_b", 100, vec![InputSpec::Map { module: "a".into() }]),
    ];
    let h = Harness::new(modules);
    let events = vec![
        event(block(100, "100a", "1"), Step::New, 99),
        event(block(101, "101a", "10"), Step::New, 99),
        event(block(101, "101a", "10"), Step::Undo, 99),
        event(block(101, "101b", "100"), Step::New, 99),
    ];
    let (tx, mut rx) = channel();
    let pipeline = Pipeline::new(h.context(1_000), live(&["a", "b"], 100, 0), tx).unwrap();
    let termination = pipeline.run(stream(events).as_mut()).unwrap();
    assert_eq!(termination.reason, StopReason::EndOfStream);

    let seen: Vec<String> = drain(&mut rx)
        .into_iter()
        .map(|r| match r {
            Response::BlockScopedData(d) => format!("data({})", d.clock.id),
            Response::Undo(u) => {
                assert_eq!(u.outputs[0].payload, b"10");
                assert_eq!(u.last_valid_block.number, 100);
                format!("undo({})", u.block.id)
            }
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(seen, vec!["data(100a)", "data(101a)", "undo(101a)", "data(101b)"]);
}

#[test]
fn reorg_leaves_store_as_if_fork_never_happened() {
    let modules = vec![
        map("a", "map_a", 100, vec![source()]),
        store("b", "store_b", 100, vec![InputSpec::Map { module: "a".into() }]),
    ];
    let h = Harness::new(modules);
    let events = vec![
        event(block(100, "100a", "1"), Step::New, 99),
        event(block(101, "101a", "10"), Step::New, 99),
        event(block(101, "101a", "10"), Step::Undo, 99),
        event(block(101, "101b", "100"), Step::New, 99),
        // Finality reaches the boundary at 102 once 101 is final.
        event(block(102, "102", "1000"), Step::New, 99),
        event(block(101, "101b", "100"), Step::Irreversible, 101),
    ];
    let (tx, _rx) = channel();
    let pipeline = Pipeline::new(h.context(2), live(&["b"], 100, 0), tx).unwrap();
    let termination = pipeline.run(stream(events).as_mut()).unwrap();
    assert_eq!(termination.snapshots.len(), 1);

    let at_102 = load_full_at(h.objstore.as_ref(), &h.store_config("b", 100), 102).unwrap();
    assert_eq!(at_102.get_last("total"), Some(&b"101"[..]));
}

#[test]
fn undo_below_a_pending_boundary_drops_the_snapshot() {
    let modules = vec![
        map("a", "map_a", 100, vec![source()]),
        store("b", "store_b", 100, vec![InputSpec::Map { module: "a".into() }]),
    ];
    let h = Harness::new(modules);
    let events = vec![
        event(block(100, "100", "1"), Step::New, 99),
        event(block(101, "101a", "10"), Step::New, 99),
        event(block(102, "102a", "5"), Step::New, 99),
        event(block(102, "102a", "5"), Step::Undo, 99),
        event(block(101, "101a", "10"), Step::Undo, 99),
        event(block(101, "101b", "20"), Step::New, 99),
        event(block(102, "102b", "7"), Step::New, 99),
        event(block(102, "102b", "7"), Step::Irreversible, 102),
    ];
    let (tx, _rx) = channel();
    let pipeline = Pipeline::new(h.context(2), live(&["b"], 100, 0), tx).unwrap();
    pipeline.run(stream(events).as_mut()).unwrap();

    let at_102 = load_full_at(h.objstore.as_ref(), &h.store_config("b", 100), 102).unwrap();
    assert_eq!(at_102.get_last("total"), Some(&b"21"[..]));
}

#[test]
fn stalled_finality_is_bounded_by_the_reorg_window() {
    let modules = vec![
        map("a", "map_a", 100, vec![source()]),
        store("b", "store_b", 100, vec![InputSpec::Map { module: "a".into() }]),
    ];
    let h = Harness::new(modules);
    // Finality never moves past 99.
    let events = (100..106)
        .map(|n| event(block(n, &format!("{n}"), "1"), Step::New, 99))
        .collect();
    let ctx = PipelineContext {
        reorg_window: 2,
        ..h.context(2)
    };
    let (tx, _rx) = channel();
    let pipeline = Pipeline::new(ctx, live(&["b"], 100, 0), tx).unwrap();
    let termination = pipeline.run(stream(events).as_mut()).unwrap();

    let boundaries: Vec<u64> = termination.snapshots.iter().map(|s| s.range.end).collect();
    assert_eq!(boundaries, vec![102, 104]);
    let at_104 = load_full_at(h.objstore.as_ref(), &h.store_config("b", 100), 104).unwrap();
    assert_eq!(at_104.get_last("total"), Some(&b"4"[..]));
}

#[test]
fn undo_beyond_the_reorg_window_fails() {
    let modules = vec![
        map("a", "map_a", 100, vec![source()]),
        store("b", "store_b", 100, vec![InputSpec::Map { module: "a".into() }]),
    ];
    let h = Harness::new(modules);
    let mut events: Vec<BlockEvent> = (100..104)
        .map(|n| event(block(n, &format!("{n}"), "1"), Step::New, 99))
        .collect();
    events.push(event(block(101, "101", "1"), Step::Undo, 99));
    let ctx = PipelineContext {
        reorg_window: 2,
        ..h.context(1_000)
    };
    let (tx, _rx) = channel();
    let pipeline = Pipeline::new(ctx, live(&["b"], 100, 0), tx).unwrap();
    let err = pipeline.run(stream(events).as_mut()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::UndoPastFinal {
            block: 101,
            final_block: 101
        }
    ));
    assert_eq!(err.exit_code(), 4);
}

#[test]
fn backfill_writes_full_then_partial_and_completes() {
    let h = Harness::new(chain_modules());
    let (tx, mut rx) = channel();
    let options = PipelineOptions {
        tier: Tier::Backfill {
            produce: vec!["b".into()],
        },
        start: 10,
        stop: 14,
    };
    let termination = Pipeline::new(h.context(2), options, tx)
        .unwrap()
        .run(linear(10..14).as_mut())
        .unwrap();
    assert_eq!(termination.snapshots.len(), 2);

    let responses = drain(&mut rx);
    assert_eq!(responses.len(), 1);
    assert!(matches!(&responses[0], Response::Completed { all_processed_ranges } if !all_processed_ranges.is_empty()));

    let config = h.store_config("b", 10);
    let partial = substreams_storage::paths::SnapshotFile {
        kind: substreams_storage::SnapshotKind::Partial,
        range: substreams_core::BlockRange::new(12, 14),
        path: substreams_storage::paths::snapshot_path(
            &config.module_hash,
            substreams_storage::SnapshotKind::Partial,
            substreams_core::BlockRange::new(12, 14),
        ),
    };
    let partial = KvStore::load(config.clone(), h.objstore.as_ref(), &partial).unwrap();
    assert_eq!(partial.get_last("total"), Some(&b"2"[..]));
    let full = load_full_at(h.objstore.as_ref(), &config, 12).unwrap();
    assert_eq!(full.get_last("total"), Some(&b"2"[..]));
}

#[test]
fn cached_outputs_skip_execution() {
    let h = Harness::new(chain_modules());
    let (tx, _rx) = channel();
    let options = PipelineOptions {
        tier: Tier::Backfill {
            produce: vec!["a".into()],
        },
        start: 10,
        stop: 14,
    };
    Pipeline::new(h.context(2), options, tx)
        .unwrap()
        .run(linear(10..14).as_mut())
        .unwrap();
    assert_eq!(h.a_calls.load(Ordering::SeqCst), 4);

    let (tx, mut rx) = channel();
    let termination = Pipeline::new(h.context(2), live(&["a"], 10, 14), tx)
        .unwrap()
        .run(linear(10..14).as_mut())
        .unwrap();
    assert_eq!(h.a_calls.load(Ordering::SeqCst), 4);
    assert_eq!(termination.stats["a"].cache_hits, 4);
    let data: Vec<_> = drain(&mut rx).into_iter().filter_map(|r| r.as_data().cloned()).collect();
    assert_eq!(data.len(), 4);
    assert!(data.iter().all(|d| d.outputs[0].payload == b"1"));
}

#[test]
fn blocks_before_emit_from_are_processed_silently() {
    let h = Harness::new(chain_modules());
    let (tx, mut rx) = channel();
    let options = PipelineOptions {
        tier: Tier::Live {
            outputs: vec!["c".into()],
            emit_from: 12,
        },
        start: 10,
        stop: 14,
    };
    Pipeline::new(h.context(1_000), options, tx)
        .unwrap()
        .run(linear(10..14).as_mut())
        .unwrap();
    let data: Vec<_> = drain(&mut rx).into_iter().filter_map(|r| r.as_data().cloned()).collect();
    let blocks: Vec<u64> = data.iter().map(|d| d.clock.number).collect();
    assert_eq!(blocks, vec![12, 13]);
    assert_eq!(data[0].outputs[0].payload, b"2");
}

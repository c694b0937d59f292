//! Pipeline — drives modules over a block stream.
//!
//! ```text
//! event ─► new / new_irreversible ─► open (cross boundaries, reset deltas)
//!                                      ├─► execute modules in topological order
//!                                      ├─► flush outputs and reversible deltas
//!                                      ├─► emit block data (live tier)
//!                                      └─► close (apply finality)
//!        ─► undo          ─► revert deltas, drop outputs, emit undo
//!        ─► irreversible  ─► apply finality
//! ```
//!
//! The live tier serves a requester from full stores. The backfill tier
//! produces snapshots and output segments for one range and emits nothing
//! but a final `Completed`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use substreams_core::{BlockEvent, BlockRange, BlockRef, BlockSource, Clock, ModuleKind, Step};
use substreams_execout::{ExecOutCache, OutputEntry};
use substreams_host::{CancelToken, Runtime};
use substreams_storage::SharedStore;
use substreams_store::{StoreConfig, StoreLimits};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::executor::{BlockOutputs, ModuleExecutor, ModuleStats};
use crate::fork::ReversibleDeltas;
use crate::index::IndexWriter;
use crate::modules::RequestModules;
use crate::response::{
    self, BlockScopedData, MapOutput, ModuleFailure, Response, ResponseTx, StoreDeltasOutput,
    UndoSignal,
};
use crate::stores::{BoundaryTracker, StoreRole, StoreSet, WrittenSnapshot};

/// Shared, read-only pieces of a request.
#[derive(Clone)]
pub struct PipelineContext {
    pub modules: Arc<RequestModules>,
    pub runtime: Arc<Runtime>,
    pub objstore: SharedStore,
    pub limits: StoreLimits,
    pub save_interval: u64,
    /// Reversible blocks held past the head before they are treated as
    /// final; `0` waits for the chain's finality.
    pub reorg_window: u64,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tier {
    /// Stream `outputs` to the requester, emitting from `emit_from` on.
    Live { outputs: Vec<String>, emit_from: u64 },
    /// Produce snapshots of `produce` stores and output segments of
    /// `produce` maps over `[start, stop)`.
    Backfill { produce: Vec<String> },
}

impl Tier {
    pub fn is_backfill(&self) -> bool {
        matches!(self, Tier::Backfill { .. })
    }

    fn targets(&self) -> &[String] {
        match self {
            Tier::Live { outputs, .. } => outputs,
            Tier::Backfill { produce } => produce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub tier: Tier,
    /// First block processed; stores are loaded as of this block.
    pub start: u64,
    /// Exclusive; `0` runs until the stream ends.
    pub stop: u64,
}

/// Per-block progress. Errors move any state to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Idle,
    Opened,
    Executed,
    Flushed,
    Emitted,
    Closed,
    Failed,
}

/// Called around every processed block and once at the end.
pub trait BlockHook: Send {
    fn pre_block(&mut self, _clock: &Clock) -> PipelineResult<()> {
        Ok(())
    }

    fn post_block(&mut self, _clock: &Clock) -> PipelineResult<()> {
        Ok(())
    }

    fn post_job(&mut self, _last: Option<&Clock>) -> PipelineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StopBlock,
    EndOfStream,
}

/// What a pipeline did, returned when it ends gracefully.
#[derive(Debug, Clone)]
pub struct Termination {
    pub reason: StopReason,
    pub processed: Option<BlockRange>,
    pub last_block: Option<Clock>,
    pub snapshots: Vec<WrittenSnapshot>,
    pub stats: BTreeMap<String, ModuleStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Pipeline {
    ctx: PipelineContext,
    tier: Tier,
    start: u64,
    stop: u64,
    executors: Vec<ModuleExecutor>,
    stores: StoreSet,
    execout: ExecOutCache,
    indexes: BTreeMap<String, IndexWriter>,
    reversible: ReversibleDeltas,
    boundaries: BoundaryTracker,
    outputs: BTreeSet<String>,
    emit_from: u64,
    responses: ResponseTx,
    hooks: Vec<Box<dyn BlockHook>>,
    state: BlockState,
    current_module: Option<String>,
    processed: Option<BlockRange>,
    last_final: Option<u64>,
    last_clock: Option<Clock>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext, options: PipelineOptions, responses: ResponseTx) -> PipelineResult<Self> {
        let PipelineOptions { tier, start, stop } = options;
        if stop != 0 && stop < start {
            return Err(PipelineError::InvalidRequest(format!(
                "stop block {stop} is before start block {start}"
            )));
        }
        let targets: Vec<&str> = tier.targets().iter().map(String::as_str).collect();
        ctx.modules.check_outputs(tier.targets())?;
        let graph = ctx.modules.graph();
        let defs = graph.modules_down_to(&targets)?;
        let produce: BTreeSet<&str> = targets.iter().copied().collect();

        let mut executors = Vec::with_capacity(defs.len());
        let mut stores = StoreSet::new(ctx.objstore.clone());
        let mut execout = ExecOutCache::new(ctx.objstore.clone(), ctx.save_interval);
        let mut indexes = BTreeMap::new();
        for def in defs {
            let hash = ctx.modules.hash_hex(&def.name)?;
            match &def.kind {
                ModuleKind::Store { .. } => {
                    let role = match &tier {
                        Tier::Live { .. } => StoreRole::Live,
                        Tier::Backfill { .. } if produce.contains(def.name.as_str()) => StoreRole::Produce,
                        Tier::Backfill { .. } => StoreRole::Replica,
                    };
                    let config = StoreConfig::from_module(def, &hash, ctx.limits)
                        .ok_or_else(|| PipelineError::Internal(format!("{} is not a store", def.name)))?;
                    stores.open(config, role, start)?;
                }
                ModuleKind::Map { .. } => execout.register(&def.name, &hash, def.initial_block),
                ModuleKind::Index { .. } => {
                    execout.register(&def.name, &hash, def.initial_block);
                    if tier.is_backfill() && produce.contains(def.name.as_str()) {
                        let lo = start.max(def.initial_block);
                        indexes.insert(def.name.clone(), IndexWriter::new(&def.name, &hash, lo));
                    }
                }
            }
            let binary = ctx.modules.binary(def.binary_index)?;
            executors.push(ModuleExecutor::new(def.clone(), hash, &ctx.runtime, binary)?);
        }
        execout.begin(start);

        let (outputs, emit_from) = match &tier {
            Tier::Live { outputs, emit_from } => (outputs.iter().cloned().collect(), *emit_from),
            Tier::Backfill { .. } => (BTreeSet::new(), u64::MAX),
        };
        info!(
            tier = if tier.is_backfill() { "backfill" } else { "live" },
            start,
            stop,
            modules = executors.len(),
            "pipeline initialized"
        );

        Ok(Self {
            boundaries: BoundaryTracker::new(start, ctx.save_interval),
            ctx,
            tier,
            start,
            stop,
            executors,
            stores,
            execout,
            indexes,
            reversible: ReversibleDeltas::default(),
            outputs,
            emit_from,
            responses,
            hooks: Vec::new(),
            state: BlockState::Idle,
            current_module: None,
            processed: None,
            last_final: None,
            last_clock: None,
        })
    }

    pub fn with_hook(mut self, hook: Box<dyn BlockHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    /// Process `source` until the stop block or the end of the stream.
    pub fn run(mut self, source: &mut dyn BlockSource) -> PipelineResult<Termination> {
        match self.drive(source) {
            Ok(reason) => self.finish(reason),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn drive(&mut self, source: &mut dyn BlockSource) -> PipelineResult<StopReason> {
        loop {
            if self.ctx.cancel.is_canceled() {
                return Err(PipelineError::Canceled);
            }
            let Some(event) = source.next_event()? else {
                return Ok(StopReason::EndOfStream);
            };
            if self.process(&event)? == Flow::Stop {
                return Ok(StopReason::StopBlock);
            }
        }
    }

    fn process(&mut self, event: &BlockEvent) -> PipelineResult<Flow> {
        match event.step {
            Step::New | Step::NewIrreversible => self.process_new(event),
            Step::Undo => {
                self.process_undo(event)?;
                Ok(Flow::Continue)
            }
            Step::Irreversible => {
                self.apply_final(event.block.number)?;
                Ok(Flow::Continue)
            }
        }
    }

    // ── New blocks ─────────────────────────────────────────────────

    fn process_new(&mut self, event: &BlockEvent) -> PipelineResult<Flow> {
        let number = event.block.number;
        if self.stop != 0 && number >= self.stop {
            return Ok(Flow::Stop);
        }
        if number < self.start {
            debug!(block = number, start = self.start, "block before start skipped");
            return Ok(Flow::Continue);
        }
        let reversible = event.step.is_reversible();
        let clock = event.block.clock();
        let cursor = event.cursor().encode();

        self.state = BlockState::Opened;
        for boundary in self.boundaries.cross(number) {
            self.flush_boundary(boundary, reversible)?;
        }
        self.stores.reset_all();
        for hook in &mut self.hooks {
            hook.pre_block(&clock)?;
        }

        let mut outputs = BlockOutputs::new();
        let mut emitted = Vec::new();
        for exec in &mut self.executors {
            if !exec.is_active(number) {
                continue;
            }
            self.current_module = Some(exec.name().to_string());
            if exec.def().is_store() {
                exec.run(&self.ctx.runtime, &event.block, &clock, &outputs, &self.stores, &self.ctx.cancel)?;
                continue;
            }

            let cached = self.execout.get(exec.name(), &clock)?.map(|e| e.payload.clone());
            let (payload, logs, logs_truncated) = match cached {
                Some(payload) => {
                    exec.record_cache_hit();
                    (Some(payload), Vec::new(), false)
                }
                None => {
                    let run = exec.run(&self.ctx.runtime, &event.block, &clock, &outputs, &self.stores, &self.ctx.cancel)?;
                    (run.output, run.logs, run.logs_truncated)
                }
            };

            if let Some(payload) = &payload {
                let entry = OutputEntry {
                    clock: clock.clone(),
                    cursor: cursor.clone(),
                    payload: payload.clone(),
                };
                if reversible {
                    self.execout.put_reversible(exec.name(), entry);
                } else {
                    self.execout.put(exec.name(), entry)?;
                    if let Some(index) = self.indexes.get_mut(exec.name()) {
                        index.add(number, payload)?;
                    }
                }
                outputs.insert(exec.name().to_string(), payload.clone());
            }
            if self.outputs.contains(exec.name()) {
                emitted.push(MapOutput {
                    name: exec.name().to_string(),
                    payload: payload.unwrap_or_default(),
                    logs,
                    logs_truncated,
                });
            }
        }
        self.current_module = None;
        self.state = BlockState::Executed;

        let mut debug_store_deltas = Vec::new();
        for name in self.stores.names() {
            let store = self.stores.get(name)?;
            let deltas = store.lock().deltas().to_vec();
            if self.outputs.contains(name) {
                debug_store_deltas.push(StoreDeltasOutput {
                    name: name.to_string(),
                    deltas: deltas.clone(),
                });
            }
            if reversible {
                self.reversible.record(number, name, deltas);
            }
        }
        self.state = BlockState::Flushed;

        if !self.tier.is_backfill() && number >= self.emit_from {
            let data = BlockScopedData {
                clock: clock.clone(),
                cursor,
                final_block_height: event.final_block.number,
                outputs: emitted,
                debug_store_deltas,
            };
            response::send(&self.responses, Response::BlockScopedData(data))?;
        }
        self.state = BlockState::Emitted;

        for hook in &mut self.hooks {
            hook.post_block(&clock)?;
        }
        self.processed = Some(match self.processed {
            Some(range) => BlockRange::new(range.start, number + 1),
            None => BlockRange::new(number, number + 1),
        });
        self.last_clock = Some(clock);
        self.apply_final(event.final_block.number)?;
        if reversible {
            self.bound_reversible(number)?;
        }
        self.state = BlockState::Closed;
        Ok(Flow::Continue)
    }

    fn flush_boundary(&mut self, boundary: u64, reversible: bool) -> PipelineResult<()> {
        debug!(boundary, reversible, "store boundary crossed");
        self.stores.save_boundary(boundary, reversible)?;
        for index in self.indexes.values_mut() {
            index.flush(boundary, self.ctx.objstore.as_ref())?;
        }
        Ok(())
    }

    // ── Forks and finality ─────────────────────────────────────────

    fn process_undo(&mut self, event: &BlockEvent) -> PipelineResult<()> {
        let number = event.block.number;
        if let Some(final_block) = self.last_final.filter(|f| number <= *f) {
            return Err(PipelineError::UndoPastFinal {
                block: number,
                final_block,
            });
        }
        let undone = self.execout.handle_undo(number);
        for (name, deltas) in self.reversible.undo(number) {
            self.stores.get(&name)?.lock().revert(&deltas);
        }
        if let Some(boundary) = self.stores.discard_after(number) {
            self.boundaries.rewind(boundary);
        }
        if let Some(range) = self.processed {
            self.processed = Some(BlockRange::new(range.start, range.end.min(number).max(range.start)));
        }
        info!(block = number, outputs = undone.len(), "block undone");

        if !self.tier.is_backfill() && number >= self.emit_from {
            let outputs = undone
                .into_iter()
                .filter(|(name, _)| self.outputs.contains(name))
                .map(|(name, entry)| MapOutput {
                    name,
                    payload: entry.payload,
                    logs: Vec::new(),
                    logs_truncated: false,
                })
                .collect();
            let signal = UndoSignal {
                block: event.block.block_ref(),
                last_valid_block: BlockRef::new(number.saturating_sub(1), event.block.parent_id.clone()),
                cursor: event.cursor().encode(),
                outputs,
            };
            response::send(&self.responses, Response::Undo(signal))?;
        }
        Ok(())
    }

    fn apply_final(&mut self, final_block: u64) -> PipelineResult<()> {
        if self.last_final.is_some_and(|f| f >= final_block) {
            return Ok(());
        }
        self.execout.handle_final(final_block)?;
        self.reversible.finalize(final_block);
        self.stores.commit_final(final_block)?;
        self.last_final = Some(final_block);
        Ok(())
    }

    /// Treat blocks more than `reorg_window` behind `head` as final.
    fn bound_reversible(&mut self, head: u64) -> PipelineResult<()> {
        let window = self.ctx.reorg_window;
        if window == 0 {
            return Ok(());
        }
        let Some(floor) = head.checked_sub(window) else {
            return Ok(());
        };
        if self.last_final.is_some_and(|f| f >= floor) {
            return Ok(());
        }
        warn!(head, floor, window, "finality lags the reorg window, forcing blocks final");
        self.apply_final(floor)
    }

    // ── Termination ────────────────────────────────────────────────

    fn finish(mut self, reason: StopReason) -> PipelineResult<Termination> {
        let mut stats = BTreeMap::new();
        for exec in self.executors.drain(..) {
            let name = exec.name().to_string();
            stats.insert(name, exec.close(&self.ctx.runtime));
        }
        for hook in &mut self.hooks {
            hook.post_job(self.last_clock.as_ref())?;
        }

        // A backfill range is complete at its stop even when the chain
        // skips the last block numbers.
        let bounded = self.stop != 0 && (reason == StopReason::StopBlock || self.tier.is_backfill());
        if bounded {
            let stop = self.stop;
            let reversible = self.last_final.is_none_or(|f| f + 1 < stop);
            for boundary in self.boundaries.cross(stop) {
                self.flush_boundary(boundary, reversible)?;
            }
        }
        if self.tier.is_backfill() {
            let end = if bounded {
                self.stop
            } else {
                self.processed.map_or(self.start, |r| r.end)
            };
            self.stores.save_produced(end)?;
            for index in self.indexes.values_mut() {
                index.flush(end, self.ctx.objstore.as_ref())?;
            }
            self.execout.close(Some(end))?;
        } else {
            self.execout.close(self.last_final.map(|f| f + 1))?;
        }

        let snapshots = self.stores.written().to_vec();
        if self.tier.is_backfill() {
            let mut ranges: Vec<BlockRange> = snapshots.iter().map(|s| s.range).collect();
            ranges.extend(self.processed);
            ranges.sort();
            ranges.dedup();
            response::send(
                &self.responses,
                Response::Completed {
                    all_processed_ranges: ranges,
                },
            )?;
        }
        info!(?reason, processed = ?self.processed, snapshots = snapshots.len(), "pipeline finished");
        Ok(Termination {
            reason,
            processed: self.processed,
            last_block: self.last_clock.clone(),
            snapshots,
            stats,
        })
    }

    fn fail(&mut self, err: &PipelineError) {
        self.state = BlockState::Failed;
        if err.is_canceled() {
            warn!("pipeline canceled");
            return;
        }
        let module = err
            .module()
            .map(str::to_string)
            .or_else(|| self.current_module.clone())
            .unwrap_or_default();
        error!(%module, error = %err, "pipeline failed");
        let (logs, logs_truncated) = match err {
            PipelineError::Guest {
                logs, logs_truncated, ..
            } => (logs.clone(), *logs_truncated),
            _ => (Vec::new(), false),
        };
        let failure = ModuleFailure {
            module,
            reason: err.to_string(),
            logs,
            logs_truncated,
        };
        // The receiver may already be gone; the error is returned either way.
        let _ = response::send(&self.responses, Response::ModuleFailed(failure));
    }
}

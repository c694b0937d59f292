//! ModuleExecutor — runs one module for one block.
//!
//! Arguments follow the module's declared inputs, in order. Store modules
//! get their writable store as an extra trailing argument.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prost::Message;
use substreams_core::{Block, Clock, InputSpec, ModuleDef, ModuleKind, StoreMode};
use substreams_host::{CallArg, CancelToken, Instance, Module, Runtime};
use substreams_store::delta;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::stores::StoreSet;

/// Outputs of the modules already run in the current block.
pub type BlockOutputs = HashMap<String, Vec<u8>>;

/// Counters of one module over a pipeline's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleStats {
    pub calls: u64,
    pub cache_hits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub output: Option<Vec<u8>>,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

pub struct ModuleExecutor {
    def: ModuleDef,
    hash: String,
    module: Module,
    instance: Option<Instance>,
    stats: ModuleStats,
}

impl ModuleExecutor {
    pub fn new(def: ModuleDef, hash: String, runtime: &Runtime, binary: &[u8]) -> PipelineResult<Self> {
        let module = runtime
            .load_module(def.binary_index, &def.name, binary)
            .map_err(|e| PipelineError::guest(&def.name, e))?;
        Ok(Self {
            def,
            hash,
            module,
            instance: None,
            stats: ModuleStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &ModuleDef {
        &self.def
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn stats(&self) -> ModuleStats {
        self.stats
    }

    /// Whether the module runs at `block`.
    pub fn is_active(&self, block: u64) -> bool {
        block >= self.def.initial_block
    }

    /// Count an output served from the cache instead of a call.
    pub fn record_cache_hit(&mut self) {
        self.stats.cache_hits += 1;
    }

    /// Call the module for `block`.
    pub fn run(
        &mut self,
        runtime: &Runtime,
        block: &Block,
        clock: &Clock,
        outputs: &BlockOutputs,
        stores: &StoreSet,
        cancel: &CancelToken,
    ) -> PipelineResult<Execution> {
        let mut args = Vec::with_capacity(self.def.inputs.len() + 1);
        let mut readers = Vec::new();
        for input in &self.def.inputs {
            let arg = match input {
                InputSpec::Params { value } => CallArg::Bytes(value.as_bytes().to_vec()),
                InputSpec::Source { .. } => CallArg::Bytes(block.payload.clone()),
                InputSpec::Clock => CallArg::Bytes(clock.to_pb().encode_to_vec()),
                InputSpec::Map { module } => CallArg::Bytes(outputs.get(module).cloned().unwrap_or_default()),
                InputSpec::Store {
                    module,
                    mode: StoreMode::Get,
                } => {
                    readers.push(stores.get(module)?);
                    CallArg::StoreIndex((readers.len() - 1) as u32)
                }
                InputSpec::Store {
                    module,
                    mode: StoreMode::Deltas,
                } => {
                    let store = stores.get(module)?;
                    let encoded = delta::encode(store.lock().deltas());
                    CallArg::Bytes(encoded)
                }
            };
            args.push(arg);
        }

        let writes = matches!(self.def.kind, ModuleKind::Store { .. });
        let mut ctx = runtime
            .context(&self.def.name, clock.clone())
            .with_cancel(cancel.clone());
        if writes {
            ctx = ctx.with_writer(stores.get(&self.def.name)?);
            args.push(CallArg::StoreIndex(readers.len() as u32));
        }
        ctx = ctx.with_readers(readers);

        let mut instance = match self.instance.take() {
            Some(instance) => instance,
            None => runtime
                .acquire(&self.def.name, &self.module)
                .map_err(|e| PipelineError::guest(&self.def.name, e))?,
        };

        let started = Instant::now();
        let result = instance.call(&self.def.entrypoint, &args, ctx);
        self.stats.calls += 1;
        self.stats.execution_time += started.elapsed();

        match result {
            Ok(outcome) => {
                self.instance = Some(instance);
                self.stats.bytes_read += outcome.stats.bytes_read;
                self.stats.bytes_written += outcome.stats.bytes_written;
                debug!(
                    module = %self.def.name,
                    block = clock.number,
                    output = outcome.output.as_ref().map_or(0, Vec::len),
                    "module executed"
                );
                Ok(Execution {
                    output: outcome.output,
                    logs: outcome.logs,
                    logs_truncated: outcome.logs_truncated,
                })
            }
            Err(err) => {
                // The instance may be in any state after a failed call.
                drop(instance);
                warn!(module = %self.def.name, block = clock.number, error = %err, "module call failed");
                match PipelineError::guest(&self.def.name, err.error) {
                    PipelineError::Guest { module, source, .. } => Err(PipelineError::Guest {
                        module,
                        source,
                        logs: err.logs,
                        logs_truncated: err.logs_truncated,
                    }),
                    other => Err(other),
                }
            }
        }
    }

    /// Hand the instance back to the runtime pool.
    pub fn close(mut self, runtime: &Runtime) -> ModuleStats {
        if let Some(instance) = self.instance.take() {
            runtime.release(&self.def.name, instance);
        }
        self.stats
    }
}

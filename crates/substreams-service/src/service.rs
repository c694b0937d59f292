//! Service — serves one streaming request end to end.
//!
//! ```text
//! resolve start ─► handoff H ─► Session
//!                   ├─► backfill stores (and production outputs) up to H
//!                   ├─► production: replay cached outputs [start, H)
//!                   └─► live pipeline from H, or the boundary below it
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use substreams_core::{BlockRange, BlockSourceFactory, EngineConfig};
use substreams_host::{CancelToken, ExtensionRegistry, HostConfig, Runtime};
use substreams_orchestrator::{BackfillRequest, Orchestrator, OrchestratorConfig};
use substreams_pipeline::response::{self, Response, ResponseTx};
use substreams_pipeline::{
    Mode, Pipeline, PipelineContext, PipelineError, PipelineOptions, PipelineResult, RequestModules, Tier,
    linear_handoff, live_start, resolve_start_block, validate_range,
};
use substreams_storage::{SharedStore, open_store};
use substreams_store::StoreLimits;
use tracing::{Instrument, info, info_span};

use crate::replay::replay_cached;
use crate::request::{Request, RequestSummary};

pub struct Service {
    engine: EngineConfig,
    runtime: Arc<Runtime>,
    objstore: SharedStore,
    factory: Arc<dyn BlockSourceFactory>,
}

impl Service {
    pub fn new(
        engine: EngineConfig,
        runtime: Arc<Runtime>,
        objstore: SharedStore,
        factory: Arc<dyn BlockSourceFactory>,
    ) -> Self {
        Self {
            engine,
            runtime,
            objstore,
            factory,
        }
    }

    /// Open the object store and guest runtime named by `engine`.
    pub fn from_engine(
        engine: EngineConfig,
        factory: Arc<dyn BlockSourceFactory>,
        extensions: ExtensionRegistry,
    ) -> PipelineResult<Self> {
        let url = engine
            .object_store_url
            .clone()
            .ok_or_else(|| PipelineError::InvalidRequest("no object store configured".into()))?;
        let objstore = open_store(&url)?;
        let runtime = Runtime::new(HostConfig::from_engine(&engine), extensions)
            .map_err(|e| PipelineError::Internal(format!("guest runtime: {e}")))?;
        Ok(Self::new(engine, Arc::new(runtime), objstore, factory))
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Serve `request` over `modules`, streaming to `responses`.
    pub async fn handle(
        &self,
        modules: Arc<RequestModules>,
        request: Request,
        responses: ResponseTx,
        cancel: CancelToken,
    ) -> PipelineResult<RequestSummary> {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let trace_id = request.trace_id(nonce);
        let span = info_span!("request", %trace_id);
        self.serve(modules, request, responses, cancel, trace_id)
            .instrument(span)
            .await
    }

    async fn serve(
        &self,
        modules: Arc<RequestModules>,
        request: Request,
        responses: ResponseTx,
        cancel: CancelToken,
        trace_id: String,
    ) -> PipelineResult<RequestSummary> {
        modules.check_outputs(&request.outputs)?;
        let start = resolve_start_block(request.start_block, request.cursor.as_deref())?;
        let stop = request.stop_block;
        validate_range(start, stop)?;
        let mode = request.mode();
        let recent_final = self.factory.recent_final_block();
        let handoff = linear_handoff(mode, start, stop, recent_final)?;
        info!(
            start,
            stop,
            handoff,
            ?mode,
            recent_final = ?recent_final,
            outputs = ?request.outputs,
            "request resolved"
        );
        response::send(
            &responses,
            Response::Session {
                trace_id: trace_id.clone(),
                resolved_start_block: start,
                linear_handoff_block: handoff,
                max_parallel_workers: self.engine.max_workers,
            },
        )?;

        let limits = StoreLimits::from_engine(&self.engine);
        let ctx = PipelineContext {
            modules: modules.clone(),
            runtime: self.runtime.clone(),
            objstore: self.objstore.clone(),
            limits,
            save_interval: self.engine.save_interval,
            reorg_window: self.engine.reorg_window,
            cancel,
        };

        let orchestrator = Orchestrator::new(
            ctx.clone(),
            self.factory.clone(),
            OrchestratorConfig {
                max_workers: self.engine.max_workers,
                split_size: self.engine.split_size(),
                progress_interval: self.engine.progress_interval(),
                limits,
            },
            responses.clone(),
        );
        let backfill = orchestrator
            .run(BackfillRequest {
                outputs: request.outputs.clone(),
                start,
                handoff,
                mode,
            })
            .await?;
        info!(jobs = backfill.jobs, handoff, "linear handoff reached");

        let mut replayed = 0;
        if mode == Mode::Production {
            let objstore = self.objstore.clone();
            let replay_modules = modules.clone();
            let outputs = request.outputs.clone();
            let interval = self.engine.save_interval;
            let tx = responses.clone();
            replayed = tokio::task::spawn_blocking(move || {
                replay_cached(
                    &replay_modules,
                    objstore,
                    interval,
                    &outputs,
                    BlockRange::new(start, handoff),
                    &tx,
                )
            })
            .await
            .map_err(|e| PipelineError::Internal(format!("replay task: {e}")))??;
        }

        if stop != 0 && handoff >= stop {
            info!(stop, "stop block reached during backfill");
            return Ok(RequestSummary {
                trace_id,
                resolved_start: start,
                handoff,
                backfill,
                replayed,
                live: None,
            });
        }

        let has_stores = !modules
            .graph()
            .stores_down_to(&request.outputs.iter().map(String::as_str).collect::<Vec<_>>())?
            .is_empty();
        let live_from = live_start(handoff, self.engine.save_interval, has_stores);
        let emit_from = match mode {
            Mode::Production => handoff.max(start),
            Mode::Development => start,
        };
        let options = PipelineOptions {
            tier: Tier::Live {
                outputs: request.outputs.clone(),
                emit_from,
            },
            start: live_from,
            stop,
        };
        info!(live_from, emit_from, "live processing started");
        let factory = self.factory.clone();
        let termination = tokio::task::spawn_blocking(move || {
            let pipeline = Pipeline::new(ctx, options, responses)?;
            let mut source = factory.live(live_from)?;
            pipeline.run(source.as_mut())
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("live task: {e}")))??;

        Ok(RequestSummary {
            trace_id,
            resolved_start: start,
            handoff,
            backfill,
            replayed,
            live: Some(termination),
        })
    }
}

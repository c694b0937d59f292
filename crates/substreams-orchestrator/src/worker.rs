//! Worker: one backfill pipeline over one job's range.

use std::sync::Arc;

use substreams_core::BlockSourceFactory;
use substreams_pipeline::response::channel;
use substreams_pipeline::{
    Pipeline, PipelineContext, PipelineOptions, PipelineResult, Response, ResponseTx, Termination, Tier,
};
use tracing::{debug, info};

use crate::plan::Job;
use crate::progress::ProgressHook;

/// Run `job` to completion on the calling thread.
///
/// Failures of the worker's pipeline are forwarded to `client` so the
/// requester sees which module failed; everything else stays internal.
pub fn run_job(
    ctx: PipelineContext,
    factory: Arc<dyn BlockSourceFactory>,
    job: &Job,
    hook: ProgressHook,
    client: &ResponseTx,
) -> PipelineResult<Termination> {
    info!(job = job.id, stage = job.stage, range = %job.range, modules = ?job.modules, "job started");
    let (tx, mut rx) = channel();
    let options = PipelineOptions {
        tier: Tier::Backfill {
            produce: job.modules.clone(),
        },
        start: job.range.start,
        stop: job.range.end,
    };
    let result = Pipeline::new(ctx, options, tx).and_then(|pipeline| {
        let mut source = factory.final_range(job.range)?;
        pipeline.with_hook(Box::new(hook)).run(source.as_mut())
    });

    while let Ok(response) = rx.try_recv() {
        match response {
            Response::ModuleFailed(failure) => {
                let _ = client.send(Response::ModuleFailed(failure));
            }
            Response::Completed { all_processed_ranges } => {
                debug!(job = job.id, ranges = ?all_processed_ranges, "job completed");
            }
            _ => {}
        }
    }
    if let Ok(termination) = &result {
        info!(
            job = job.id,
            range = %job.range,
            snapshots = termination.snapshots.len(),
            "job finished"
        );
    }
    result
}

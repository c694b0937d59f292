//! Orchestrator — the control loop of a backfill.
//!
//! The loop:
//! - Builds the work plan from storage state
//! - Dispatches ready jobs to blocking workers, up to `max_workers`
//! - Feeds written snapshots to the squasher task
//! - Emits progress on a timer
//! - Returns once every store is full through the handoff

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use substreams_core::{BlockRange, BlockSourceFactory};
use substreams_host::{CancelHandle, CancelToken};
use substreams_pipeline::{Mode, PipelineContext, PipelineResult, ResponseTx, Termination, response};
use substreams_storage::SnapshotKind;
use substreams_store::{StoreLimits, StoreSquasher};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::{Job, PlanRequest, WorkPlan};
use crate::progress::ProgressTracker;
use crate::squasher::{self, SquashInput};
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub split_size: u64,
    pub progress_interval: Duration,
    pub limits: StoreLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            split_size: 1_000,
            progress_interval: Duration::from_millis(200),
            limits: StoreLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub outputs: Vec<String>,
    /// Effective start of the request.
    pub start: u64,
    pub handoff: u64,
    pub mode: Mode,
}

/// What a finished backfill left on storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub jobs: usize,
    pub handoff: u64,
    /// store → end of its full snapshot
    pub full_until: BTreeMap<String, u64>,
}

pub(crate) enum Event {
    JobDone {
        job: Job,
        result: PipelineResult<Termination>,
    },
    Squashed {
        store: String,
        full_until: u64,
    },
    SquashFailed(OrchestratorError),
}

/// Cancels the workers when the control loop exits early.
struct AbortOnDrop(CancelHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct Orchestrator {
    ctx: PipelineContext,
    factory: Arc<dyn BlockSourceFactory>,
    config: OrchestratorConfig,
    responses: ResponseTx,
}

impl Orchestrator {
    pub fn new(
        ctx: PipelineContext,
        factory: Arc<dyn BlockSourceFactory>,
        config: OrchestratorConfig,
        responses: ResponseTx,
    ) -> Self {
        Self {
            ctx,
            factory,
            config,
            responses,
        }
    }

    /// Backfill every store of `request` up to its handoff and, in
    /// production mode, the outputs of its map modules.
    pub async fn run(&self, request: BackfillRequest) -> OrchestratorResult<BackfillReport> {
        let plan = WorkPlan::build(
            &self.ctx.modules,
            self.ctx.objstore.as_ref(),
            &PlanRequest {
                outputs: request.outputs.clone(),
                start: request.start,
                handoff: request.handoff,
                mode: request.mode,
                save_interval: self.ctx.save_interval,
                split_size: self.config.split_size,
                limits: self.config.limits,
            },
        )?;
        let mut full_until = plan.full_until();
        let tracker = Arc::new(ProgressTracker::new());
        for (name, store) in &plan.state.stores {
            tracker.seed(name, BlockRange::new(store.config.module_start, store.full_until));
        }
        if plan.jobs.is_empty() && plan.reused.is_empty() {
            info!(handoff = plan.handoff, "storage already covers the handoff");
            return Ok(BackfillReport {
                jobs: 0,
                handoff: plan.handoff,
                full_until,
            });
        }

        let (abort, token) = CancelToken::new();
        let _abort = AbortOnDrop(abort);
        let worker_ctx = PipelineContext {
            cancel: token,
            ..self.ctx.clone()
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let squashers = plan
            .state
            .stores
            .iter()
            .map(|(name, s)| {
                let squasher = StoreSquasher::new(s.config.clone(), self.ctx.objstore.clone(), s.full_until);
                (name.clone(), squasher)
            })
            .collect();
        let squash_tx = squasher::spawn(squashers, events_tx.clone());
        let mut squashing = 0usize;
        for (store, range) in &plan.reused {
            debug!(%store, %range, "reusing partial from storage");
            send_squash(&squash_tx, store, SnapshotKind::Partial, *range)?;
            squashing += 1;
        }

        let total = plan.jobs.len();
        let mut pending: VecDeque<Job> = plan.jobs.into_iter().collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut running = 0usize;
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        let mut request_cancel = self.ctx.cancel.clone();
        info!(
            jobs = total,
            workers = self.config.max_workers,
            handoff = plan.handoff,
            "backfill started"
        );

        loop {
            // Dispatch in plan order; a job is ready once the stores it
            // reads are full through its first block.
            while let Some(pos) = pending.iter().position(|job| is_ready(job, &full_until)) {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(job) = pending.remove(pos) else {
                    break;
                };
                debug!(job = job.id, stage = job.stage, range = %job.range, "job dispatched");
                let ctx = worker_ctx.clone();
                let factory = self.factory.clone();
                let hook = tracker.hook(&job);
                let client = self.responses.clone();
                let events = events_tx.clone();
                tokio::spawn(async move {
                    let worker_job = job.clone();
                    let task = tokio::task::spawn_blocking(move || {
                        worker::run_job(ctx, factory, &worker_job, hook, &client)
                    });
                    let result = match task.await {
                        Ok(result) => result,
                        Err(err) => Err(substreams_pipeline::PipelineError::Internal(format!(
                            "worker for job {} failed: {err}",
                            job.id
                        ))),
                    };
                    drop(permit);
                    let _ = events.send(Event::JobDone { job, result });
                });
                running += 1;
            }

            let stores_done = plan_complete(&full_until, plan.handoff);
            if pending.is_empty() && running == 0 && squashing == 0 {
                if stores_done {
                    break;
                }
                return Err(OrchestratorError::Stalled { pending: 0 });
            }
            if running == 0 && squashing == 0 {
                error!(pending = pending.len(), "no job can become ready");
                return Err(OrchestratorError::Stalled {
                    pending: pending.len(),
                });
            }

            tokio::select! {
                biased;
                _ = request_cancel.canceled() => {
                    warn!(running, pending = pending.len(), "backfill canceled");
                    return Err(OrchestratorError::Canceled);
                }
                Some(event) = events_rx.recv() => match event {
                    Event::JobDone { job, result } => {
                        running -= 1;
                        let termination = match result {
                            Ok(termination) => termination,
                            Err(err) if err.is_canceled() => return Err(OrchestratorError::Canceled),
                            Err(err) => {
                                error!(job = job.id, range = %job.range, error = %err, "job failed");
                                return Err(err.into());
                            }
                        };
                        tracker.complete(&job, &termination.stats);
                        for snapshot in &termination.snapshots {
                            if !job.modules.contains(&snapshot.store) {
                                continue;
                            }
                            send_squash(&squash_tx, &snapshot.store, snapshot.kind, snapshot.range)?;
                            squashing += 1;
                        }
                    }
                    Event::Squashed { store, full_until: end } => {
                        squashing -= 1;
                        full_until.insert(store, end);
                    }
                    Event::SquashFailed(err) => {
                        error!(error = %err, "squash failed");
                        return Err(err);
                    }
                },
                _ = ticker.tick() => {
                    response::send(&self.responses, tracker.snapshot())?;
                }
            }
        }

        response::send(&self.responses, tracker.snapshot())?;
        info!(
            jobs = total,
            blocks = tracker.blocks(),
            handoff = plan.handoff,
            "backfill complete"
        );
        Ok(BackfillReport {
            jobs: total,
            handoff: plan.handoff,
            full_until,
        })
    }
}

fn is_ready(job: &Job, full_until: &BTreeMap<String, u64>) -> bool {
    job.requires
        .iter()
        .all(|store| full_until.get(store).is_some_and(|&end| end >= job.range.start))
}

fn plan_complete(full_until: &BTreeMap<String, u64>, handoff: u64) -> bool {
    full_until.values().all(|&end| end >= handoff)
}

fn send_squash(
    tx: &mpsc::UnboundedSender<SquashInput>,
    store: &str,
    kind: SnapshotKind,
    range: BlockRange,
) -> OrchestratorResult<()> {
    tx.send(SquashInput {
        store: store.to_string(),
        kind,
        range,
    })
    .map_err(|_| OrchestratorError::Worker("squasher is gone".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(requires: &[&str], lo: u64) -> Job {
        Job {
            id: 0,
            stage: 2,
            modules: vec!["c".into()],
            range: BlockRange::new(lo, lo + 10),
            requires: requires.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn readiness_follows_full_snapshots() {
        let mut full = BTreeMap::new();
        full.insert("b".to_string(), 10);
        assert!(is_ready(&job(&[], 50), &full));
        assert!(is_ready(&job(&["b"], 10), &full));
        assert!(!is_ready(&job(&["b"], 20), &full));
        assert!(!is_ready(&job(&["x"], 0), &full));
    }

    #[test]
    fn completion_needs_every_store_at_handoff() {
        let mut full = BTreeMap::new();
        full.insert("b".to_string(), 100);
        assert!(plan_complete(&full, 100));
        full.insert("d".to_string(), 90);
        assert!(!plan_complete(&full, 100));
        assert!(plan_complete(&BTreeMap::new(), 100));
    }
}

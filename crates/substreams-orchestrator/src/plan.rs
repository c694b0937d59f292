//! Work plan: what storage already has, and the jobs that fill the rest.
//!
//! ```text
//! stores   [start ──full── full_until)[ job ][ job ][ job ) handoff
//! outputs  [boundary ≤ start ──segments── )[ job ][ job ) handoff   (production only)
//! ```
//!
//! Jobs of the same stage and range are merged so one worker produces every
//! module of that stage for the range.

use std::collections::BTreeMap;

use substreams_core::block::boundary_at_or_below;
use substreams_core::{BlockRange, ModuleDef};
use substreams_pipeline::{Mode, RequestModules};
use substreams_storage::{ObjectStore, paths};
use substreams_store::{SnapshotListing, StoreConfig, StoreLimits};
use tracing::{debug, info};

use crate::error::OrchestratorResult;

/// Durable state of one store module.
#[derive(Debug, Clone)]
pub struct StoreState {
    pub config: StoreConfig,
    /// End of the widest full snapshot.
    pub full_until: u64,
    /// Partials on storage that the plan reuses instead of recomputing.
    pub reusable_partials: Vec<BlockRange>,
}

/// Durable output segments of one map or index module.
#[derive(Debug, Clone)]
pub struct OutputState {
    pub name: String,
    pub segments: Vec<BlockRange>,
}

impl OutputState {
    fn covers(&self, range: BlockRange) -> bool {
        self.segments
            .iter()
            .any(|s| s.start <= range.start && range.end <= s.end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageState {
    pub stores: BTreeMap<String, StoreState>,
    pub outputs: BTreeMap<String, OutputState>,
}

impl StorageState {
    pub fn fetch(
        modules: &RequestModules,
        objstore: &dyn ObjectStore,
        stores: &[&ModuleDef],
        outputs: &[&ModuleDef],
        limits: StoreLimits,
    ) -> OrchestratorResult<Self> {
        let mut state = StorageState::default();
        for def in stores {
            let hash = modules.hash_hex(&def.name)?;
            let Some(config) = StoreConfig::from_module(def, &hash, limits) else {
                continue;
            };
            let listing = SnapshotListing::fetch(objstore, &config)?;
            let full_until = listing.full_until(config.module_start);
            let reusable_partials = listing
                .live_partials(config.module_start)
                .iter()
                .map(|f| f.range)
                .collect();
            state.stores.insert(
                def.name.clone(),
                StoreState {
                    config,
                    full_until,
                    reusable_partials,
                },
            );
        }
        for def in outputs {
            let hash = modules.hash_hex(&def.name)?;
            let segments = objstore
                .list(&paths::outputs_prefix(&hash))?
                .iter()
                .filter_map(|p| paths::parse_segment_path(p))
                .collect();
            state.outputs.insert(
                def.name.clone(),
                OutputState {
                    name: def.name.clone(),
                    segments,
                },
            );
        }
        Ok(state)
    }
}

/// A range of blocks to produce for the modules of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: usize,
    pub stage: usize,
    pub modules: Vec<String>,
    pub range: BlockRange,
    /// Stores this job reads; each must be full through `range.start`.
    pub requires: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub outputs: Vec<String>,
    pub start: u64,
    pub handoff: u64,
    pub mode: Mode,
    pub save_interval: u64,
    pub split_size: u64,
    pub limits: StoreLimits,
}

#[derive(Debug, Clone)]
pub struct WorkPlan {
    pub handoff: u64,
    pub state: StorageState,
    /// Ordered by stage, then range start.
    pub jobs: Vec<Job>,
    /// Partials found on storage that stand in for a job.
    pub reused: Vec<(String, BlockRange)>,
}

impl WorkPlan {
    pub fn build(
        modules: &RequestModules,
        objstore: &dyn ObjectStore,
        request: &PlanRequest,
    ) -> OrchestratorResult<Self> {
        let graph = modules.graph();
        let targets: Vec<&str> = request.outputs.iter().map(String::as_str).collect();
        let stores = graph.stores_down_to(&targets)?;
        let outputs: Vec<&ModuleDef> = match request.mode {
            Mode::Production => targets
                .iter()
                .filter_map(|name| graph.module(name))
                .filter(|def| !def.is_store())
                .collect(),
            Mode::Development => Vec::new(),
        };
        let state = StorageState::fetch(modules, objstore, &stores, &outputs, request.limits)?;
        let split = split_size(request.split_size, request.save_interval);
        let handoff = request.handoff;

        // (stage, lo, hi) → modules
        let mut grouped: BTreeMap<(usize, u64, u64), Vec<String>> = BTreeMap::new();
        let mut reused = Vec::new();
        for (name, store) in &state.stores {
            let missing = BlockRange::new(store.full_until, handoff);
            for range in missing.split_aligned(split) {
                if store.reusable_partials.contains(&range) {
                    reused.push((name.clone(), range));
                    continue;
                }
                let stage = graph.stage_of(name)?;
                grouped
                    .entry((stage, range.start, range.end))
                    .or_default()
                    .push(name.clone());
            }
        }
        for (name, output) in &state.outputs {
            let Some(def) = graph.module(name) else {
                continue;
            };
            // Jobs load their stores from full snapshots, which only exist
            // on save boundaries.
            let first = request.start.max(def.initial_block);
            if first >= handoff {
                continue;
            }
            let lo = boundary_at_or_below(first, request.save_interval.max(1));
            let wanted = BlockRange::new(lo, handoff);
            for range in wanted.split_aligned(split) {
                let written = BlockRange::new(range.start.max(def.initial_block), range.end);
                if output.covers(written) {
                    continue;
                }
                let stage = graph.stage_of(name)?;
                grouped
                    .entry((stage, range.start, range.end))
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut jobs = Vec::with_capacity(grouped.len());
        for ((stage, lo, hi), mut names) in grouped {
            names.sort();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let requires = graph
                .stores_down_to(&refs)?
                .into_iter()
                .filter(|def| !names.contains(&def.name))
                .map(|def| def.name.clone())
                .collect();
            jobs.push(Job {
                id: jobs.len(),
                stage,
                modules: names,
                range: BlockRange::new(lo, hi),
                requires,
            });
        }

        for (name, store) in &state.stores {
            debug!(store = %name, full_until = store.full_until, reusable = store.reusable_partials.len(), "store state");
        }
        info!(
            handoff,
            split,
            jobs = jobs.len(),
            reused = reused.len(),
            "work plan built"
        );
        Ok(Self {
            handoff,
            state,
            jobs,
            reused,
        })
    }

    /// Where each store's full snapshot starts out.
    pub fn full_until(&self) -> BTreeMap<String, u64> {
        self.state
            .stores
            .iter()
            .map(|(name, s)| (name.clone(), s.full_until))
            .collect()
    }
}

/// Job size rounded to whole save intervals so every job ends on a
/// snapshot boundary, except the one ending at the handoff.
pub fn split_size(requested: u64, save_interval: u64) -> u64 {
    let interval = save_interval.max(1);
    (requested / interval).max(1) * interval
}

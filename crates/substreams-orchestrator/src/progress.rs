//! Backfill progress, counted lock-free by workers and reported on a timer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use substreams_core::{BlockRange, Clock};
use substreams_pipeline::{BlockHook, ModuleProgress, ModuleStats, PipelineResult, Response, StageProgress};

use crate::plan::Job;

/// Counters for one module across every job of a request.
#[derive(Debug, Default)]
pub struct ModuleCounters {
    pub blocks: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub execution_nanos: AtomicU64,
    completed: Mutex<Vec<BlockRange>>,
    /// job id → range processed so far
    running: Mutex<BTreeMap<usize, BlockRange>>,
}

impl ModuleCounters {
    fn ranges(&self) -> Vec<BlockRange> {
        let mut ranges = self.completed.lock().clone();
        ranges.extend(self.running.lock().values().filter(|r| !r.is_empty()));
        merge_ranges(ranges)
    }
}

pub struct ProgressTracker {
    modules: RwLock<BTreeMap<String, Arc<ModuleCounters>>>,
    stages: Mutex<BTreeMap<usize, StageProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            stages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get or create the counters of `module`.
    pub fn register(&self, module: &str) -> Arc<ModuleCounters> {
        if let Some(counters) = self.modules.read().get(module) {
            return counters.clone();
        }
        self.modules
            .write()
            .entry(module.to_string())
            .or_default()
            .clone()
    }

    /// Record a range that was already on storage before the request.
    pub fn seed(&self, module: &str, range: BlockRange) {
        if range.is_empty() {
            return;
        }
        self.register(module).completed.lock().push(range);
    }

    pub fn hook(&self, job: &Job) -> ProgressHook {
        let modules = job.modules.iter().map(|m| self.register(m)).collect();
        ProgressHook {
            job: job.id,
            start: job.range.start,
            modules,
        }
    }

    /// A job finished: its range is complete for all of its modules.
    pub fn complete(&self, job: &Job, stats: &BTreeMap<String, ModuleStats>) {
        for name in &job.modules {
            let counters = self.register(name);
            counters.running.lock().remove(&job.id);
            counters.completed.lock().push(job.range);
            if let Some(stats) = stats.get(name) {
                counters.bytes_read.fetch_add(stats.bytes_read, Ordering::Relaxed);
                counters.bytes_written.fetch_add(stats.bytes_written, Ordering::Relaxed);
                counters
                    .execution_nanos
                    .fetch_add(stats.execution_time.as_nanos() as u64, Ordering::Relaxed);
            }
        }
        let mut stages = self.stages.lock();
        let stage = stages.entry(job.stage).or_default();
        for name in &job.modules {
            if !stage.modules.contains(name) {
                stage.modules.push(name.clone());
            }
        }
        stage.completed_ranges.push(job.range);
        stage.completed_ranges = merge_ranges(std::mem::take(&mut stage.completed_ranges));
    }

    pub fn snapshot(&self) -> Response {
        let modules = self
            .modules
            .read()
            .iter()
            .map(|(name, c)| ModuleProgress {
                name: name.clone(),
                processed_ranges: c.ranges(),
                bytes_read: c.bytes_read.load(Ordering::Relaxed),
                bytes_written: c.bytes_written.load(Ordering::Relaxed),
                execution_time: Duration::from_nanos(c.execution_nanos.load(Ordering::Relaxed)),
            })
            .collect();
        let stages = self.stages.lock().values().cloned().collect();
        Response::Progress { modules, stages }
    }

    /// Total blocks processed by workers so far.
    pub fn blocks(&self) -> u64 {
        self.modules
            .read()
            .values()
            .map(|c| c.blocks.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts the blocks one worker has processed.
pub struct ProgressHook {
    job: usize,
    start: u64,
    modules: Vec<Arc<ModuleCounters>>,
}

impl BlockHook for ProgressHook {
    fn post_block(&mut self, clock: &Clock) -> PipelineResult<()> {
        let range = BlockRange::new(self.start, clock.number + 1);
        for counters in &self.modules {
            counters.blocks.fetch_add(1, Ordering::Relaxed);
            counters.running.lock().insert(self.job, range);
        }
        Ok(())
    }
}

/// Sort and coalesce overlapping or abutting ranges.
pub fn merge_ranges(mut ranges: Vec<BlockRange>) -> Vec<BlockRange> {
    ranges.sort();
    let mut out: Vec<BlockRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => out.push(range),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: usize, module: &str, lo: u64, hi: u64) -> Job {
        Job {
            id,
            stage: 1,
            modules: vec![module.to_string()],
            range: BlockRange::new(lo, hi),
            requires: Vec::new(),
        }
    }

    fn clock(number: u64) -> Clock {
        Clock {
            id: format!("b{number}"),
            number,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn ranges_coalesce() {
        let merged = merge_ranges(vec![
            BlockRange::new(20, 30),
            BlockRange::new(0, 10),
            BlockRange::new(10, 15),
        ]);
        assert_eq!(merged, vec![BlockRange::new(0, 15), BlockRange::new(20, 30)]);
    }

    #[test]
    fn running_and_completed_jobs_are_reported() {
        let tracker = ProgressTracker::new();
        let first = job(0, "b", 0, 10);
        let second = job(1, "b", 10, 20);

        let mut hook = tracker.hook(&second);
        hook.post_block(&clock(10)).unwrap();
        hook.post_block(&clock(11)).unwrap();

        let mut stats = BTreeMap::new();
        stats.insert(
            "b".to_string(),
            ModuleStats {
                bytes_written: 64,
                ..ModuleStats::default()
            },
        );
        tracker.complete(&first, &stats);

        let Response::Progress { modules, stages } = tracker.snapshot() else {
            panic!("expected progress");
        };
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].processed_ranges, vec![BlockRange::new(0, 12)]);
        assert_eq!(modules[0].bytes_written, 64);
        assert_eq!(stages[0].completed_ranges, vec![BlockRange::new(0, 10)]);
        assert_eq!(tracker.blocks(), 2);
    }
}

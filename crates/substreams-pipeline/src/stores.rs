//! Stores of one pipeline and their snapshot boundaries.
//!
//! ```text
//! role      loaded from            at a boundary
//! live      full snapshot at S     save full (held back while reversible)
//! produce   empty (full or part.)  save, then roll to a fresh partial
//! replica   full snapshot at lo    nothing; in-memory only
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use substreams_core::BlockRange;
use substreams_core::block::next_boundary;
use substreams_host::SharedKvStore;
use substreams_storage::{SharedStore, SnapshotKind};
use substreams_store::{KvStore, PendingSnapshot, StoreConfig, load_full_at};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Live,
    Produce,
    Replica,
}

struct ActiveStore {
    config: StoreConfig,
    role: StoreRole,
    store: SharedKvStore,
}

/// A snapshot this pipeline wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenSnapshot {
    pub store: String,
    pub kind: SnapshotKind,
    pub range: BlockRange,
}

pub struct StoreSet {
    objstore: SharedStore,
    stores: BTreeMap<String, ActiveStore>,
    /// Live snapshots waiting for their boundary to become final.
    pending: BTreeMap<u64, Vec<(String, PendingSnapshot)>>,
    written: Vec<WrittenSnapshot>,
}

impl StoreSet {
    pub fn new(objstore: SharedStore) -> Self {
        Self {
            objstore,
            stores: BTreeMap::new(),
            pending: BTreeMap::new(),
            written: Vec::new(),
        }
    }

    /// Add a store with state as of `block`.
    pub fn open(&mut self, config: StoreConfig, role: StoreRole, block: u64) -> PipelineResult<()> {
        let store = match role {
            StoreRole::Live | StoreRole::Replica => load_full_at(self.objstore.as_ref(), &config, block)?,
            StoreRole::Produce if block <= config.module_start => KvStore::new_full(config.clone()),
            StoreRole::Produce => KvStore::new_partial(config.clone(), block),
        };
        debug!(
            store = %config.name,
            ?role,
            block,
            kind = ?store.kind(),
            keys = store.len(),
            "store opened"
        );
        self.stores.insert(
            config.name.clone(),
            ActiveStore {
                config,
                role,
                store: Arc::new(Mutex::new(store)),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> PipelineResult<SharedKvStore> {
        self.stores
            .get(name)
            .map(|s| s.store.clone())
            .ok_or_else(|| PipelineError::Internal(format!("store {name} is not loaded")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Start a new block: clear every store's delta log.
    pub fn reset_all(&self) {
        for active in self.stores.values() {
            active.store.lock().reset();
        }
    }

    /// Snapshot every store that exists at `boundary`. Live snapshots are
    /// held in memory when `defer` is set.
    pub fn save_boundary(&mut self, boundary: u64, defer: bool) -> PipelineResult<()> {
        for active in self.stores.values() {
            let mut store = active.store.lock();
            if boundary <= store.range_start() {
                continue;
            }
            match active.role {
                StoreRole::Replica => {}
                StoreRole::Live => {
                    let snapshot = store.save(boundary);
                    if defer {
                        debug!(store = %active.config.name, boundary, "snapshot deferred until final");
                        self.pending
                            .entry(boundary)
                            .or_default()
                            .push((active.config.name.clone(), snapshot));
                    } else {
                        snapshot.write(self.objstore.as_ref())?;
                        self.written.push(written(&active.config.name, &snapshot));
                    }
                }
                StoreRole::Produce => {
                    let snapshot = store.save(boundary);
                    snapshot.write(self.objstore.as_ref())?;
                    self.written.push(written(&active.config.name, &snapshot));
                    store.roll_partial(boundary);
                }
            }
        }
        Ok(())
    }

    /// Write held-back snapshots whose boundary is now final.
    pub fn commit_final(&mut self, final_block: u64) -> PipelineResult<()> {
        let still_pending = self.pending.split_off(&(final_block + 2));
        let ready = std::mem::replace(&mut self.pending, still_pending);
        for (boundary, snapshots) in ready {
            for (store, snapshot) in snapshots {
                snapshot.write(self.objstore.as_ref())?;
                info!(%store, boundary, "deferred snapshot written");
                self.written.push(written(&store, &snapshot));
            }
        }
        Ok(())
    }

    /// Drop held-back snapshots that include block `undone`. Returns the
    /// lowest dropped boundary so it can be crossed again.
    pub fn discard_after(&mut self, undone: u64) -> Option<u64> {
        let dropped = self.pending.split_off(&(undone + 1));
        if !dropped.is_empty() {
            debug!(undone, boundaries = dropped.len(), "pending snapshots discarded");
        }
        dropped.keys().next().copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn written(&self) -> &[WrittenSnapshot] {
        &self.written
    }

    /// Close produced stores at `end`, which need not be a boundary.
    pub fn save_produced(&mut self, end: u64) -> PipelineResult<()> {
        for active in self.stores.values() {
            if active.role != StoreRole::Produce {
                continue;
            }
            let mut store = active.store.lock();
            if end <= store.range_start() {
                continue;
            }
            let snapshot = store.save(end);
            snapshot.write(self.objstore.as_ref())?;
            self.written.push(written(&active.config.name, &snapshot));
        }
        Ok(())
    }
}

fn written(store: &str, snapshot: &PendingSnapshot) -> WrittenSnapshot {
    WrittenSnapshot {
        store: store.to_string(),
        kind: snapshot.file.kind,
        range: snapshot.file.range,
    }
}

/// Next store boundary, advanced as blocks go by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTracker {
    interval: u64,
    next: u64,
}

impl BoundaryTracker {
    pub fn new(start: u64, interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            next: next_boundary(start, interval),
        }
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    /// Boundaries at or below `block` not yet crossed, in order.
    pub fn cross(&mut self, block: u64) -> Vec<u64> {
        let mut crossed = Vec::new();
        while self.next <= block {
            crossed.push(self.next);
            self.next += self.interval;
        }
        crossed
    }

    /// Move back to `boundary` after the snapshot taken there was discarded.
    pub fn rewind(&mut self, boundary: u64) {
        self.next = self.next.min(boundary);
    }
}

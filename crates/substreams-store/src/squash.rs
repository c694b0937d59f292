//! StoreSquasher — grows a store's full snapshot from completed partials.
//!
//! Partials may complete in any order; each is parked until it abuts the
//! current full end, then merged, and the widened full snapshot is written.
//! Partials stay on storage after being merged.

use std::collections::BTreeMap;

use substreams_core::BlockRange;
use substreams_storage::paths::{self, SnapshotFile};
use substreams_storage::{SharedStore, SnapshotKind};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::kv::KvStore;
use crate::state::load_full_at;

pub struct StoreSquasher {
    config: StoreConfig,
    objstore: SharedStore,
    /// Full state through `full_until`, loaded on first merge.
    full: Option<KvStore>,
    full_until: u64,
    /// Completed partials waiting for their turn, by start block.
    pending: BTreeMap<u64, u64>,
}

impl StoreSquasher {
    pub fn new(config: StoreConfig, objstore: SharedStore, full_until: u64) -> Self {
        Self {
            full_until: full_until.max(config.module_start),
            config,
            objstore,
            full: None,
            pending: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn full_until(&self) -> u64 {
        self.full_until
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Register a completed partial and merge everything that now abuts.
    /// Returns the new full end.
    pub fn add_partial(&mut self, range: BlockRange) -> StoreResult<u64> {
        if range.end <= self.full_until {
            debug!(store = %self.config.name, %range, "partial already squashed");
            return Ok(self.full_until);
        }
        self.pending.insert(range.start, range.end);

        while let Some(end) = self.pending.remove(&self.full_until) {
            let range = BlockRange::new(self.full_until, end);
            self.merge_one(range)?;
        }
        Ok(self.full_until)
    }

    /// Register a full snapshot written elsewhere, then merge whatever now
    /// abuts it. Returns the new full end.
    pub fn add_full(&mut self, end: u64) -> StoreResult<u64> {
        if end > self.full_until {
            debug!(store = %self.config.name, end, "full snapshot registered");
            self.full_until = end;
            self.full = None;
            self.pending.retain(|_, hi| *hi > end);
        }
        while let Some(end) = self.pending.remove(&self.full_until) {
            let range = BlockRange::new(self.full_until, end);
            self.merge_one(range)?;
        }
        Ok(self.full_until)
    }

    fn merge_one(&mut self, range: BlockRange) -> StoreResult<()> {
        let mut full = match self.full.take() {
            Some(full) => full,
            None => load_full_at(self.objstore.as_ref(), &self.config, self.full_until)?,
        };
        let file = SnapshotFile {
            kind: SnapshotKind::Partial,
            range,
            path: paths::snapshot_path(&self.config.module_hash, SnapshotKind::Partial, range),
        };
        let partial = KvStore::load(self.config.clone(), self.objstore.as_ref(), &file)?;
        full.merge(&partial)?;
        full.save(range.end).write(self.objstore.as_ref())?;
        info!(
            store = %self.config.name,
            full_until = range.end,
            keys = full.len(),
            "store squashed"
        );
        self.full_until = range.end;
        self.full = Some(full);
        Ok(())
    }
}

//! What a store already has on durable storage.

use substreams_core::BlockRange;
use substreams_storage::paths::{self, SnapshotFile};
use substreams_storage::{ObjectStore, SnapshotKind};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::kv::KvStore;

/// Snapshot files of one store, sorted by range.
#[derive(Debug, Clone, Default)]
pub struct SnapshotListing {
    files: Vec<SnapshotFile>,
}

impl SnapshotListing {
    pub fn fetch(objstore: &dyn ObjectStore, config: &StoreConfig) -> StoreResult<Self> {
        let mut files: Vec<SnapshotFile> = objstore
            .list(&paths::states_prefix(&config.module_hash))?
            .iter()
            .filter_map(|p| paths::parse_snapshot_path(p))
            .collect();
        files.sort_by_key(|f| (f.range.start, f.range.end, f.kind));
        debug!(store = %config.name, files = files.len(), "snapshots listed");
        Ok(Self { files })
    }

    pub fn from_files(mut files: Vec<SnapshotFile>) -> Self {
        files.sort_by_key(|f| (f.range.start, f.range.end, f.kind));
        Self { files }
    }

    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    /// The widest full snapshot starting at `module_start`.
    pub fn latest_full(&self, module_start: u64) -> Option<&SnapshotFile> {
        self.files
            .iter()
            .filter(|f| f.kind == SnapshotKind::Full && f.range.start == module_start)
            .max_by_key(|f| f.range.end)
    }

    /// End of the widest full snapshot, or `module_start` when there is none.
    pub fn full_until(&self, module_start: u64) -> u64 {
        self.latest_full(module_start)
            .map_or(module_start, |f| f.range.end)
    }

    pub fn has_full(&self, module_start: u64, end: u64) -> bool {
        end <= module_start
            || self.files.iter().any(|f| {
                f.kind == SnapshotKind::Full && f.range == BlockRange::new(module_start, end)
            })
    }

    /// Partials not yet covered by a full snapshot. A partial that ends at
    /// or before `full_until` is superseded and left out.
    pub fn live_partials(&self, module_start: u64) -> Vec<&SnapshotFile> {
        let full_until = self.full_until(module_start);
        self.files
            .iter()
            .filter(|f| f.kind == SnapshotKind::Partial && f.range.start >= full_until)
            .collect()
    }

    pub fn has_partial(&self, range: BlockRange) -> bool {
        self.files
            .iter()
            .any(|f| f.kind == SnapshotKind::Partial && f.range == range)
    }
}

/// Full state of `config`'s store right before `block`.
///
/// At or before the module's start the store is empty; past it a full
/// snapshot ending exactly at `block` must exist.
pub fn load_full_at(objstore: &dyn ObjectStore, config: &StoreConfig, block: u64) -> StoreResult<KvStore> {
    if block <= config.module_start {
        return Ok(KvStore::new_full(config.clone()));
    }
    let range = BlockRange::new(config.module_start, block);
    let file = SnapshotFile {
        kind: SnapshotKind::Full,
        range,
        path: paths::snapshot_path(&config.module_hash, SnapshotKind::Full, range),
    };
    KvStore::load(config.clone(), objstore, &file)
}

//! Block indexes built from index module outputs.
//!
//! Each index module emits a `Keys` message per block. Keys are gathered as
//! `key -> block numbers` and written as one JSON file per boundary segment.

use std::collections::{BTreeMap, BTreeSet};

use prost::Message;
use substreams_core::{BlockRange, pb};
use substreams_storage::{ObjectStore, paths};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};

pub struct IndexWriter {
    module: String,
    module_hash: String,
    start: u64,
    keys: BTreeMap<String, BTreeSet<u64>>,
}

impl IndexWriter {
    pub fn new(module: &str, module_hash: &str, start: u64) -> Self {
        Self {
            module: module.to_string(),
            module_hash: module_hash.to_string(),
            start,
            keys: BTreeMap::new(),
        }
    }

    /// Record the keys `payload` (an encoded `Keys`) lists for `block`.
    pub fn add(&mut self, block: u64, payload: &[u8]) -> PipelineResult<()> {
        let keys = pb::Keys::decode(payload).map_err(|e| {
            PipelineError::Internal(format!("index module {} emitted invalid keys: {e}", self.module))
        })?;
        for key in keys.keys {
            self.keys.entry(key).or_default().insert(block);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Write `[start, end)` and start the next segment at `end`.
    pub fn flush(&mut self, end: u64, objstore: &dyn ObjectStore) -> PipelineResult<()> {
        if end <= self.start {
            return Ok(());
        }
        let range = BlockRange::new(self.start, end);
        let body = serde_json::to_vec(&self.keys)
            .map_err(|e| PipelineError::Internal(format!("encoding index {}: {e}", self.module)))?;
        objstore.write(&paths::index_path(&self.module_hash, range), &body)?;
        info!(module = %self.module, %range, keys = self.keys.len(), "index written");
        self.keys.clear();
        self.start = end;
        Ok(())
    }

    /// Forget keys gathered so far and restart at `start`.
    pub fn restart(&mut self, start: u64) {
        debug!(module = %self.module, start, "index restarted");
        self.keys.clear();
        self.start = start;
    }
}

/// Read an index file back.
pub fn read_index(
    objstore: &dyn ObjectStore,
    module_hash: &str,
    range: BlockRange,
) -> PipelineResult<BTreeMap<String, Vec<u64>>> {
    let path = paths::index_path(module_hash, range);
    let body = objstore.read(&path)?;
    serde_json::from_slice(&body).map_err(|e| PipelineError::Internal(format!("decoding index {path}: {e}")))
}

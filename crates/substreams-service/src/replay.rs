//! Serving already-final blocks from the exec-output cache.

use std::collections::BTreeMap;

use substreams_core::BlockRange;
use substreams_execout::ExecOutCache;
use substreams_pipeline::response::{self, BlockScopedData, MapOutput, Response, ResponseTx};
use substreams_pipeline::{PipelineResult, RequestModules};
use substreams_storage::SharedStore;
use tracing::{debug, info};

/// Emit cached outputs of `outputs` within `range`, one message per block.
/// Store outputs have no cached payloads and are skipped. Returns the
/// number of blocks emitted.
pub fn replay_cached(
    modules: &RequestModules,
    objstore: SharedStore,
    save_interval: u64,
    outputs: &[String],
    range: BlockRange,
    responses: &ResponseTx,
) -> PipelineResult<u64> {
    if range.is_empty() {
        return Ok(0);
    }
    let mut cache = ExecOutCache::new(objstore, save_interval);
    let mut blocks: BTreeMap<u64, BlockScopedData> = BTreeMap::new();
    for name in outputs {
        let def = modules.module(name)?;
        if def.is_store() {
            debug!(module = %name, "store output has nothing to replay");
            continue;
        }
        cache.register(name, &modules.hash_hex(name)?, def.initial_block);
        for entry in cache.entries_in(name, range)? {
            let data = blocks.entry(entry.clock.number).or_insert_with(|| BlockScopedData {
                final_block_height: entry.clock.number,
                clock: entry.clock.clone(),
                cursor: entry.cursor.clone(),
                outputs: Vec::new(),
                debug_store_deltas: Vec::new(),
            });
            data.outputs.push(MapOutput {
                name: name.clone(),
                payload: entry.payload,
                logs: Vec::new(),
                logs_truncated: false,
            });
        }
    }

    let count = blocks.len() as u64;
    for data in blocks.into_values() {
        response::send(responses, Response::BlockScopedData(data))?;
    }
    info!(%range, blocks = count, "cached outputs replayed");
    Ok(count)
}

//! ExecOutCache — per-module output segments on the object store.
//!
//! Each module has a reader (the segment last loaded for lookups) and a
//! writer (the segment being filled). A writer is written out whole when a
//! block past its end arrives or when the cache is closed; object store
//! writes are atomic, so readers never see a half-written segment.

use std::collections::{BTreeMap, HashMap};

use substreams_core::block::{boundary_at_or_below, next_boundary};
use substreams_core::{BlockRange, Clock};
use substreams_storage::{ObjectStore, SharedStore, paths};
use tracing::{debug, info};

use crate::error::{ExecOutError, ExecOutResult};
use crate::reversible::ReversibleOutputs;
use crate::segment::{OutputEntry, Segment};

struct ModuleOutputs {
    hash: String,
    module_start: u64,
    reader: Option<Segment>,
    /// Aligned range known to have no segment on storage.
    miss: Option<BlockRange>,
    writer: Option<Segment>,
}

pub struct ExecOutCache {
    objstore: SharedStore,
    save_interval: u64,
    modules: HashMap<String, ModuleOutputs>,
    reversible: ReversibleOutputs,
}

impl ExecOutCache {
    pub fn new(objstore: SharedStore, save_interval: u64) -> Self {
        Self {
            objstore,
            save_interval: save_interval.max(1),
            modules: HashMap::new(),
            reversible: ReversibleOutputs::default(),
        }
    }

    pub fn register(&mut self, module: &str, hash: &str, module_start: u64) {
        self.modules.insert(
            module.to_string(),
            ModuleOutputs {
                hash: hash.to_string(),
                module_start,
                reader: None,
                miss: None,
                writer: None,
            },
        );
    }

    pub fn is_registered(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Start writing every module's outputs at `start`.
    pub fn begin(&mut self, start: u64) {
        let interval = self.save_interval;
        for outputs in self.modules.values_mut() {
            let lo = start.max(outputs.module_start);
            outputs.writer = Some(Segment::new(BlockRange::new(lo, next_boundary(lo, interval))));
        }
    }

    /// Cached output of `module` for the block identified by `clock`.
    pub fn get(&mut self, module: &str, clock: &Clock) -> ExecOutResult<Option<&OutputEntry>> {
        if self.reversible.get(module, clock.number).is_some() {
            return Ok(self.reversible.get(module, clock.number));
        }
        let interval = self.save_interval;
        let objstore = self.objstore.clone();
        let outputs = self.module_mut(module)?;

        let in_writer = outputs
            .writer
            .as_ref()
            .is_some_and(|w| w.get(clock.number).is_some());
        if !in_writer {
            let covered = outputs
                .reader
                .as_ref()
                .is_some_and(|r| r.range.contains(clock.number));
            let known_miss = outputs.miss.is_some_and(|m| m.contains(clock.number));
            if !covered && !known_miss {
                load_segment(objstore.as_ref(), module, outputs, clock.number, interval)?;
            }
        }

        let segment = if in_writer {
            outputs.writer.as_ref()
        } else {
            outputs.reader.as_ref().filter(|r| r.range.contains(clock.number))
        };
        Ok(segment
            .and_then(|s| s.get(clock.number))
            .filter(|e| e.clock.id == clock.id))
    }

    /// Append a final output.
    pub fn put(&mut self, module: &str, entry: OutputEntry) -> ExecOutResult<()> {
        let interval = self.save_interval;
        let objstore = self.objstore.clone();
        let outputs = self.module_mut(module)?;
        let block = entry.clock.number;

        if let Some(writer) = &outputs.writer {
            if let Some(last) = writer.last_block() {
                if block < last {
                    return Err(ExecOutError::OutOfOrder {
                        module: module.to_string(),
                        block,
                        last,
                    });
                }
            }
            if block >= writer.range.end {
                flush(objstore.as_ref(), module, outputs, None)?;
            }
        }
        let module_start = outputs.module_start;
        let writer = outputs.writer.get_or_insert_with(|| {
            let lo = boundary_at_or_below(block, interval).max(module_start);
            Segment::new(BlockRange::new(lo, next_boundary(block, interval)))
        });
        // A skipped stretch of blocks may leave the writer behind.
        if block >= writer.range.end {
            let lo = boundary_at_or_below(block, interval).max(module_start);
            *writer = Segment::new(BlockRange::new(lo, next_boundary(block, interval)));
        }
        writer.insert(entry);
        Ok(())
    }

    /// Hold an output until its block is final.
    pub fn put_reversible(&mut self, module: &str, entry: OutputEntry) {
        self.reversible.push(module, entry);
    }

    /// Drop the reversible outputs of an undone block and return them.
    pub fn handle_undo(&mut self, block: u64) -> BTreeMap<String, OutputEntry> {
        self.reversible.undo(block)
    }

    /// Move reversible outputs up to `block` into the durable cache.
    pub fn handle_final(&mut self, block: u64) -> ExecOutResult<()> {
        for (module, entry) in self.reversible.finalize(block) {
            if self.is_registered(&module) {
                self.put(&module, entry)?;
            }
        }
        Ok(())
    }

    pub fn reversible_len(&self) -> usize {
        self.reversible.len()
    }

    /// Write every open segment; segments are cut at `end` when given.
    pub fn close(&mut self, end: Option<u64>) -> ExecOutResult<()> {
        let objstore = self.objstore.clone();
        for (module, outputs) in self.modules.iter_mut() {
            flush(objstore.as_ref(), module, outputs, end)?;
        }
        Ok(())
    }

    /// Every cached output of `module` within `range`, in block order.
    pub fn entries_in(&self, module: &str, range: BlockRange) -> ExecOutResult<Vec<OutputEntry>> {
        let outputs = self
            .modules
            .get(module)
            .ok_or_else(|| ExecOutError::UnknownModule(module.to_string()))?;
        let mut found: BTreeMap<u64, OutputEntry> = BTreeMap::new();
        for path in self.objstore.list(&paths::outputs_prefix(&outputs.hash))? {
            let Some(seg_range) = paths::parse_segment_path(&path) else {
                continue;
            };
            if seg_range.end <= range.start || seg_range.start >= range.end {
                continue;
            }
            let segment = Segment::decode(&path, &self.objstore.read(&path)?)?;
            for entry in segment.entries().filter(|e| range.contains(e.clock.number)) {
                found.entry(entry.clock.number).or_insert_with(|| entry.clone());
            }
        }
        Ok(found.into_values().collect())
    }

    fn module_mut(&mut self, module: &str) -> ExecOutResult<&mut ModuleOutputs> {
        self.modules
            .get_mut(module)
            .ok_or_else(|| ExecOutError::UnknownModule(module.to_string()))
    }
}

fn load_segment(
    objstore: &dyn ObjectStore,
    module: &str,
    outputs: &mut ModuleOutputs,
    block: u64,
    interval: u64,
) -> ExecOutResult<()> {
    let listed = objstore.list(&paths::outputs_prefix(&outputs.hash))?;
    // Widest segment containing the block wins.
    let best = listed
        .iter()
        .filter_map(|p| paths::parse_segment_path(p).map(|r| (r, p)))
        .filter(|(r, _)| r.contains(block))
        .max_by_key(|(r, _)| r.len());

    match best {
        Some((range, path)) => {
            let segment = Segment::decode(path, &objstore.read(path)?)?;
            debug!(%module, %range, entries = segment.len(), "output segment loaded");
            outputs.reader = Some(segment);
            outputs.miss = None;
        }
        None => {
            let lo = boundary_at_or_below(block, interval);
            outputs.miss = Some(BlockRange::new(lo, next_boundary(block, interval)));
        }
    }
    Ok(())
}

fn flush(
    objstore: &dyn ObjectStore,
    module: &str,
    outputs: &mut ModuleOutputs,
    end: Option<u64>,
) -> ExecOutResult<()> {
    let Some(mut segment) = outputs.writer.take() else {
        return Ok(());
    };
    if segment.is_empty() {
        return Ok(());
    }
    if let Some(end) = end {
        segment.range.end = segment.range.end.min(end).max(segment.range.start + 1);
    }
    let path = paths::output_path(&outputs.hash, segment.range);
    objstore.write(&path, &segment.encode())?;
    info!(%module, range = %segment.range, entries = segment.len(), "output segment written");

    if outputs.miss.is_some_and(|m| m.start < segment.range.end && segment.range.start < m.end) {
        outputs.miss = None;
    }
    outputs.reader = Some(segment);
    Ok(())
}

#[cfg(test)]
mod tests {
    use substreams_storage::RedbStore;

    use super::*;
    use crate::segment::tests::entry;

    fn cache() -> ExecOutCache {
        let objstore: SharedStore = std::sync::Arc::new(RedbStore::open_in_memory().unwrap());
        let mut cache = ExecOutCache::new(objstore, 10);
        cache.register("m", "hash", 0);
        cache
    }

    #[test]
    fn writer_rolls_over_at_boundary() {
        let mut cache = cache();
        cache.begin(5);
        for n in 5..12 {
            cache.put("m", entry(n, &[n as u8])).unwrap();
        }
        cache.close(Some(12)).unwrap();

        let files = cache.objstore.list("hash/outputs/").unwrap();
        assert_eq!(
            files,
            vec![
                "hash/outputs/0000000005-0000000010.output",
                "hash/outputs/0000000010-0000000012.output",
            ]
        );
    }

    #[test]
    fn get_loads_segment_and_checks_block_id() {
        let mut cache = cache();
        cache.begin(0);
        for n in 0..10 {
            cache.put("m", entry(n, b"v")).unwrap();
        }
        cache.close(None).unwrap();

        let objstore = cache.objstore.clone();
        let mut fresh = ExecOutCache::new(objstore, 10);
        fresh.register("m", "hash", 0);
        let clock = entry(4, b"").clock;
        assert_eq!(fresh.get("m", &clock).unwrap().unwrap().payload, b"v");

        let forked = Clock {
            id: "other".into(),
            ..clock
        };
        assert!(fresh.get("m", &forked).unwrap().is_none());
        assert!(fresh.get("m", &entry(15, b"").clock).unwrap().is_none());
        assert!(matches!(
            fresh.get("nope", &forked),
            Err(ExecOutError::UnknownModule(_))
        ));
    }

    #[test]
    fn reversible_outputs_become_durable_on_final() {
        let mut cache = cache();
        cache.put_reversible("m", entry(1, b"one"));
        cache.put_reversible("m", entry(2, b"two"));
        cache.put_reversible("m", entry(3, b"three"));

        let undone = cache.handle_undo(3);
        assert_eq!(undone["m"].payload, b"three");

        cache.handle_final(2).unwrap();
        assert_eq!(cache.reversible_len(), 0);
        cache.close(None).unwrap();

        let entries = cache.entries_in("m", BlockRange::new(0, 10)).unwrap();
        let blocks: Vec<u64> = entries.iter().map(|e| e.clock.number).collect();
        assert_eq!(blocks, vec![1, 2]);
    }

    #[test]
    fn out_of_order_put_fails() {
        let mut cache = cache();
        cache.put("m", entry(5, b"")).unwrap();
        assert!(matches!(
            cache.put("m", entry(4, b"")),
            Err(ExecOutError::OutOfOrder { .. })
        ));
    }
}

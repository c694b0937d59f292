//! Store deltas of reversible blocks, kept until final or undone.

use std::collections::BTreeMap;

use substreams_store::Delta;

#[derive(Debug, Default)]
pub struct ReversibleDeltas {
    /// `block → [(store, deltas)]`, stores in execution order.
    blocks: BTreeMap<u64, Vec<(String, Vec<Delta>)>>,
}

impl ReversibleDeltas {
    pub fn record(&mut self, block: u64, store: &str, deltas: Vec<Delta>) {
        if deltas.is_empty() {
            return;
        }
        self.blocks
            .entry(block)
            .or_default()
            .push((store.to_string(), deltas));
    }

    /// Remove `block` and everything after it. The result is in the order
    /// the deltas must be reverted: newest block first, last store first.
    pub fn undo(&mut self, block: u64) -> Vec<(String, Vec<Delta>)> {
        let undone = self.blocks.split_off(&block);
        undone
            .into_values()
            .rev()
            .flat_map(|stores| stores.into_iter().rev())
            .collect()
    }

    /// Forget blocks up to and including `block`.
    pub fn finalize(&mut self, block: u64) {
        self.blocks = self.blocks.split_off(&(block + 1));
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

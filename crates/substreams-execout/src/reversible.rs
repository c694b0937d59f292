//! Outputs of blocks that can still be undone.

use std::collections::BTreeMap;

use crate::segment::OutputEntry;

/// `block number → module → output`, dropped once final or undone.
#[derive(Debug, Default)]
pub struct ReversibleOutputs {
    blocks: BTreeMap<u64, BTreeMap<String, OutputEntry>>,
}

impl ReversibleOutputs {
    pub fn push(&mut self, module: &str, entry: OutputEntry) {
        self.blocks
            .entry(entry.clock.number)
            .or_default()
            .insert(module.to_string(), entry);
    }

    pub fn get(&self, module: &str, block: u64) -> Option<&OutputEntry> {
        self.blocks.get(&block)?.get(module)
    }

    /// Remove and return the outputs of an undone block.
    pub fn undo(&mut self, block: u64) -> BTreeMap<String, OutputEntry> {
        self.blocks.remove(&block).unwrap_or_default()
    }

    /// Remove every block up to and including `block`, oldest first.
    pub fn finalize(&mut self, block: u64) -> Vec<(String, OutputEntry)> {
        let newer = self.blocks.split_off(&(block + 1));
        let done = std::mem::replace(&mut self.blocks, newer);
        done.into_values().flat_map(BTreeMap::into_iter).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::entry;

    #[test]
    fn finalize_drains_in_block_order() {
        let mut buf = ReversibleOutputs::default();
        buf.push("b", entry(11, b"b11"));
        buf.push("a", entry(10, b"a10"));
        buf.push("a", entry(12, b"a12"));

        let done = buf.finalize(11);
        let order: Vec<(String, u64)> = done.iter().map(|(m, e)| (m.clone(), e.clock.number)).collect();
        assert_eq!(order, vec![("a".into(), 10), ("b".into(), 11)]);
        assert_eq!(buf.len(), 1);
        assert!(buf.get("a", 12).is_some());
    }

    #[test]
    fn undo_removes_one_block() {
        let mut buf = ReversibleOutputs::default();
        buf.push("a", entry(10, b"x"));
        buf.push("a", entry(11, b"y"));
        let undone = buf.undo(11);
        assert_eq!(undone["a"].payload, b"y");
        assert!(buf.undo(11).is_empty());
        assert_eq!(buf.len(), 1);
    }
}

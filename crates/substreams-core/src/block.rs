//! Blocks, clocks, steps and block ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pb;

/// Fork step attached to every block event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    New,
    Undo,
    Irreversible,
    NewIrreversible,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::New => "new",
            Step::Undo => "undo",
            Step::Irreversible => "irreversible",
            Step::NewIrreversible => "new_irreversible",
        }
    }

    /// Whether this step carries a block to execute.
    pub fn is_new(self) -> bool {
        matches!(self, Step::New | Step::NewIrreversible)
    }

    /// Whether effects of this step may still be undone.
    pub fn is_reversible(self) -> bool {
        matches!(self, Step::New)
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Step::New),
            "undo" => Ok(Step::Undo),
            "irreversible" => Ok(Step::Irreversible),
            "new_irreversible" => Ok(Step::NewIrreversible),
            other => Err(format!("unknown step {other:?}")),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a block by number and id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub id: String,
}

impl BlockRef {
    pub fn new(number: u64, id: impl Into<String>) -> Self {
        Self {
            number,
            id: id.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

/// `(block_id, block_num, timestamp)` handed to every module call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    pub id: String,
    pub number: u64,
    pub timestamp_ns: i64,
}

impl Clock {
    pub fn to_pb(&self) -> pb::Clock {
        pb::Clock {
            id: self.id.clone(),
            number: self.number,
            timestamp_ns: self.timestamp_ns,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.number, self.id.clone())
    }
}

/// A block as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub id: String,
    pub parent_id: String,
    pub timestamp_ns: i64,
    /// Serialized chain-specific block, handed verbatim to `source` inputs.
    pub payload: Vec<u8>,
}

impl Block {
    pub fn clock(&self) -> Clock {
        Clock {
            id: self.id.clone(),
            number: self.number,
            timestamp_ns: self.timestamp_ns,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.number, self.id.clone())
    }
}

/// Half-open block range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end
    }

    /// Split into consecutive chunks ending on multiples of `size`.
    ///
    /// The first chunk may be shorter when `start` is off-boundary; the last
    /// may be shorter when `end` is.
    pub fn split_aligned(&self, size: u64) -> Vec<BlockRange> {
        let mut out = Vec::new();
        if size == 0 || self.is_empty() {
            return out;
        }
        let mut lo = self.start;
        while lo < self.end {
            let hi = next_boundary(lo, size).min(self.end);
            out.push(BlockRange::new(lo, hi));
            lo = hi;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// First multiple of `interval` strictly greater than `block`.
pub fn next_boundary(block: u64, interval: u64) -> u64 {
    block - (block % interval) + interval
}

/// Largest multiple of `interval` less than or equal to `block`.
pub fn boundary_at_or_below(block: u64, interval: u64) -> u64 {
    block - (block % interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        assert_eq!(next_boundary(0, 1000), 1000);
        assert_eq!(next_boundary(999, 1000), 1000);
        assert_eq!(next_boundary(1000, 1000), 2000);
        assert_eq!(boundary_at_or_below(1999, 1000), 1000);
        assert_eq!(boundary_at_or_below(2000, 1000), 2000);
    }

    #[test]
    fn split_aligned_off_boundary() {
        let chunks = BlockRange::new(1500, 4200).split_aligned(1000);
        assert_eq!(
            chunks,
            vec![
                BlockRange::new(1500, 2000),
                BlockRange::new(2000, 3000),
                BlockRange::new(3000, 4000),
                BlockRange::new(4000, 4200),
            ]
        );
    }

    #[test]
    fn split_aligned_exact() {
        let chunks = BlockRange::new(0, 10_000).split_aligned(1000);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|r| r.len() == 1000));
    }

    #[test]
    fn step_semantics() {
        assert!(Step::New.is_reversible());
        assert!(!Step::NewIrreversible.is_reversible());
        assert!(Step::NewIrreversible.is_new());
        assert!(!Step::Undo.is_new());
        assert_eq!("new_irreversible".parse::<Step>().unwrap(), Step::NewIrreversible);
        assert!("stalled".parse::<Step>().is_err());
    }
}

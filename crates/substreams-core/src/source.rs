//! Block source interface.
//!
//! The engine pulls blocks through [`BlockSource`]; where they come from
//! (a firehose endpoint, merged block files) is outside the engine.
//! [`MemoryBlockSource`] serves a recorded event sequence and backs the CLI's
//! `--blocks` JSON-lines files as well as tests.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::block::{Block, BlockRange, BlockRef, Step};
use crate::cursor::Cursor;
use crate::error::SourceError;

/// One event of the block stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub block: Block,
    pub step: Step,
    /// Last irreversible block at the time of the event.
    pub final_block: BlockRef,
}

impl BlockEvent {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(
            self.step,
            self.block.block_ref(),
            self.final_block.clone(),
            self.block.block_ref(),
        )
    }
}

/// A pull-based stream of block events.
pub trait BlockSource: Send {
    /// Next event, or `None` when the stream ended.
    fn next_event(&mut self) -> Result<Option<BlockEvent>, SourceError>;
}

/// Opens block streams for the live path and for backfill ranges.
pub trait BlockSourceFactory: Send + Sync {
    /// Events as they occur, starting at the first event for `start_block` or later.
    fn live(&self, start_block: u64) -> Result<Box<dyn BlockSource>, SourceError>;

    /// Final blocks within `range`, each delivered as `new_irreversible`.
    fn final_range(&self, range: BlockRange) -> Result<Box<dyn BlockSource>, SourceError>;

    /// Highest block known to be final, if the source knows one.
    fn recent_final_block(&self) -> Option<u64>;
}

/// Replays a fixed list of events.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockSource {
    events: Arc<Vec<BlockEvent>>,
}

impl MemoryBlockSource {
    pub fn new(events: Vec<BlockEvent>) -> Self {
        Self {
            events: Arc::new(events),
        }
    }

    /// Linear final chain: each block is delivered `new_irreversible`.
    pub fn linear(blocks: Vec<Block>) -> Self {
        let events = blocks
            .into_iter()
            .map(|block| {
                let final_block = block.block_ref();
                BlockEvent {
                    block,
                    step: Step::NewIrreversible,
                    final_block,
                }
            })
            .collect();
        Self::new(events)
    }

    /// Load events from a JSON-lines file, one event object per line.
    pub fn from_json_lines(path: &Path) -> Result<Self, SourceError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(parse_event_line(idx + 1, &line)?);
        }
        debug!(path = %path.display(), events = events.len(), "loaded block events");
        Ok(Self::new(events))
    }

    pub fn events(&self) -> &[BlockEvent] {
        &self.events
    }

    /// Blocks remaining on the canonical chain once every undo is applied.
    fn canonical_chain(&self) -> BTreeMap<u64, Block> {
        let mut chain = BTreeMap::new();
        for event in self.events.iter() {
            match event.step {
                Step::New | Step::NewIrreversible => {
                    chain.insert(event.block.number, event.block.clone());
                }
                Step::Undo => {
                    chain.remove(&event.block.number);
                }
                Step::Irreversible => {}
            }
        }
        chain
    }
}

impl BlockSourceFactory for MemoryBlockSource {
    fn live(&self, start_block: u64) -> Result<Box<dyn BlockSource>, SourceError> {
        let events: Vec<BlockEvent> = self
            .events
            .iter()
            .filter(|e| e.block.number >= start_block)
            .cloned()
            .collect();
        Ok(Box::new(VecStream::new(events)))
    }

    fn final_range(&self, range: BlockRange) -> Result<Box<dyn BlockSource>, SourceError> {
        let final_height = self.recent_final_block().ok_or_else(|| {
            SourceError::Upstream("no final block known to the source".to_string())
        })?;
        if range.end > final_height + 1 {
            return Err(SourceError::Upstream(format!(
                "range {range} extends past final block {final_height}"
            )));
        }
        let events = self
            .canonical_chain()
            .into_values()
            .filter(|b| range.contains(b.number))
            .map(|block| {
                let final_block = block.block_ref();
                BlockEvent {
                    block,
                    step: Step::NewIrreversible,
                    final_block,
                }
            })
            .collect();
        Ok(Box::new(VecStream::new(events)))
    }

    fn recent_final_block(&self) -> Option<u64> {
        self.events
            .iter()
            .filter(|e| !e.final_block.id.is_empty())
            .map(|e| e.final_block.number)
            .max()
    }
}

/// Iterator-backed stream.
pub struct VecStream {
    events: std::vec::IntoIter<BlockEvent>,
}

impl VecStream {
    pub fn new(events: Vec<BlockEvent>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

impl BlockSource for VecStream {
    fn next_event(&mut self) -> Result<Option<BlockEvent>, SourceError> {
        Ok(self.events.next())
    }
}

#[derive(Deserialize)]
struct EventLine {
    number: u64,
    id: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    timestamp_ns: i64,
    #[serde(default)]
    payload_hex: String,
    #[serde(default)]
    step: Option<String>,
    #[serde(default)]
    final_block: Option<BlockRef>,
}

fn parse_event_line(line_no: usize, line: &str) -> Result<BlockEvent, SourceError> {
    let decode_err = |reason: String| SourceError::Decode {
        line: line_no,
        reason,
    };
    let raw: EventLine = serde_json::from_str(line).map_err(|e| decode_err(e.to_string()))?;
    let step = match raw.step.as_deref() {
        None => Step::NewIrreversible,
        Some(s) => s.parse::<Step>().map_err(decode_err)?,
    };
    let payload = hex::decode(&raw.payload_hex).map_err(|e| decode_err(e.to_string()))?;
    let block = Block {
        number: raw.number,
        id: raw.id,
        parent_id: raw.parent_id,
        timestamp_ns: raw.timestamp_ns,
        payload,
    };
    let final_block = match raw.final_block {
        Some(f) => f,
        None if step == Step::NewIrreversible => block.block_ref(),
        None => BlockRef::default(),
    };
    Ok(BlockEvent {
        block,
        step,
        final_block,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn block(number: u64, id: &str) -> Block {
        Block {
            number,
            id: id.into(),
            parent_id: String::new(),
            timestamp_ns: number as i64 * 1_000_000_000,
            payload: vec![number as u8],
        }
    }

    fn drain(mut source: Box<dyn BlockSource>) -> Vec<BlockEvent> {
        let mut out = Vec::new();
        while let Some(event) = source.next_event().unwrap() {
            out.push(event);
        }
        out
    }

    #[test]
    fn final_range_uses_canonical_chain() {
        let final_ref = BlockRef::new(102, "c");
        let mk = |b: Block, step| BlockEvent {
            block: b,
            step,
            final_block: final_ref.clone(),
        };
        let source = MemoryBlockSource::new(vec![
            mk(block(100, "a"), Step::New),
            mk(block(101, "b"), Step::New),
            mk(block(101, "b"), Step::Undo),
            mk(block(101, "b2"), Step::New),
            mk(block(102, "c"), Step::New),
        ]);

        let events = drain(source.final_range(BlockRange::new(100, 102)).unwrap());
        let ids: Vec<&str> = events.iter().map(|e| e.block.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b2"]);
        assert!(events.iter().all(|e| e.step == Step::NewIrreversible));
    }

    #[test]
    fn final_range_past_final_block_fails() {
        let source = MemoryBlockSource::linear(vec![block(1, "a"), block(2, "b")]);
        assert!(source.final_range(BlockRange::new(0, 10)).is_err());
        assert_eq!(source.recent_final_block(), Some(2));
    }

    #[test]
    fn live_skips_earlier_blocks() {
        let source = MemoryBlockSource::linear((0..5).map(|n| block(n, "x")).collect());
        let events = drain(source.live(3).unwrap());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].block.number, 3);
    }

    #[test]
    fn json_lines_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"number":10,"id":"aa","payload_hex":"01","step":"new","final_block":{{"number":9,"id":"99"}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"number":11,"id":"bb","payload_hex":"0203"}}"#).unwrap();

        let source = MemoryBlockSource::from_json_lines(file.path()).unwrap();
        let events = source.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, Step::New);
        assert_eq!(events[0].final_block, BlockRef::new(9, "99"));
        assert_eq!(events[1].step, Step::NewIrreversible);
        assert_eq!(events[1].block.payload, vec![2, 3]);
        assert_eq!(source.recent_final_block(), Some(11));
    }

    #[test]
    fn json_lines_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"number":10}}"#).unwrap();
        let err = MemoryBlockSource::from_json_lines(file.path()).unwrap_err();
        assert!(matches!(err, SourceError::Decode { line: 1, .. }));
    }
}

//! Output segment file codec.
//!
//! ```text
//! u32 magic "SFOU" · u32 version · u64 range start · u64 range end
//! u32 entry count · { u32 id len · id · u64 number · i64 timestamp_ns
//!                     u32 cursor len · cursor · u32 payload len · payload }*
//! u32 crc32c of everything above
//! ```

use std::collections::BTreeMap;

use substreams_core::{BlockRange, Clock};

use crate::error::{ExecOutError, ExecOutResult};

pub const SEGMENT_MAGIC: u32 = 0x5346_4F55;
pub const SEGMENT_VERSION: u32 = 1;

/// One module output for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub clock: Clock,
    pub cursor: String,
    pub payload: Vec<u8>,
}

/// Outputs of one module over a block range, by block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub range: BlockRange,
    entries: BTreeMap<u64, OutputEntry>,
}

impl Segment {
    pub fn new(range: BlockRange) -> Self {
        Self {
            range,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, block: u64) -> Option<&OutputEntry> {
        self.entries.get(&block)
    }

    pub fn insert(&mut self, entry: OutputEntry) {
        self.entries.insert(entry.clock.number, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_block(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &OutputEntry> {
        self.entries.values()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, SEGMENT_MAGIC);
        put_u32(&mut out, SEGMENT_VERSION);
        out.extend_from_slice(&self.range.start.to_le_bytes());
        out.extend_from_slice(&self.range.end.to_le_bytes());
        put_u32(&mut out, self.entries.len() as u32);
        for entry in self.entries.values() {
            put_bytes(&mut out, entry.clock.id.as_bytes());
            out.extend_from_slice(&entry.clock.number.to_le_bytes());
            out.extend_from_slice(&entry.clock.timestamp_ns.to_le_bytes());
            put_bytes(&mut out, entry.cursor.as_bytes());
            put_bytes(&mut out, &entry.payload);
        }
        let crc = crc32c::crc32c(&out);
        put_u32(&mut out, crc);
        out
    }

    pub fn decode(path: &str, data: &[u8]) -> ExecOutResult<Self> {
        let corrupt = |reason: String| ExecOutError::Corrupt {
            path: path.to_string(),
            reason,
        };
        if data.len() < 4 {
            return Err(corrupt("file too short".to_string()));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        if crc32c::crc32c(body) != u32::from_le_bytes(crc) {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let mut r = Reader { buf: body, pos: 0 };
        if r.u32().map_err(&corrupt)? != SEGMENT_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = r.u32().map_err(&corrupt)?;
        if version != SEGMENT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let range = BlockRange::new(r.u64().map_err(&corrupt)?, r.u64().map_err(&corrupt)?);
        let count = r.u32().map_err(&corrupt)?;
        let mut segment = Segment::new(range);
        for _ in 0..count {
            let id = r.string().map_err(&corrupt)?;
            let number = r.u64().map_err(&corrupt)?;
            let timestamp_ns = r.u64().map_err(&corrupt)? as i64;
            let cursor = r.string().map_err(&corrupt)?;
            let payload = r.bytes().map_err(&corrupt)?.to_vec();
            segment.insert(OutputEntry {
                clock: Clock {
                    id,
                    number,
                    timestamp_ns,
                },
                cursor,
                payload,
            });
        }
        if r.pos != body.len() {
            return Err(corrupt(format!("{} trailing bytes", body.len() - r.pos)));
        }
        Ok(segment)
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<&'a [u8], String> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, String> {
        String::from_utf8(self.bytes()?.to_vec()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(number: u64, payload: &[u8]) -> OutputEntry {
        OutputEntry {
            clock: Clock {
                id: format!("id{number}"),
                number,
                timestamp_ns: -(number as i64),
            },
            cursor: format!("c{number}"),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn decode_restores_entries() {
        let mut segment = Segment::new(BlockRange::new(0, 100));
        segment.insert(entry(7, b"seven"));
        segment.insert(entry(3, b""));
        let back = Segment::decode("p", &segment.encode()).unwrap();
        assert_eq!(back, segment);
        assert_eq!(back.get(7).unwrap().payload, b"seven");
        assert_eq!(back.last_block(), Some(7));
    }

    #[test]
    fn corrupt_segment_is_rejected() {
        let mut data = Segment::new(BlockRange::new(0, 100)).encode();
        data[5] ^= 1;
        assert!(matches!(
            Segment::decode("p", &data),
            Err(ExecOutError::Corrupt { .. })
        ));
    }
}

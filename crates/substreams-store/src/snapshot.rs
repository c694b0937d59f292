//! Snapshot file codec and persistence.
//!
//! ```text
//! u32 magic "SFKV" · u32 version · u32 policy tag · u32 value type tag
//! u64 range start · u64 range end (exclusive)
//! u32 kv count   · { u32 key len · key · u32 value len · value }*
//! u32 prefix count · { u32 len · prefix }*
//! u32 crc32c of everything above
//! ```
//!
//! All integers little-endian. Keys are written in sorted order, so equal
//! stores always produce equal files.

use std::collections::{BTreeMap, BTreeSet};

use substreams_core::BlockRange;
use substreams_storage::paths::{self, SnapshotFile};
use substreams_storage::{ObjectStore, SnapshotKind};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;

pub const SNAPSHOT_MAGIC: u32 = 0x5346_4B56;
pub const SNAPSHOT_VERSION: u32 = 1;

/// A snapshot captured in memory, not yet written.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub file: SnapshotFile,
    pub data: Vec<u8>,
}

impl PendingSnapshot {
    pub fn write(&self, objstore: &dyn ObjectStore) -> StoreResult<()> {
        objstore.write(&self.file.path, &self.data)?;
        debug!(path = %self.file.path, bytes = self.data.len(), "snapshot written");
        Ok(())
    }
}

impl KvStore {
    /// Capture the store as covering `[range_start, end)`.
    pub fn save(&mut self, end: u64) -> PendingSnapshot {
        self.set_range_end(end);
        let range = BlockRange::new(self.range_start(), end);
        let file = SnapshotFile {
            kind: self.kind(),
            range,
            path: paths::snapshot_path(&self.config().module_hash, self.kind(), range),
        };
        info!(store = %self.name(), kind = ?self.kind(), %range, keys = self.len(), "store saved");
        PendingSnapshot {
            file,
            data: self.encode(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let config = self.config();
        let mut out = Vec::with_capacity(64 + self.total_size() as usize);
        put_u32(&mut out, SNAPSHOT_MAGIC);
        put_u32(&mut out, SNAPSHOT_VERSION);
        put_u32(&mut out, config.policy.tag());
        put_u32(&mut out, config.value_type.tag());
        out.extend_from_slice(&self.range_start().to_le_bytes());
        out.extend_from_slice(&self.range_end().to_le_bytes());
        put_u32(&mut out, self.len() as u32);
        for (key, value) in self.iter() {
            put_bytes(&mut out, key.as_bytes());
            put_bytes(&mut out, value);
        }
        let prefixes: Vec<&str> = self.delete_prefixes().collect();
        put_u32(&mut out, prefixes.len() as u32);
        for prefix in prefixes {
            put_bytes(&mut out, prefix.as_bytes());
        }
        let crc = crc32c::crc32c(&out);
        put_u32(&mut out, crc);
        out
    }

    pub fn decode(
        config: StoreConfig,
        kind: SnapshotKind,
        path: &str,
        data: &[u8],
    ) -> StoreResult<KvStore> {
        let corrupt = |reason: String| StoreError::Corrupt {
            store: config.name.clone(),
            path: path.to_string(),
            reason,
        };
        if data.len() < 4 {
            return Err(corrupt("file too short".to_string()));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32c::crc32c(body) != expected {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let mut r = Reader { buf: body, pos: 0 };
        let magic = r.u32().map_err(&corrupt)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = r.u32().map_err(&corrupt)?;
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let policy = r.u32().map_err(&corrupt)?;
        let value_type = r.u32().map_err(&corrupt)?;
        if policy != config.policy.tag() || value_type != config.value_type.tag() {
            return Err(StoreError::Incompatible {
                store: config.name.clone(),
                reason: format!(
                    "snapshot has policy/value type tags {policy}/{value_type}, module declares {}/{}",
                    config.policy, config.value_type
                ),
            });
        }
        let start = r.u64().map_err(&corrupt)?;
        let end = r.u64().map_err(&corrupt)?;

        let count = r.u32().map_err(&corrupt)?;
        let mut kv = BTreeMap::new();
        for _ in 0..count {
            let key = r.string().map_err(&corrupt)?;
            let value = r.bytes().map_err(&corrupt)?.to_vec();
            kv.insert(key, value);
        }
        let prefix_count = r.u32().map_err(&corrupt)?;
        let mut prefixes = BTreeSet::new();
        for _ in 0..prefix_count {
            prefixes.insert(r.string().map_err(&corrupt)?);
        }
        if r.pos != body.len() {
            return Err(corrupt(format!("{} trailing bytes", body.len() - r.pos)));
        }

        Ok(KvStore::from_parts(config, kind, start, end, kv, prefixes))
    }

    /// Read and decode a listed snapshot file.
    pub fn load(
        config: StoreConfig,
        objstore: &dyn ObjectStore,
        file: &SnapshotFile,
    ) -> StoreResult<KvStore> {
        let data = objstore.read(&file.path).map_err(|e| {
            if e.is_not_found() {
                StoreError::SegmentMissing {
                    store: config.name.clone(),
                    path: file.path.clone(),
                }
            } else {
                StoreError::Storage(e)
            }
        })?;
        let store = KvStore::decode(config, file.kind, &file.path, &data)?;
        debug!(store = %store.name(), path = %file.path, keys = store.len(), "store loaded");
        Ok(store)
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
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<&'a [u8], String> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("key is not UTF-8: {e}"))
    }
}

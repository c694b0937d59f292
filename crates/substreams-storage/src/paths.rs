//! Object naming for module state, outputs and indexes.
//!
//! ```text
//! <module_hash>/states/<lo:010>-<hi:010>.kv           full snapshot
//! <module_hash>/states/<lo:010>-<hi:010>.partial.kv   partial snapshot
//! <module_hash>/outputs/<lo:010>-<hi:010>.output      exec-output segment
//! <module_hash>/index/<lo:010>-<hi:010>.index         block index segment
//! ```
//!
//! Zero padding keeps lexicographic listing order equal to block order.

use substreams_core::BlockRange;

const FULL_SUFFIX: &str = ".kv";
const PARTIAL_SUFFIX: &str = ".partial.kv";
const OUTPUT_SUFFIX: &str = ".output";
const INDEX_SUFFIX: &str = ".index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotKind {
    Full,
    Partial,
}

/// A snapshot file found by listing a module's `states/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub kind: SnapshotKind,
    pub range: BlockRange,
    pub path: String,
}

pub fn states_prefix(module_hash: &str) -> String {
    format!("{module_hash}/states/")
}

pub fn outputs_prefix(module_hash: &str) -> String {
    format!("{module_hash}/outputs/")
}

pub fn index_prefix(module_hash: &str) -> String {
    format!("{module_hash}/index/")
}

pub fn snapshot_path(module_hash: &str, kind: SnapshotKind, range: BlockRange) -> String {
    let suffix = match kind {
        SnapshotKind::Full => FULL_SUFFIX,
        SnapshotKind::Partial => PARTIAL_SUFFIX,
    };
    format!("{}{}{suffix}", states_prefix(module_hash), range_stem(range))
}

pub fn output_path(module_hash: &str, range: BlockRange) -> String {
    format!("{}{}{OUTPUT_SUFFIX}", outputs_prefix(module_hash), range_stem(range))
}

pub fn index_path(module_hash: &str, range: BlockRange) -> String {
    format!("{}{}{INDEX_SUFFIX}", index_prefix(module_hash), range_stem(range))
}

fn range_stem(range: BlockRange) -> String {
    format!("{:010}-{:010}", range.start, range.end)
}

/// Parse a listed `states/` path. Unrelated files yield `None`.
pub fn parse_snapshot_path(path: &str) -> Option<SnapshotFile> {
    let name = path.rsplit('/').next()?;
    let (stem, kind) = if let Some(stem) = name.strip_suffix(PARTIAL_SUFFIX) {
        (stem, SnapshotKind::Partial)
    } else {
        (name.strip_suffix(FULL_SUFFIX)?, SnapshotKind::Full)
    };
    Some(SnapshotFile {
        kind,
        range: parse_stem(stem)?,
        path: path.to_string(),
    })
}

/// Range of a listed `outputs/` or `index/` segment path.
pub fn parse_segment_path(path: &str) -> Option<BlockRange> {
    let name = path.rsplit('/').next()?;
    let stem = name
        .strip_suffix(OUTPUT_SUFFIX)
        .or_else(|| name.strip_suffix(INDEX_SUFFIX))?;
    parse_stem(stem)
}

fn parse_stem(stem: &str) -> Option<BlockRange> {
    let (lo, hi) = stem.split_once('-')?;
    if lo.len() != 10 || hi.len() != 10 {
        return None;
    }
    let range = BlockRange::new(lo.parse().ok()?, hi.parse().ok()?);
    (range.start < range.end).then_some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_paths_are_zero_padded() {
        let range = BlockRange::new(1000, 2000);
        assert_eq!(
            snapshot_path("abc", SnapshotKind::Full, range),
            "abc/states/0000001000-0000002000.kv"
        );
        assert_eq!(
            snapshot_path("abc", SnapshotKind::Partial, range),
            "abc/states/0000001000-0000002000.partial.kv"
        );
        assert_eq!(output_path("abc", range), "abc/outputs/0000001000-0000002000.output");
        assert_eq!(index_path("abc", range), "abc/index/0000001000-0000002000.index");
    }

    #[test]
    fn parse_round_trips_names() {
        let range = BlockRange::new(0, 1000);
        let partial = snapshot_path("h", SnapshotKind::Partial, range);
        let parsed = parse_snapshot_path(&partial).unwrap();
        assert_eq!(parsed.kind, SnapshotKind::Partial);
        assert_eq!(parsed.range, range);

        let full = parse_snapshot_path("h/states/0000000000-0000001000.kv").unwrap();
        assert_eq!(full.kind, SnapshotKind::Full);

        assert_eq!(parse_segment_path(&output_path("h", range)), Some(range));
    }

    #[test]
    fn unrelated_names_are_ignored() {
        assert!(parse_snapshot_path("h/states/notes.txt").is_none());
        assert!(parse_snapshot_path("h/states/10-20.kv").is_none());
        assert!(parse_snapshot_path("h/states/0000000020-0000000010.kv").is_none());
    }
}

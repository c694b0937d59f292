//! Merging a later partial into an earlier snapshot.
//!
//! The later partial's delete prefixes are replayed over the earlier state
//! first, then each of its keys is folded in under the store's policy. The
//! operation is associative, so a chain of partials squashes to the same
//! state whatever the grouping.

use substreams_core::UpdatePolicy;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;
use crate::value::NumericOp;

impl KvStore {
    /// Fold `later`, which must start where `self` ends, into `self`.
    pub fn merge(&mut self, later: &KvStore) -> StoreResult<()> {
        self.check_mergeable(later)?;

        for prefix in later.delete_prefixes() {
            self.remove_prefix(prefix);
            if self.is_partial() {
                self.insert_delete_prefix(prefix);
            }
        }

        let policy = self.config().policy;
        for (key, value) in later.iter() {
            let merged = match policy {
                UpdatePolicy::Set => Some(value.to_vec()),
                UpdatePolicy::SetIfNotExists => {
                    (!self.has_last(key)).then(|| value.to_vec())
                }
                UpdatePolicy::Add => Some(self.fold_numeric(key, self.get_last(key), value, NumericOp::Add)?),
                UpdatePolicy::Min => Some(self.fold_numeric(key, self.get_last(key), value, NumericOp::Min)?),
                UpdatePolicy::Max => Some(self.fold_numeric(key, self.get_last(key), value, NumericOp::Max)?),
                UpdatePolicy::Append => {
                    let mut combined = self.get_last(key).map(<[u8]>::to_vec).unwrap_or_default();
                    combined.extend_from_slice(value);
                    self.check_append_size(key, combined.len())?;
                    Some(combined)
                }
            };
            if let Some(merged) = merged {
                self.check_size(key, &merged)?;
                self.replace(key, Some(merged));
            }
        }

        self.set_range_end(later.range_end());
        debug!(
            store = %self.name(),
            start = self.range_start(),
            end = self.range_end(),
            keys = self.len(),
            "partial merged"
        );
        Ok(())
    }

    fn check_mergeable(&self, later: &KvStore) -> StoreResult<()> {
        let incompatible = |reason: String| StoreError::Incompatible {
            store: self.name().to_string(),
            reason,
        };
        let (mine, theirs) = (self.config(), later.config());
        if mine.policy != theirs.policy || mine.value_type != theirs.value_type {
            return Err(incompatible(format!(
                "cannot merge {}:{} into {}:{}",
                theirs.policy, theirs.value_type, mine.policy, mine.value_type
            )));
        }
        if !later.is_partial() {
            return Err(incompatible("only partial snapshots can be merged in".to_string()));
        }
        if later.range_start() != self.range_end() {
            return Err(incompatible(format!(
                "partial starts at {} but state ends at {}",
                later.range_start(),
                self.range_end()
            )));
        }
        Ok(())
    }
}

/// Merge two abutting snapshots into a new one.
pub fn squash(earlier: &KvStore, later: &KvStore) -> StoreResult<KvStore> {
    let mut out = earlier.clone();
    out.reset();
    out.merge(later)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use substreams_core::ValueType;

    use super::*;
    use crate::config::StoreConfig;

    fn config(policy: UpdatePolicy, value_type: ValueType) -> StoreConfig {
        StoreConfig::new("s", "abcd", 0, policy, value_type)
    }

    fn partial(config: &StoreConfig, start: u64, end: u64, writes: &[(&str, &[u8])]) -> KvStore {
        let mut s = KvStore::new_partial(config.clone(), start);
        for (i, (key, value)) in writes.iter().enumerate() {
            let ord = i as u64;
            match config.policy {
                UpdatePolicy::Set => s.set(ord, key, value).unwrap(),
                UpdatePolicy::SetIfNotExists => s.set_if_not_exists(ord, key, value).unwrap(),
                UpdatePolicy::Append => s.append(ord, key, value).unwrap(),
                UpdatePolicy::Add => s.add_bigint(ord, key, value).unwrap(),
                UpdatePolicy::Min => s.set_min_bigint(ord, key, value).unwrap(),
                UpdatePolicy::Max => s.set_max_bigint(ord, key, value).unwrap(),
            }
        }
        s.reset();
        s.save(end);
        s
    }

    fn value<'a>(s: &'a KvStore, key: &str) -> Option<&'a str> {
        s.get_last(key).map(|b| std::str::from_utf8(b).unwrap())
    }

    #[test]
    fn set_later_wins_and_set_if_not_exists_earlier_wins() {
        let set = config(UpdatePolicy::Set, ValueType::String);
        let merged = squash(
            &partial(&set, 0, 10, &[("k", b"old"), ("only", b"1")]),
            &partial(&set, 10, 20, &[("k", b"new")]),
        )
        .unwrap();
        assert_eq!(value(&merged, "k"), Some("new"));
        assert_eq!(value(&merged, "only"), Some("1"));
        assert_eq!(merged.range_end(), 20);

        let sine = config(UpdatePolicy::SetIfNotExists, ValueType::String);
        let merged = squash(
            &partial(&sine, 0, 10, &[("k", b"old")]),
            &partial(&sine, 10, 20, &[("k", b"new"), ("x", b"y")]),
        )
        .unwrap();
        assert_eq!(value(&merged, "k"), Some("old"));
        assert_eq!(value(&merged, "x"), Some("y"));
    }

    #[test]
    fn numeric_and_append_fold() {
        let add = config(UpdatePolicy::Add, ValueType::BigInt);
        let merged = squash(
            &partial(&add, 0, 10, &[("k", b"-5")]),
            &partial(&add, 10, 20, &[("k", b"-7")]),
        )
        .unwrap();
        assert_eq!(value(&merged, "k"), Some("-12"));

        let max = config(UpdatePolicy::Max, ValueType::BigInt);
        let merged = squash(
            &partial(&max, 0, 10, &[("k", b"9")]),
            &partial(&max, 10, 20, &[("k", b"3")]),
        )
        .unwrap();
        assert_eq!(value(&merged, "k"), Some("9"));

        let append = config(UpdatePolicy::Append, ValueType::String);
        let merged = squash(
            &partial(&append, 0, 10, &[("k", b"ab")]),
            &partial(&append, 10, 20, &[("k", b"cd")]),
        )
        .unwrap();
        assert_eq!(value(&merged, "k"), Some("abcd"));
    }

    #[test]
    fn later_delete_prefix_clears_earlier_keys() {
        let set = config(UpdatePolicy::Set, ValueType::String);
        let earlier = partial(&set, 0, 10, &[("a:1", b"x"), ("b:1", b"y")]);
        let mut later = KvStore::new_partial(set.clone(), 10);
        later.delete_prefix(0, "a:").unwrap();
        later.set(1, "a:2", b"z").unwrap();
        later.save(20);

        let merged = squash(&earlier, &later).unwrap();
        assert_eq!(value(&merged, "a:1"), None);
        assert_eq!(value(&merged, "a:2"), Some("z"));
        assert_eq!(value(&merged, "b:1"), Some("y"));
        assert_eq!(merged.delete_prefixes().collect::<Vec<_>>(), vec!["a:"]);
    }

    #[test]
    fn gaps_and_mismatches_are_rejected() {
        let set = config(UpdatePolicy::Set, ValueType::String);
        let a = partial(&set, 0, 10, &[]);
        let c = partial(&set, 20, 30, &[]);
        assert!(matches!(squash(&a, &c), Err(StoreError::Incompatible { .. })));

        let other = config(UpdatePolicy::Add, ValueType::BigInt);
        let b = partial(&other, 10, 20, &[]);
        assert!(matches!(squash(&a, &b), Err(StoreError::Incompatible { .. })));
    }
}

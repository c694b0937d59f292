//! KvStore — one store's in-memory state.
//!
//! State is a sorted map so serialization order never depends on insertion
//! order. Every mutation of the current block is also kept in an ordered
//! delta log; readers use it to answer "as of ordinal" and "before this
//! block" queries without copying the map.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use substreams_core::{UpdatePolicy, ValueType};
use substreams_storage::SnapshotKind;
use tracing::trace;

use crate::config::StoreConfig;
use crate::delta::{Delta, DeltaOp};
use crate::error::{StoreError, StoreResult};
use crate::value::{Numeric, NumericError, NumericOp, fold_encoded};

#[derive(Debug, Clone)]
pub struct KvStore {
    config: StoreConfig,
    kind: SnapshotKind,
    /// State covers `[range_start, range_end)`.
    range_start: u64,
    range_end: u64,
    kv: BTreeMap<String, Vec<u8>>,
    /// Prefixes deleted within a partial's range; replayed over the earlier
    /// state when the partial is merged.
    delete_prefixes: BTreeSet<String>,
    deltas: Vec<Delta>,
    last_ordinal: Option<u64>,
    total_size: u64,
}

impl KvStore {
    /// Empty full store starting at the module's initial block.
    pub fn new_full(config: StoreConfig) -> Self {
        let start = config.module_start;
        Self::from_parts(config, SnapshotKind::Full, start, start, BTreeMap::new(), BTreeSet::new())
    }

    /// Empty partial store starting at `start`.
    pub fn new_partial(config: StoreConfig, start: u64) -> Self {
        Self::from_parts(config, SnapshotKind::Partial, start, start, BTreeMap::new(), BTreeSet::new())
    }

    pub(crate) fn from_parts(
        config: StoreConfig,
        kind: SnapshotKind,
        range_start: u64,
        range_end: u64,
        kv: BTreeMap<String, Vec<u8>>,
        delete_prefixes: BTreeSet<String>,
    ) -> Self {
        let total_size = kv.iter().map(|(k, v)| entry_size(k, v)).sum();
        Self {
            config,
            kind,
            range_start,
            range_end,
            kv,
            delete_prefixes,
            deltas: Vec::new(),
            last_ordinal: None,
            total_size,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn is_partial(&self) -> bool {
        self.kind == SnapshotKind::Partial
    }

    pub fn range_start(&self) -> u64 {
        self.range_start
    }

    pub fn range_end(&self) -> u64 {
        self.range_end
    }

    pub(crate) fn set_range_end(&mut self, end: u64) {
        self.range_end = end;
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.kv.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn delete_prefixes(&self) -> impl Iterator<Item = &str> {
        self.delete_prefixes.iter().map(String::as_str)
    }

    /// Mutations of the current block, in ordinal order.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Drop the current block's deltas. State is kept.
    pub fn reset(&mut self) {
        self.deltas.clear();
        self.last_ordinal = None;
    }

    /// Start a fresh partial at `start`, discarding all state.
    pub fn roll_partial(&mut self, start: u64) {
        self.kind = SnapshotKind::Partial;
        self.range_start = start;
        self.range_end = start;
        self.kv.clear();
        self.delete_prefixes.clear();
        self.total_size = 0;
        self.reset();
    }

    // ── Readers ────────────────────────────────────────────────────

    /// Current value, including this block's writes.
    pub fn get_last(&self, key: &str) -> Option<&[u8]> {
        self.kv.get(key).map(Vec::as_slice)
    }

    /// Value before any of this block's writes.
    pub fn get_first(&self, key: &str) -> Option<&[u8]> {
        match self.key_deltas(key).next() {
            Some(first) => first.before(),
            None => self.get_last(key),
        }
    }

    /// Value after every write of this block with an ordinal up to `ordinal`.
    pub fn get_at(&self, ordinal: u64, key: &str) -> Option<&[u8]> {
        let mut seen: Option<&Delta> = None;
        for delta in self.key_deltas(key) {
            if delta.ordinal > ordinal {
                return match seen {
                    Some(last) => last.after(),
                    None => delta.before(),
                };
            }
            seen = Some(delta);
        }
        self.get_last(key)
    }

    pub fn has_last(&self, key: &str) -> bool {
        self.get_last(key).is_some()
    }

    pub fn has_first(&self, key: &str) -> bool {
        self.get_first(key).is_some()
    }

    pub fn has_at(&self, ordinal: u64, key: &str) -> bool {
        self.get_at(ordinal, key).is_some()
    }

    fn key_deltas<'a, 'k>(&'a self, key: &'k str) -> impl Iterator<Item = &'a Delta> + use<'a, 'k> {
        self.deltas
            .iter()
            .filter(move |d| !d.is_marker() && d.key == key)
    }

    // ── Mutations ──────────────────────────────────────────────────

    pub fn set(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.require("set", self.config.policy == UpdatePolicy::Set)?;
        self.check_ordinal(ordinal)?;
        self.put(ordinal, key, value.to_vec())
    }

    pub fn set_if_not_exists(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.require(
            "set_if_not_exists",
            self.config.policy == UpdatePolicy::SetIfNotExists,
        )?;
        self.check_ordinal(ordinal)?;
        if self.kv.contains_key(key) {
            return Ok(());
        }
        self.put(ordinal, key, value.to_vec())
    }

    pub fn append(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.require("append", self.config.policy == UpdatePolicy::Append)?;
        self.check_ordinal(ordinal)?;
        let mut combined = self.kv.get(key).cloned().unwrap_or_default();
        combined.extend_from_slice(value);
        self.check_append(key, combined.len())?;
        self.put(ordinal, key, combined)
    }

    /// Delete every key starting with `prefix`; the empty prefix clears the store.
    pub fn delete_prefix(&mut self, ordinal: u64, prefix: &str) -> StoreResult<()> {
        self.check_ordinal(ordinal)?;
        self.deltas.push(Delta {
            op: DeltaOp::DeletePrefix,
            ordinal,
            key: prefix.to_string(),
            old_value: Vec::new(),
            new_value: Vec::new(),
        });
        let doomed: Vec<String> = self
            .kv
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(old) = self.replace(&key, None) {
                self.deltas.push(Delta {
                    op: DeltaOp::Delete,
                    ordinal,
                    key,
                    old_value: old,
                    new_value: Vec::new(),
                });
            }
        }
        if self.is_partial() {
            self.delete_prefixes.insert(prefix.to_string());
        }
        trace!(store = %self.config.name, %prefix, "prefix deleted");
        Ok(())
    }

    pub fn add_int64(&mut self, ordinal: u64, key: &str, value: i64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Add, ValueType::Int64, Ok(Numeric::Int64(value)))
    }

    pub fn add_float64(&mut self, ordinal: u64, key: &str, value: f64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Add, ValueType::Float64, Numeric::float(value))
    }

    pub fn add_bigint(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Add, ValueType::BigInt, value)
    }

    pub fn add_bigdecimal(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Add, ValueType::BigDecimal, value)
    }

    pub fn set_min_int64(&mut self, ordinal: u64, key: &str, value: i64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Min, ValueType::Int64, Ok(Numeric::Int64(value)))
    }

    pub fn set_min_float64(&mut self, ordinal: u64, key: &str, value: f64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Min, ValueType::Float64, Numeric::float(value))
    }

    pub fn set_min_bigint(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Min, ValueType::BigInt, value)
    }

    pub fn set_min_bigdecimal(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Min, ValueType::BigDecimal, value)
    }

    pub fn set_max_int64(&mut self, ordinal: u64, key: &str, value: i64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Max, ValueType::Int64, Ok(Numeric::Int64(value)))
    }

    pub fn set_max_float64(&mut self, ordinal: u64, key: &str, value: f64) -> StoreResult<()> {
        self.numeric(ordinal, key, NumericOp::Max, ValueType::Float64, Numeric::float(value))
    }

    pub fn set_max_bigint(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Max, ValueType::BigInt, value)
    }

    pub fn set_max_bigdecimal(&mut self, ordinal: u64, key: &str, value: &[u8]) -> StoreResult<()> {
        self.numeric_bytes(ordinal, key, NumericOp::Max, ValueType::BigDecimal, value)
    }

    /// Undo a block: reverse-apply its deltas, newest first.
    pub fn revert(&mut self, deltas: &[Delta]) {
        // Markers carry no value; the per-key deletes that follow them do.
        for delta in deltas.iter().rev().filter(|d| !d.is_marker()) {
            self.replace(&delta.key, delta.before().map(<[u8]>::to_vec));
        }
        trace!(store = %self.config.name, deltas = deltas.len(), "deltas reverted");
    }

    fn numeric_bytes(
        &mut self,
        ordinal: u64,
        key: &str,
        op: NumericOp,
        expected: ValueType,
        value: &[u8],
    ) -> StoreResult<()> {
        let parsed = Numeric::parse(&expected, value);
        self.numeric(ordinal, key, op, expected, parsed)
    }

    fn numeric(
        &mut self,
        ordinal: u64,
        key: &str,
        op: NumericOp,
        expected: ValueType,
        value: Result<Numeric, NumericError>,
    ) -> StoreResult<()> {
        let (name, policy) = match op {
            NumericOp::Add => ("add", UpdatePolicy::Add),
            NumericOp::Min => ("set_min", UpdatePolicy::Min),
            NumericOp::Max => ("set_max", UpdatePolicy::Max),
        };
        self.require(
            name,
            self.config.policy == policy && self.config.value_type == expected,
        )?;
        self.check_ordinal(ordinal)?;
        let value = value.map_err(|e| self.numeric_error(key, e))?;
        let current = match self.kv.get(key) {
            Some(current) => Some(
                Numeric::parse(&expected, current).map_err(|e| self.numeric_error(key, e))?,
            ),
            None => None,
        };
        let result = match current {
            Some(current) => current
                .combine(value, op)
                .map_err(|e| self.numeric_error(key, e))?,
            None => value,
        };
        let encoded = result.encode(self.config.limits.decimal_scale);
        self.put(ordinal, key, encoded)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn require(&self, op: &'static str, allowed: bool) -> StoreResult<()> {
        if allowed {
            return Ok(());
        }
        Err(StoreError::UnsupportedOperation {
            store: self.config.name.clone(),
            op,
            policy: self.config.policy,
            value_type: self.config.value_type.clone(),
        })
    }

    fn check_ordinal(&mut self, ordinal: u64) -> StoreResult<()> {
        if let Some(last) = self.last_ordinal {
            if ordinal < last {
                return Err(StoreError::OrdinalRegression {
                    store: self.config.name.clone(),
                    ordinal,
                    last,
                });
            }
        }
        self.last_ordinal = Some(ordinal);
        Ok(())
    }

    fn check_append(&self, key: &str, size: usize) -> StoreResult<()> {
        let limit = self.config.limits.append_limit;
        if size as u64 > limit {
            return Err(StoreError::AppendTooBig {
                store: self.config.name.clone(),
                key: key.to_string(),
                size,
                limit,
            });
        }
        Ok(())
    }

    pub(crate) fn numeric_error(&self, key: &str, err: NumericError) -> StoreError {
        let store = self.config.name.clone();
        let key = key.to_string();
        match err {
            NumericError::Int64Overflow => StoreError::Int64Overflow { store, key },
            NumericError::NotANumber => StoreError::NotANumber { store, key },
            NumericError::Invalid(reason) => StoreError::InvalidValue {
                store,
                key,
                value_type: self.config.value_type.clone(),
                reason,
            },
            NumericError::Mismatch => StoreError::InvalidValue {
                store,
                key,
                value_type: self.config.value_type.clone(),
                reason: "operand type mismatch".to_string(),
            },
        }
    }

    /// Write `value` under `key` and log the delta.
    fn put(&mut self, ordinal: u64, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_size(key, &value)?;
        let new_value = value.clone();
        let delta = match self.replace(key, Some(value)) {
            Some(old) => Delta {
                op: DeltaOp::Update,
                ordinal,
                key: key.to_string(),
                old_value: old,
                new_value,
            },
            None => Delta {
                op: DeltaOp::Create,
                ordinal,
                key: key.to_string(),
                old_value: Vec::new(),
                new_value,
            },
        };
        self.deltas.push(delta);
        Ok(())
    }

    pub(crate) fn check_size(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let limits = &self.config.limits;
        if value.len() as u64 > limits.item_size_limit {
            return Err(StoreError::ItemTooBig {
                store: self.config.name.clone(),
                key: key.to_string(),
                size: value.len(),
                limit: limits.item_size_limit,
            });
        }
        let old = self.kv.get(key).map_or(0, |v| entry_size(key, v));
        let size = self.total_size - old + entry_size(key, value);
        if size > limits.total_size_limit {
            return Err(StoreError::TooBig {
                store: self.config.name.clone(),
                size,
                limit: limits.total_size_limit,
            });
        }
        Ok(())
    }

    /// Set or remove `key` without logging, keeping the size counter current.
    pub(crate) fn replace(&mut self, key: &str, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let old = match value {
            Some(value) => {
                self.total_size += entry_size(key, &value);
                self.kv.insert(key.to_string(), value)
            }
            None => self.kv.remove(key),
        };
        if let Some(old) = &old {
            self.total_size -= entry_size(key, old);
        }
        old
    }

    pub(crate) fn remove_prefix(&mut self, prefix: &str) {
        let doomed: Vec<String> = self
            .kv
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.replace(&key, None);
        }
    }

    pub(crate) fn insert_delete_prefix(&mut self, prefix: &str) {
        self.delete_prefixes.insert(prefix.to_string());
    }

    pub(crate) fn value_type(&self) -> &ValueType {
        &self.config.value_type
    }

    pub(crate) fn fold_numeric(
        &self,
        key: &str,
        current: Option<&[u8]>,
        incoming: &[u8],
        op: NumericOp,
    ) -> StoreResult<Vec<u8>> {
        fold_encoded(
            self.value_type(),
            current,
            incoming,
            op,
            self.config.limits.decimal_scale,
        )
        .map_err(|e| self.numeric_error(key, e))
    }

    pub(crate) fn check_append_size(&self, key: &str, size: usize) -> StoreResult<()> {
        self.check_append(key, size)
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

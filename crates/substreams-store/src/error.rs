//! Error types for the store engine.

use substreams_core::{UpdatePolicy, ValueType};
use substreams_storage::StorageError;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {store}: corrupt snapshot {path}: {reason}")]
    Corrupt {
        store: String,
        path: String,
        reason: String,
    },

    #[error("store {store}: incompatible snapshot: {reason}")]
    Incompatible { store: String, reason: String },

    #[error("store {store}: snapshot {path} is missing")]
    SegmentMissing { store: String, path: String },

    #[error("store {store}: value for key {key:?} would grow to {size} bytes, over the {limit} byte append limit")]
    AppendTooBig {
        store: String,
        key: String,
        size: usize,
        limit: u64,
    },

    #[error("store {store}: value for key {key:?} is {size} bytes, over the {limit} byte item limit")]
    ItemTooBig {
        store: String,
        key: String,
        size: usize,
        limit: u64,
    },

    #[error("store {store}: total size {size} bytes exceeds the {limit} byte limit")]
    TooBig { store: String, size: u64, limit: u64 },

    #[error("store {store}: ordinal {ordinal} is lower than the previous write's {last}")]
    OrdinalRegression {
        store: String,
        ordinal: u64,
        last: u64,
    },

    #[error("store {store}: operation {op} not allowed on a {policy} store of {value_type}")]
    UnsupportedOperation {
        store: String,
        op: &'static str,
        policy: UpdatePolicy,
        value_type: ValueType,
    },

    #[error("store {store}: invalid {value_type} value for key {key:?}: {reason}")]
    InvalidValue {
        store: String,
        key: String,
        value_type: ValueType,
        reason: String,
    },

    #[error("store {store}: int64 overflow on key {key:?}")]
    Int64Overflow { store: String, key: String },

    #[error("store {store}: NaN written to key {key:?}")]
    NotANumber { store: String, key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StoreError {
    /// Errors caused by what a module wrote, as opposed to what was on disk.
    pub fn is_write_error(&self) -> bool {
        matches!(
            self,
            StoreError::AppendTooBig { .. }
                | StoreError::ItemTooBig { .. }
                | StoreError::TooBig { .. }
                | StoreError::OrdinalRegression { .. }
                | StoreError::UnsupportedOperation { .. }
                | StoreError::InvalidValue { .. }
                | StoreError::Int64Overflow { .. }
                | StoreError::NotANumber { .. }
        )
    }
}

//! The object store interface shared by every backend.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{StorageError, StorageResult};

/// Flat key → bytes storage addressed by `/`-separated paths.
///
/// Writes are atomic: a reader sees either the previous object or the whole
/// new one. `list` returns full paths in ascending order.
pub trait ObjectStore: Send + Sync + Debug {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    fn exists(&self, path: &str) -> StorageResult<bool>;

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Returns true if the object existed.
    fn delete(&self, path: &str) -> StorageResult<bool>;
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// Reject paths that could escape the store root.
pub(crate) fn check_path(path: &str) -> StorageResult<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

//! substreams-storage — object storage for module state and outputs.
//!
//! ```text
//! ObjectStoreUrl ──▶ open_store() ──▶ RetryingStore ──▶ LocalStore  (file://, bare path)
//!                                                   └──▶ RedbStore  (redb://, memory://)
//! ```
//!
//! `paths` fixes how snapshots, output segments and index segments are named
//! under a module hash.

pub mod error;
pub mod local;
pub mod paths;
pub mod redb;
pub mod retry;
pub mod store;
pub mod url;

use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use local::LocalStore;
pub use paths::{SnapshotFile, SnapshotKind};
pub use redb::RedbStore;
pub use retry::{RetryPolicy, RetryingStore};
pub use store::{ObjectStore, SharedStore};
pub use url::ObjectStoreUrl;

/// Open the store named by `url`, wrapped in the default retry policy.
pub fn open_store(url: &str) -> StorageResult<SharedStore> {
    let policy = RetryPolicy::default();
    let store: SharedStore = match ObjectStoreUrl::parse(url)? {
        ObjectStoreUrl::File { root } => Arc::new(RetryingStore::new(LocalStore::open(&root)?, policy)),
        ObjectStoreUrl::Redb { path } => Arc::new(RetryingStore::new(RedbStore::open(&path)?, policy)),
        ObjectStoreUrl::Memory => Arc::new(RetryingStore::new(RedbStore::open_in_memory()?, policy)),
    };
    tracing::info!(%url, "object store ready");
    Ok(store)
}

/// Ephemeral store for tests and dry runs.
pub fn memory_store() -> StorageResult<SharedStore> {
    Ok(Arc::new(RedbStore::open_in_memory()?))
}

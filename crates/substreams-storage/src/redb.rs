//! RedbStore — every object as a row of a single redb table.
//!
//! Suits single-host deployments that prefer one database file over a
//! directory tree, and backs `memory://` with redb's in-memory backend.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectStore, check_path};

/// Objects keyed by path.
const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Convert any `Display` error into a `StorageError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StorageError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "redb object store opened");
        Ok(store)
    }

    /// Ephemeral store, gone when the last clone drops.
    pub fn open_in_memory() -> StorageResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory object store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl ObjectStore for RedbStore {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        check_path(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            table.insert(path, data).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, bytes = data.len(), "object written");
        Ok(())
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        check_path(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        match table.get(path).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn exists(&self, path: &str) -> StorageResult<bool> {
        check_path(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        Ok(table.get(path).map_err(map_err!(Read))?.is_some())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key.to_string());
        }
        Ok(out)
    }

    fn delete(&self, path: &str) -> StorageResult<bool> {
        check_path(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            existed = table.remove(path).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, existed, "object deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_crud() {
        let store = RedbStore::open_in_memory().unwrap();
        store.write("h/states/a.kv", b"one").unwrap();
        assert_eq!(store.read("h/states/a.kv").unwrap(), b"one");
        assert!(store.exists("h/states/a.kv").unwrap());
        assert!(store.delete("h/states/a.kv").unwrap());
        assert!(!store.delete("h/states/a.kv").unwrap());
        assert!(store.read("h/states/a.kv").unwrap_err().is_not_found());
    }

    #[test]
    fn list_stops_at_prefix_end() {
        let store = RedbStore::open_in_memory().unwrap();
        for path in ["a/x", "h/states/2", "h/states/1", "h/statez", "i/states/1"] {
            store.write(path, b"").unwrap();
        }
        assert_eq!(
            store.list("h/states/").unwrap(),
            vec!["h/states/1", "h/states/2"]
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objects.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.write("h/o", b"kept").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.read("h/o").unwrap(), b"kept");
    }
}

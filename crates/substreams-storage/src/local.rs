//! LocalStore — objects as files under a root directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectStore, check_path};

const TEMP_MARKER: &str = ".tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| StorageError::Open(format!("{}: {e}", root.display())))?;
        debug!(root = %root.display(), "local object store opened");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> StorageResult<PathBuf> {
        check_path(path)?;
        Ok(self.root.join(path))
    }
}

impl ObjectStore for LocalStore {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.full_path(path)?;
        let io_err = |e| StorageError::from_io(path, e);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Write beside the target, then rename over it.
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(format!("{TEMP_MARKER}{}-{seq}", std::process::id()));
        let temp = PathBuf::from(temp_name);

        let result = (|| {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&temp, &target)
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp);
            return Err(io_err(e));
        }
        debug!(%path, bytes = data.len(), "object written");
        Ok(())
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.full_path(path)?;
        std::fs::read(&target).map_err(|e| StorageError::from_io(path, e))
    }

    fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.full_path(path)?.is_file())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // Walk from the deepest directory the prefix fully names.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) && !key.contains(TEMP_MARKER) {
                out.push(key);
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> StorageResult<bool> {
        let target = self.full_path(path)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(path, e)),
        }
    }
}

//! Object store URL resolution.

use std::path::PathBuf;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreUrl {
    /// Local directory: file:///var/substreams or /var/substreams
    File { root: PathBuf },
    /// Single redb database file: redb:///var/substreams/state.redb
    Redb { path: PathBuf },
    /// Ephemeral redb database: memory://
    Memory,
}

impl ObjectStoreUrl {
    pub fn parse(url: &str) -> StorageResult<Self> {
        if let Some(rest) = url.strip_prefix("file://") {
            non_empty(url, rest).map(|root| ObjectStoreUrl::File { root })
        } else if let Some(rest) = url.strip_prefix("redb://") {
            non_empty(url, rest).map(|path| ObjectStoreUrl::Redb { path })
        } else if url.starts_with("memory://") {
            Ok(ObjectStoreUrl::Memory)
        } else if url.starts_with("./") || url.starts_with('/') || url.starts_with("../") {
            Ok(ObjectStoreUrl::File {
                root: PathBuf::from(url),
            })
        } else {
            Err(StorageError::InvalidUrl(url.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ObjectStoreUrl::File { .. } => "file",
            ObjectStoreUrl::Redb { .. } => "redb",
            ObjectStoreUrl::Memory => "memory",
        }
    }
}

fn non_empty(url: &str, rest: &str) -> StorageResult<PathBuf> {
    if rest.is_empty() {
        return Err(StorageError::InvalidUrl(url.to_string()));
    }
    Ok(PathBuf::from(rest))
}

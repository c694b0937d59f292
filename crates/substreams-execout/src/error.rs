//! Error types for the exec-output cache.

use substreams_storage::StorageError;
use thiserror::Error;

pub type ExecOutResult<T> = Result<T, ExecOutError>;

#[derive(Debug, Error)]
pub enum ExecOutError {
    #[error("corrupt output segment {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("module {0} is not registered with the output cache")]
    UnknownModule(String),

    #[error("output for block {block} of {module} arrived after block {last}")]
    OutOfOrder { module: String, block: u64, last: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

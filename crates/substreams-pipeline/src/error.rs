//! Error types for request processing.

use substreams_core::{CursorError, PackageError, SourceError};
use substreams_execout::ExecOutError;
use substreams_graph::GraphError;
use substreams_host::GuestError;
use substreams_storage::StorageError;
use substreams_store::StoreError;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A module call failed. `logs` holds the tail of what the module printed.
    #[error("{source}")]
    Guest {
        module: String,
        #[source]
        source: GuestError,
        logs: Vec<String>,
        logs_truncated: bool,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ExecOut(#[from] ExecOutError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    InvalidCursor(#[from] CursorError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no recent final block is known and the request has no stop block")]
    NoRecentFinal,

    #[error("block {block} was undone after block {final_block} became final")]
    UndoPastFinal { block: u64, final_block: u64 },

    #[error("request canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request or package; fixing the input fixes the error.
    User,
    Guest,
    Storage,
    Upstream,
    Runtime,
}

impl PipelineError {
    /// Wrap a guest failure without logs.
    pub fn guest(module: impl Into<String>, source: GuestError) -> Self {
        if matches!(source, GuestError::Canceled) {
            return PipelineError::Canceled;
        }
        PipelineError::Guest {
            module: module.into(),
            source,
            logs: Vec::new(),
            logs_truncated: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Guest { .. } => ErrorKind::Guest,
            PipelineError::Store(e) if e.is_write_error() => ErrorKind::Guest,
            PipelineError::Store(_) | PipelineError::ExecOut(_) | PipelineError::Storage(_) => {
                ErrorKind::Storage
            }
            PipelineError::Graph(_)
            | PipelineError::Package(_)
            | PipelineError::InvalidCursor(_)
            | PipelineError::InvalidRequest(_)
            | PipelineError::NoRecentFinal => ErrorKind::User,
            PipelineError::Source(_) | PipelineError::UndoPastFinal { .. } => ErrorKind::Upstream,
            PipelineError::Canceled | PipelineError::Internal(_) => ErrorKind::Runtime,
        }
    }

    /// Module the error is attributed to, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            PipelineError::Guest { module, .. } => Some(module),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::InvalidCursor(_) | PipelineError::InvalidRequest(_) => 2,
            PipelineError::Package(_) | PipelineError::Graph(_) => 3,
            PipelineError::Source(_) | PipelineError::UndoPastFinal { .. } | PipelineError::NoRecentFinal => 4,
            PipelineError::Guest { .. } => 5,
            PipelineError::Store(e) if e.is_write_error() => 5,
            _ => 1,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, PipelineError::Canceled)
    }
}

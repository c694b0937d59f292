//! Error types for guest execution.

use substreams_store::StoreError;
use thiserror::Error;

pub type GuestResult<T> = Result<T, GuestError>;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("module {module} panicked at {file}:{line}:{column}: {message}")]
    Panic {
        module: String,
        message: String,
        file: String,
        line: u32,
        column: u32,
    },

    #[error("module {module} ran out of fuel")]
    OutOfFuel { module: String },

    #[error("module {module} exceeded its execution deadline")]
    Timeout { module: String },

    #[error("module {module} broke the host contract: {reason}")]
    ContractViolation { module: String, reason: String },

    #[error("module {module}: {source}")]
    Store {
        module: String,
        #[source]
        source: StoreError,
    },

    #[error("module {module}: extension {namespace}::{name} failed: {reason}")]
    Extension {
        module: String,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("module {module} trapped: {reason}")]
    Trap { module: String, reason: String },

    #[error("module {module} does not export {export}")]
    MissingExport { module: String, export: String },

    #[error("failed to compile {module}: {reason}")]
    Compile { module: String, reason: String },

    #[error("failed to instantiate {module}: {reason}")]
    Instantiate { module: String, reason: String },

    #[error("unknown VM backend {0:?}")]
    UnknownBackend(String),

    #[error("VM backend error: {0}")]
    Backend(String),

    #[error("request canceled")]
    Canceled,
}

impl GuestError {
    /// Module the error is attributed to, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            GuestError::Panic { module, .. }
            | GuestError::OutOfFuel { module }
            | GuestError::Timeout { module }
            | GuestError::ContractViolation { module, .. }
            | GuestError::Store { module, .. }
            | GuestError::Extension { module, .. }
            | GuestError::Trap { module, .. }
            | GuestError::MissingExport { module, .. }
            | GuestError::Compile { module, .. }
            | GuestError::Instantiate { module, .. } => Some(module),
            GuestError::UnknownBackend(_) | GuestError::Backend(_) | GuestError::Canceled => None,
        }
    }
}

/// A failed call, with the guest logs captured up to the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CallError {
    #[source]
    pub error: GuestError,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

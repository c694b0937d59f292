//! Orchestrator error types.

use substreams_graph::GraphError;
use substreams_pipeline::PipelineError;
use substreams_storage::StorageError;
use substreams_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A worker's pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("squashing store {store}: {source}")]
    Squash {
        store: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("no squasher for store {0}")]
    UnknownStore(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    /// Jobs remain but none can become ready.
    #[error("backfill stalled with {pending} jobs pending")]
    Stalled { pending: usize },

    #[error("backfill canceled")]
    Canceled,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<OrchestratorError> for PipelineError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Pipeline(e) => e,
            OrchestratorError::Squash { source, .. } | OrchestratorError::Store(source) => {
                PipelineError::Store(source)
            }
            OrchestratorError::Storage(e) => PipelineError::Storage(e),
            OrchestratorError::Graph(e) => PipelineError::Graph(e),
            OrchestratorError::Canceled => PipelineError::Canceled,
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_pass_through() {
        let err: PipelineError = OrchestratorError::Pipeline(PipelineError::NoRecentFinal).into();
        assert!(matches!(err, PipelineError::NoRecentFinal));
        let err: PipelineError = OrchestratorError::Canceled.into();
        assert!(err.is_canceled());
        let err: PipelineError = OrchestratorError::Stalled { pending: 2 }.into();
        assert!(matches!(err, PipelineError::Internal(_)));
    }
}

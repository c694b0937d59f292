//! Module graph errors.

use thiserror::Error;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cyclic dependency between modules {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("module {module:?} depends on unknown module {dependency:?}")]
    UnknownModule { module: String, dependency: String },

    #[error("duplicate module {0:?}")]
    DuplicateModule(String),

    #[error("module {0:?} not found")]
    ModuleNotFound(String),

    #[error("module {module:?} references missing binary {index}")]
    MissingBinary { module: String, index: usize },
}

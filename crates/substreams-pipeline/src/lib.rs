//! substreams-pipeline — runs a request's modules over a block stream.
//!
//! [`ModuleExecutor`] calls one module for one block. [`Pipeline`] drives
//! all modules of a request block by block, keeps stores and the output
//! cache in step with forks and finality, and emits [`Response`]s. The
//! [`resolver`] turns a request into its effective start and handoff.

pub mod error;
pub mod executor;
pub mod fork;
pub mod index;
pub mod modules;
pub mod pipeline;
pub mod resolver;
pub mod response;
pub mod stores;

pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use executor::{BlockOutputs, Execution, ModuleExecutor, ModuleStats};
pub use index::IndexWriter;
pub use modules::RequestModules;
pub use pipeline::{
    BlockHook, BlockState, Pipeline, PipelineContext, PipelineOptions, StopReason, Termination, Tier,
};
pub use resolver::{Mode, linear_handoff, live_start, resolve_start_block, validate_range};
pub use response::{
    BlockScopedData, MapOutput, ModuleFailure, ModuleProgress, Response, ResponseRx, ResponseTx,
    StageProgress, StoreDeltasOutput, UndoSignal,
};
pub use stores::{BoundaryTracker, StoreRole, StoreSet, WrittenSnapshot};

//! Messages streamed back to the requester.

use std::time::Duration;

use substreams_core::{BlockRange, BlockRef, Clock};
use substreams_store::Delta;
use tokio::sync::mpsc;

use crate::error::{PipelineError, PipelineResult};

/// Output of one map or index module for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutput {
    pub name: String,
    pub payload: Vec<u8>,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

/// Deltas a requested store module produced in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDeltasOutput {
    pub name: String,
    pub deltas: Vec<Delta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScopedData {
    pub clock: Clock,
    pub cursor: String,
    pub final_block_height: u64,
    pub outputs: Vec<MapOutput>,
    pub debug_store_deltas: Vec<StoreDeltasOutput>,
}

/// A previously emitted block was reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoSignal {
    /// The reverted block.
    pub block: BlockRef,
    /// Parent of the reverted block; the chain is valid up to here.
    pub last_valid_block: BlockRef,
    pub cursor: String,
    /// Payloads emitted for the reverted block.
    pub outputs: Vec<MapOutput>,
}

/// Counters of one module, as last reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleProgress {
    pub name: String,
    pub processed_ranges: Vec<BlockRange>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageProgress {
    pub modules: Vec<String>,
    pub completed_ranges: Vec<BlockRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: String,
    pub reason: String,
    /// Most recent guest logs, capped by the host log limit.
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// First message of a request.
    Session {
        trace_id: String,
        resolved_start_block: u64,
        linear_handoff_block: u64,
        max_parallel_workers: usize,
    },
    Progress {
        modules: Vec<ModuleProgress>,
        stages: Vec<StageProgress>,
    },
    BlockScopedData(BlockScopedData),
    Undo(UndoSignal),
    ModuleFailed(ModuleFailure),
    /// Last message of a backfill pipeline.
    Completed { all_processed_ranges: Vec<BlockRange> },
}

impl Response {
    pub fn as_data(&self) -> Option<&BlockScopedData> {
        match self {
            Response::BlockScopedData(data) => Some(data),
            _ => None,
        }
    }
}

pub type ResponseTx = mpsc::UnboundedSender<Response>;
pub type ResponseRx = mpsc::UnboundedReceiver<Response>;

pub fn channel() -> (ResponseTx, ResponseRx) {
    mpsc::unbounded_channel()
}

/// Send `response`; a dropped receiver means the client went away.
pub fn send(tx: &ResponseTx, response: Response) -> PipelineResult<()> {
    tx.send(response).map_err(|_| PipelineError::Canceled)
}

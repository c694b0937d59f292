//! substreams-orchestrator — parallel backfill up to the linear handoff.
//!
//! ```text
//! storage state ──▶ WorkPlan ──▶ jobs (stage, range)
//!                                   │  bounded worker pool
//!                                   ▼
//!                       backfill Pipeline per job ──▶ partial snapshots
//!                                   │
//!                                   ▼
//!                     squasher task ──▶ full snapshots through the handoff
//! ```

pub mod error;
pub mod plan;
pub mod progress;
pub mod scheduler;
pub mod squasher;
pub mod worker;

pub use error::{OrchestratorError, OrchestratorResult};
pub use plan::{Job, OutputState, PlanRequest, StorageState, StoreState, WorkPlan, split_size};
pub use progress::{ModuleCounters, ProgressHook, ProgressTracker, merge_ranges};
pub use scheduler::{BackfillReport, BackfillRequest, Orchestrator, OrchestratorConfig};
pub use squasher::SquashInput;

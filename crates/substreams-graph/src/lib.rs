//! substreams-graph — the module DAG and module content hashes.
//!
//! ```text
//! ValidatedPackage
//!   └── ModuleGraph (topological order, ancestors, stages)
//!         └── ModuleHashes (20-byte content hash per module)
//! ```

pub mod error;
pub mod graph;
pub mod hash;

pub use error::{GraphError, GraphResult};
pub use graph::ModuleGraph;
pub use hash::{ModuleHash, ModuleHashes};

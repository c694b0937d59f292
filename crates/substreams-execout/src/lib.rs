//! substreams-execout — the exec-output cache.
//!
//! Map module outputs are kept per block in range-aligned segments under
//! `<hash>/outputs/`, so later requests skip re-executing them. Outputs of
//! reversible blocks wait in memory until finality.

pub mod cache;
pub mod error;
pub mod reversible;
pub mod segment;

pub use cache::ExecOutCache;
pub use error::{ExecOutError, ExecOutResult};
pub use reversible::ReversibleOutputs;
pub use segment::{OutputEntry, Segment};

//! substreams-store — the store engine.
//!
//! ```text
//!   guest writes ──▶ KvStore ──▶ deltas (per block) ──▶ store(deltas) readers
//!                       │
//!                       ├── save(boundary) ──▶ PendingSnapshot ──▶ <hash>/states/*.kv
//!                       │
//!   partials ──▶ StoreSquasher ──merge──▶ full snapshot
//! ```
//!
//! - **KvStore**: sorted KV state under one update policy, with an ordered
//!   delta log for the current block and first/last/at readers
//! - **Snapshots**: checksummed binary files, full or partial
//! - **Squashing**: policy-aware, associative merge of abutting partials

pub mod config;
pub mod delta;
pub mod error;
pub mod kv;
pub mod merge;
pub mod snapshot;
pub mod squash;
pub mod state;
pub mod value;

pub use config::{StoreConfig, StoreLimits};
pub use delta::{Delta, DeltaOp};
pub use error::{StoreError, StoreResult};
pub use kv::KvStore;
pub use merge::squash;
pub use snapshot::PendingSnapshot;
pub use squash::StoreSquasher;
pub use state::{SnapshotListing, load_full_at};

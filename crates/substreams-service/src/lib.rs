//! substreams-service — serves streaming requests.
//!
//! A request is resolved to its start block and linear handoff, backfilled
//! in parallel up to the handoff, then streamed live. In production mode
//! the already-final part of the range is served from the exec-output cache.

pub mod replay;
pub mod request;
pub mod service;

pub use replay::replay_cached;
pub use request::{Request, RequestSummary};
pub use service::Service;

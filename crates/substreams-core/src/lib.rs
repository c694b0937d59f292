//! substreams-core — shared types for the Substreams engine.
//!
//! - **Package model**: wire messages (`pb`), the typed module model
//!   (`module`) and package validation (`package`)
//! - **Blocks**: clocks, steps, ranges, cursors and the block source interface
//! - **Configuration**: `EngineConfig`, layered from TOML and `SF_*` variables

pub mod block;
pub mod config;
pub mod cursor;
pub mod error;
pub mod module;
pub mod package;
pub mod pb;
pub mod source;

pub use block::{Block, BlockRange, BlockRef, Clock, Step};
pub use config::EngineConfig;
pub use cursor::Cursor;
pub use error::{ConfigError, CursorError, PackageError, PackageResult, SourceError};
pub use module::{InputSpec, ModuleDef, ModuleKind, StoreMode, UpdatePolicy, ValueType};
pub use package::ValidatedPackage;
pub use source::{BlockEvent, BlockSource, BlockSourceFactory, MemoryBlockSource};

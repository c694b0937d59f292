//! Error types for package loading, cursors, configuration and block sources.

use thiserror::Error;

pub type PackageResult<T> = Result<T, PackageError>;

/// User errors detected while decoding or validating a package.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package too large: {0}")]
    PackageTooLarge(String),

    #[error("invalid module name {0:?}")]
    ModuleNameInvalid(String),

    #[error("module {module:?}: update policy {policy} does not accept value type {value_type}")]
    PolicyValueTypeMismatch {
        module: String,
        policy: String,
        value_type: String,
    },

    #[error("unsupported binary type {0:?}")]
    UnsupportedBinaryType(String),

    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),

    #[error("failed to decode package: {0}")]
    Decode(String),

    #[error("failed to read package: {0}")]
    Io(#[from] std::io::Error),
}

/// A cursor could not be decoded.
#[derive(Debug, Error)]
#[error("invalid cursor: {0}")]
pub struct CursorError(pub String);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Errors raised by block sources. Always upstream errors from the engine's view.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("block source I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed block at line {line}: {reason}")]
    Decode { line: usize, reason: String },

    #[error("block source error: {0}")]
    Upstream(String),
}

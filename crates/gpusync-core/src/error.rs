use gpusync_cmd::{DecodeError, EncodeError};

use crate::types::EngineId;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced to callers of enqueue/wait operations.
///
/// Only [`SyncError::ResourceExhausted`] and [`SyncError::DeviceHang`] are runtime conditions a
/// caller is expected to recover from. The remaining variants report misuse of the API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("device hang detected while waiting")]
    DeviceHang,

    #[error("a handle in the wait list was aborted")]
    WaitListAborted,

    #[error("invalid status transition: {0}")]
    InvalidStatus(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("profiling information is not available")]
    ProfilingUnavailable,

    #[error("engine {engine:?} backend failure: {source}")]
    Backend {
        engine: EngineId,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, SyncError::ResourceExhausted(_))
    }
}

/// Failures reported by an [`crate::backend::EngineBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("ring full: {needed} bytes requested, {available} available")]
    RingFull { needed: usize, available: usize },

    #[error("malformed command stream: {0}")]
    Decode(#[from] DecodeError),

    #[error("engine is lost")]
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("{0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

use std::time::Duration;

use hive_types::HiveError;

use crate::codec::RemoteErrorKind;

/// Crate-local error type for `hive-net` operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("remote error ({kind:?}): {message}")]
    Remote { kind: RemoteErrorKind, message: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Tensor(#[from] HiveError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;

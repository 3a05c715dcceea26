use std::time::Duration;

use hive_net::{NetError, RemoteErrorKind};
use hive_types::{HiveError, PeerId};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no peers available for block {block}")]
    NoPeersAvailable { block: u32 },

    #[error("hop to {peer} failed: {reason}")]
    HopUnreachable { peer: PeerId, reason: String },

    #[error("hop to {peer} timed out after {timeout:?}")]
    HopTimeout { peer: PeerId, timeout: Duration },

    #[error("chain execution failed after {attempts} attempts: {last_error}")]
    ChainExecutionFailed { attempts: u32, last_error: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("sequence manager has been shut down")]
    ManagerShutDown,

    #[error("registry error: {0}")]
    Registry(String),
}

impl RoutingError {
    /// Hop failures that a re-plan may get around.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HopUnreachable { .. } | Self::HopTimeout { .. })
    }

    /// Map a transport-level failure of a call to `peer`.
    pub fn from_hop(peer: &PeerId, err: NetError) -> Self {
        match err {
            NetError::Timeout(timeout) => Self::HopTimeout { peer: peer.clone(), timeout },
            NetError::Remote { kind: RemoteErrorKind::SchemaMismatch, message } => {
                Self::SchemaMismatch(format!("{peer}: {message}"))
            }
            NetError::Remote { kind: RemoteErrorKind::InvalidRequest, message } => {
                Self::InvalidRequest(format!("{peer}: {message}"))
            }
            NetError::Registry(msg) => Self::Registry(msg),
            other => Self::HopUnreachable { peer: peer.clone(), reason: other.to_string() },
        }
    }
}

impl From<HiveError> for RoutingError {
    fn from(e: HiveError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let peer = PeerId::from("a");
        let e = RoutingError::from_hop(&peer, NetError::Unreachable("down".into()));
        assert!(e.is_retryable());

        let e = RoutingError::from_hop(
            &peer,
            NetError::Remote { kind: RemoteErrorKind::SchemaMismatch, message: "bad".into() },
        );
        assert!(matches!(e, RoutingError::SchemaMismatch(_)));
        assert!(!e.is_retryable());

        let e = RoutingError::from_hop(
            &peer,
            NetError::Remote { kind: RemoteErrorKind::SessionState, message: "lost".into() },
        );
        assert!(e.is_retryable());
        assert!(!RoutingError::NoPeersAvailable { block: 3 }.is_retryable());
    }

    #[test]
    fn timeouts_keep_their_duration() {
        let peer = PeerId::from("a");
        let e = RoutingError::from_hop(&peer, NetError::Timeout(Duration::from_millis(250)));
        assert!(e.is_retryable());
        match e {
            RoutingError::HopTimeout { timeout, .. } => assert_eq!(timeout, Duration::from_millis(250)),
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Transport seam between the routing layer and serving peers.
//!
//! [`BlockTransport`] is what the client side calls; [`RequestHandler`] is
//! what a serving peer implements. [`LoopbackTransport`] connects the two
//! inside one process and can inject faults per peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use hive_types::PeerId;

use crate::codec::{BlockRequest, BlockResponse};
use crate::error::{NetError, Result};

/// Sends one block-RPC request to a peer and waits for its reply.
///
/// Implementations do not bound the call in time; callers wrap it in
/// `tokio::time::timeout`.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    async fn call(&self, peer: &PeerId, request: BlockRequest) -> Result<BlockResponse>;
}

/// Server side of the block-RPC protocol.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: BlockRequest) -> BlockResponse;
}

// ── Fault injection ───────────────────────────────────────────────────────────

/// Misbehaviour injected into calls to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails with [`NetError::Unreachable`].
    Offline,
    /// Every call stays pending forever.
    Hang,
    /// The next `n` calls fail with [`NetError::Unreachable`], then the peer
    /// recovers.
    FailNext(u32),
}

/// One call as seen by the loopback transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub peer: PeerId,
    pub kind: &'static str,
}

#[derive(Default)]
struct LoopbackState {
    handlers: HashMap<PeerId, Arc<dyn RequestHandler>>,
    faults: HashMap<PeerId, Fault>,
    log: Vec<CallRecord>,
}

// ── LoopbackTransport ─────────────────────────────────────────────────────────

/// In-process transport dispatching to registered [`RequestHandler`]s.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, peer: impl Into<PeerId>, handler: Arc<dyn RequestHandler>) {
        self.state().handlers.insert(peer.into(), handler);
    }

    pub fn inject(&self, peer: impl Into<PeerId>, fault: Fault) {
        self.state().faults.insert(peer.into(), fault);
    }

    pub fn heal(&self, peer: &PeerId) {
        self.state().faults.remove(peer);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().log.clone()
    }

    /// Calls of `kind` addressed to `peer`.
    pub fn call_count(&self, peer: &PeerId, kind: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|c| &c.peer == peer && c.kind == kind)
            .count()
    }
}

#[async_trait]
impl BlockTransport for LoopbackTransport {
    async fn call(&self, peer: &PeerId, request: BlockRequest) -> Result<BlockResponse> {
        let kind = request.kind();
        let (handler, fault) = {
            let mut state = self.state();
            state.log.push(CallRecord { peer: peer.clone(), kind });

            let fault = match state.faults.get_mut(peer) {
                Some(Fault::FailNext(n)) if *n > 0 => {
                    *n -= 1;
                    Some(Fault::FailNext(*n + 1))
                }
                Some(Fault::FailNext(_)) => None,
                Some(f) => Some(*f),
                None => None,
            };
            (state.handlers.get(peer).cloned(), fault)
        };

        match fault {
            Some(Fault::Offline) | Some(Fault::FailNext(_)) => {
                debug!(peer = %peer, kind, "injected failure");
                return Err(NetError::Unreachable(format!("{peer} is offline")));
            }
            Some(Fault::Hang) => {
                debug!(peer = %peer, kind, "injected hang");
                return futures::future::pending().await;
            }
            None => {}
        }

        let handler = handler
            .ok_or_else(|| NetError::Unreachable(format!("no route to {peer}")))?;
        debug!(peer = %peer, kind, "dispatching block call");
        Ok(handler.handle(request).await)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RemoteErrorKind;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: BlockRequest) -> BlockResponse {
            match request {
                BlockRequest::CloseSession { .. } => BlockResponse::Closed,
                other => BlockResponse::error(RemoteErrorKind::Internal, other.kind()),
            }
        }
    }

    fn close() -> BlockRequest {
        BlockRequest::CloseSession { session_id: "s".into() }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let transport = LoopbackTransport::new();
        transport.register("a", Arc::new(Echo));
        let resp = transport.call(&PeerId::from("a"), close()).await.unwrap();
        assert!(matches!(resp, BlockResponse::Closed));
        assert_eq!(transport.call_count(&PeerId::from("a"), "close_session"), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let transport = LoopbackTransport::new();
        let err = transport.call(&PeerId::from("ghost"), close()).await.unwrap_err();
        assert!(matches!(err, NetError::Unreachable(_)));
    }

    #[tokio::test]
    async fn fail_next_recovers() {
        let transport = LoopbackTransport::new();
        let a = PeerId::from("a");
        transport.register(a.clone(), Arc::new(Echo));
        transport.inject(a.clone(), Fault::FailNext(2));

        assert!(transport.call(&a, close()).await.is_err());
        assert!(transport.call(&a, close()).await.is_err());
        assert!(transport.call(&a, close()).await.is_ok());
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn offline_until_healed() {
        let transport = LoopbackTransport::new();
        let a = PeerId::from("a");
        transport.register(a.clone(), Arc::new(Echo));
        transport.inject(a.clone(), Fault::Offline);
        assert!(transport.call(&a, close()).await.is_err());
        transport.heal(&a);
        assert!(transport.call(&a, close()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn hang_never_completes() {
        let transport = LoopbackTransport::new();
        let a = PeerId::from("a");
        transport.register(a.clone(), Arc::new(Echo));
        transport.inject(a.clone(), Fault::Hang);
        let res = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            transport.call(&a, close()),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let transport = LoopbackTransport::new();
        transport.register("a", Arc::new(Echo));
        let resp = transport
            .call(&PeerId::from("a"), BlockRequest::Info { uid: hive_types::BlockUid::new("m", 0) })
            .await
            .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, NetError::Remote { kind: RemoteErrorKind::Internal, .. }));
    }
}

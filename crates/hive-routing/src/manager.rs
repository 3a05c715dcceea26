//! Sequence manager: routing front door and owner of the background refresh.
//!
//! Lifecycle:
//! 1. `new` binds the manager to a block-uid list, a registry and a transport.
//! 2. `start` spawns the refresh task, which re-reads the registry every
//!    `update_period` or sooner when `request_update` is called.
//! 3. `shutdown` stops the task and waits for it. Later `start` or routing
//!    calls fail with [`RoutingError::ManagerShutDown`].
//!
//! Routing works without the task: `make_sequence` refreshes on demand when
//! the directory has no usable peer for a block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{watch, Mutex, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_net::{BlockRequest, BlockResponse, BlockTransport, PeerRegistry};
use hive_types::{BlockRange, BlockUid, PeerId, Protocol, RequestMetadata, RoutingConfig, RpcInfo, TensorRole};

use crate::compression::CompressionPolicy;
use crate::directory::PeerDirectory;
use crate::error::{Result, RoutingError};
use crate::sequence::{self, FastestSelector, PeerSelector, RandomSelector, RoutingMode, Sequence};

// ── Shared state ──────────────────────────────────────────────────────────────

struct Inner {
    directory: PeerDirectory,
    transport: Arc<dyn BlockTransport>,
    policy: Arc<dyn CompressionPolicy>,
    config: RoutingConfig,
    random: RandomSelector,
    rpc_info: OnceCell<RpcInfo>,
    /// Flips to `true` after the first successful refresh.
    ready: watch::Sender<bool>,
    wake: Notify,
    shut_down: AtomicBool,
}

struct RefreshTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Clears the liveness flag when the refresh task ends, including on abort.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── SequenceManager ───────────────────────────────────────────────────────────

pub struct SequenceManager {
    inner: Arc<Inner>,
    refresh: Mutex<Option<RefreshTask>>,
    alive: Arc<AtomicBool>,
}

impl SequenceManager {
    pub fn new(
        uids: Vec<BlockUid>,
        registry: Arc<dyn PeerRegistry>,
        transport: Arc<dyn BlockTransport>,
        policy: Arc<dyn CompressionPolicy>,
        config: RoutingConfig,
    ) -> Result<Self> {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let directory = PeerDirectory::new(registry, uids, config.ban_timeout(), config.max_record_age())?;
        let (ready, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                directory,
                transport,
                policy,
                config,
                random: RandomSelector::new(rng),
                rpc_info: OnceCell::new(),
                ready,
                wake: Notify::new(),
                shut_down: AtomicBool::new(false),
            }),
            refresh: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Construct and start in one go.
    pub async fn spawn(
        uids: Vec<BlockUid>,
        registry: Arc<dyn PeerRegistry>,
        transport: Arc<dyn BlockTransport>,
        policy: Arc<dyn CompressionPolicy>,
        config: RoutingConfig,
    ) -> Result<Self> {
        let manager = Self::new(uids, registry, transport, policy, config)?;
        manager.start().await?;
        Ok(manager)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the background refresh task. Starting twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.refresh.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.alive.store(true, Ordering::SeqCst);
        let guard = AliveGuard(self.alive.clone());
        let handle = tokio::spawn(refresh_loop(self.inner.clone(), stop_rx, guard));
        *slot = Some(RefreshTask { stop_tx, handle });
        info!(
            blocks = self.num_blocks(),
            period = ?self.inner.config.update_period(),
            "sequence manager started"
        );
        Ok(())
    }

    /// Whether the refresh task is running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Wait for the first successful directory refresh.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            self.ensure_open()?;
            rx.changed().await.map_err(|_| RoutingError::ManagerShutDown)?;
        }
    }

    /// Stop the refresh task and wait for it to finish. Idempotent; may be
    /// called from any task.
    pub async fn shutdown(&self) {
        let first = !self.inner.shut_down.swap(true, Ordering::SeqCst);
        // Held while joining so a concurrent caller returns only once the
        // task is gone.
        let mut slot = self.refresh.lock().await;
        if let Some(task) = slot.take() {
            let _ = task.stop_tx.send(true);
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "refresh task ended abnormally");
                }
            }
        }
        self.inner.ready.send_modify(|_| {});
        if first {
            info!("sequence manager shut down");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(RoutingError::ManagerShutDown);
        }
        Ok(())
    }

    /// Wake the refresh task ahead of its period.
    pub fn request_update(&self) {
        self.inner.wake.notify_one();
    }

    // ── Routing ─────────────────────────────────────────────────────────

    pub fn config(&self) -> &RoutingConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.inner.directory
    }

    pub fn num_blocks(&self) -> u32 {
        self.inner.directory.num_blocks()
    }

    /// Uids of the blocks in `range`.
    pub fn uids(&self, range: BlockRange) -> Result<Vec<BlockUid>> {
        self.inner.directory.check_range(range)?;
        Ok(self.inner.directory.uids()[range.as_usize()].to_vec())
    }

    pub async fn make_sequence(&self, range: BlockRange, mode: RoutingMode) -> Result<Sequence> {
        match mode {
            RoutingMode::Fastest => self.make_sequence_with(range, &FastestSelector).await,
            RoutingMode::Random => self.make_sequence_with(range, &self.inner.random).await,
        }
    }

    /// Plan `range` with a custom selection strategy.
    pub async fn make_sequence_with(&self, range: BlockRange, selector: &dyn PeerSelector) -> Result<Sequence> {
        self.ensure_open()?;
        let directory = &self.inner.directory;
        directory.ensure(range).await?;
        let sequence = sequence::plan(range, |i| directory.lookup(i), selector)?;
        debug!(blocks = %range, route = %sequence, "sequence planned");
        Ok(sequence)
    }

    /// Declared schema of the served blocks, fetched once from a peer
    /// serving the first block.
    pub async fn rpc_info(&self) -> Result<RpcInfo> {
        self.ensure_open()?;
        let info = self
            .inner
            .rpc_info
            .get_or_try_init(|| self.fetch_rpc_info())
            .await?;
        Ok(info.clone())
    }

    async fn fetch_rpc_info(&self) -> Result<RpcInfo> {
        let first = BlockRange::new(0, 1)?;
        let directory = &self.inner.directory;
        directory.ensure(first).await?;
        let uid = self.uids(first)?.remove(0);

        let mut last_error = None;
        for peer in directory.lookup(0) {
            match self.call(&peer.peer_id, BlockRequest::Info { uid: uid.clone() }).await {
                Ok(BlockResponse::Info(info)) => {
                    debug!(peer = %peer.peer_id, "rpc info fetched");
                    return Ok(self.inner.policy.rpc_info(info));
                }
                Ok(other) => {
                    last_error = Some(RoutingError::HopUnreachable {
                        peer: peer.peer_id.clone(),
                        reason: format!("unexpected {} reply to info", other.kind()),
                    });
                }
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(RoutingError::NoPeersAvailable { block: 0 }))
    }

    /// Metadata for one call, built fresh each time.
    pub async fn get_request_metadata(
        &self,
        protocol: Protocol,
        session_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<RequestMetadata> {
        let info = self.rpc_info().await?;
        let policy = &self.inner.policy;
        Ok(RequestMetadata {
            protocol,
            input_compression: policy.select(protocol, TensorRole::Input, &info.inputs),
            output_compression: policy.select(protocol, TensorRole::Output, &info.outputs),
            schema: info.inputs,
            session_id: session_id.map(str::to_owned),
            step_id: step_id.map(str::to_owned),
        })
    }

    /// One remote call bounded by `request_timeout`. Failed hops ban the peer
    /// and wake the refresh task; successful ones lift any ban.
    pub(crate) async fn call(&self, peer: &PeerId, request: BlockRequest) -> Result<BlockResponse> {
        let kind = request.kind();
        let timeout = self.inner.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.inner.transport.call(peer, request)).await {
            Err(_) => Err(RoutingError::HopTimeout { peer: peer.clone(), timeout }),
            Ok(reply) => reply
                .and_then(BlockResponse::into_result)
                .map_err(|e| RoutingError::from_hop(peer, e)),
        };
        match &result {
            Ok(_) => self.inner.directory.mark_healthy(peer),
            Err(e) if e.is_retryable() => {
                warn!(peer = %peer, kind, error = %e, "hop failed");
                self.inner.directory.mark_stale(peer);
                self.request_update();
            }
            Err(e) => debug!(peer = %peer, kind, error = %e, "call rejected"),
        }
        result
    }
}

impl Drop for SequenceManager {
    fn drop(&mut self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(task) = self.refresh.get_mut().take() {
            let _ = task.stop_tx.send(true);
            task.handle.abort();
        }
    }
}

// ── Refresh loop ──────────────────────────────────────────────────────────────

async fn refresh_all(directory: &PeerDirectory) -> Result<()> {
    let range = directory.full_range()?;
    directory.refresh(range).await
}

async fn refresh_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>, _alive: AliveGuard) {
    loop {
        tokio::select! {
            res = refresh_all(&inner.directory) => match res {
                Ok(()) => {
                    inner.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
                }
                Err(e) => warn!(error = %e, "directory refresh failed"),
            },
            _ = stop_rx.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.update_period()) => {}
            _ = inner.wake.notified() => debug!("early directory refresh requested"),
            _ = stop_rx.changed() => break,
        }
    }
    debug!("refresh task stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! In-process swarms for tests: simulated peers behind a loopback transport,
//! announced through an in-memory registry.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hive_net::{AnnouncementRegistry, LoopbackTransport, ServerAnnouncement, SimulatedPeer};
use hive_types::{BlockRange, BlockUid, RoutingConfig, Tensor};

use crate::compression::{CompressionPolicy, DeclaredCompression};
use crate::manager::SequenceManager;

pub const HIDDEN: usize = 8;
pub const BLOCKS: u32 = 10;
pub const PREFIX: &str = "m";

pub struct Swarm {
    pub registry: Arc<AnnouncementRegistry>,
    pub transport: Arc<LoopbackTransport>,
    peers: HashMap<String, Arc<SimulatedPeer>>,
}

impl Swarm {
    /// `(id, start, end, throughput)` per peer.
    pub fn new(peers: &[(&str, u32, u32, f64)]) -> Self {
        let mut swarm = Self {
            registry: Arc::new(AnnouncementRegistry::new(PREFIX)),
            transport: Arc::new(LoopbackTransport::new()),
            peers: HashMap::new(),
        };
        for &(id, start, end, tp) in peers {
            swarm.add(id, BlockRange { start, end }, tp, HIDDEN);
        }
        swarm
    }

    pub fn add(&mut self, id: &str, blocks: BlockRange, throughput: f64, hidden: usize) {
        let peer = Arc::new(SimulatedPeer::new(id, PREFIX, blocks, hidden));
        self.registry.announce(ServerAnnouncement::new(id, PREFIX, blocks, Some(throughput)));
        self.transport.register(id, peer.clone());
        self.peers.insert(id.to_owned(), peer);
    }

    pub fn peer(&self, id: &str) -> &SimulatedPeer {
        &self.peers[id]
    }

    pub fn manager(&self, config: RoutingConfig) -> Arc<SequenceManager> {
        self.manager_with(config, Arc::new(DeclaredCompression))
    }

    pub fn manager_with(&self, config: RoutingConfig, policy: Arc<dyn CompressionPolicy>) -> Arc<SequenceManager> {
        Arc::new(SequenceManager::new(
            BlockUid::sequence(PREFIX, BLOCKS),
            self.registry.clone(),
            self.transport.clone(),
            policy,
            config,
        )
        .unwrap())
    }
}

/// Short backoffs so retry tests stay quick under a paused clock too.
pub fn fast_retries() -> RoutingConfig {
    RoutingConfig {
        min_backoff_ms: 1,
        max_backoff_ms: 4,
        request_timeout_ms: 1_000,
        ..RoutingConfig::default()
    }
}

pub fn random(shape: &[usize], seed: u64, scale: f32) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = shape.iter().product();
    let data = (0..n).map(|_| rng.gen_range(-scale..scale)).collect();
    Tensor::new(shape.to_vec(), data).unwrap()
}

pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

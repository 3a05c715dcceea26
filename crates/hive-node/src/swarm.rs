//! Local swarms of simulated peers, described on the command line as
//! `id:start-end[@throughput]` entries.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use hive_net::{encode_announcement, AnnouncementRegistry, Fault, LoopbackTransport, ServerAnnouncement, SimulatedPeer};
use hive_types::{BlockRange, BlockUid, PeerId};

pub const PREFIX: &str = "hive";

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    pub id: String,
    pub blocks: BlockRange,
    pub throughput: Option<f64>,
}

impl FromStr for PeerSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (id, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("{s:?}: expected id:start-end[@throughput]"))?;
        let (range, throughput) = match rest.split_once('@') {
            Some((range, tp)) => {
                let tp: f64 = tp.parse().map_err(|e| format!("{s:?}: throughput: {e}"))?;
                (range, Some(tp))
            }
            None => (rest, None),
        };
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("{s:?}: expected a start-end block range"))?;
        let start: u32 = start.trim().parse().map_err(|e| format!("{s:?}: start: {e}"))?;
        let end: u32 = end.trim().parse().map_err(|e| format!("{s:?}: end: {e}"))?;
        let blocks = BlockRange::new(start, end).map_err(|e| format!("{s:?}: {e}"))?;
        if id.is_empty() {
            return Err(format!("{s:?}: empty peer id"));
        }
        Ok(Self { id: id.to_owned(), blocks, throughput })
    }
}

/// Simulated peers behind a loopback transport, announced to an in-memory
/// registry the same way they would be over gossip.
pub struct LocalSwarm {
    pub registry: Arc<AnnouncementRegistry>,
    pub transport: Arc<LoopbackTransport>,
    pub num_blocks: u32,
}

impl LocalSwarm {
    /// Peers without an explicit throughput get `default_throughput`.
    pub fn build(peers: &[PeerSpec], hidden_size: usize, default_throughput: f64) -> Result<Self> {
        if peers.is_empty() {
            bail!("a swarm needs at least one peer");
        }
        let registry = Arc::new(AnnouncementRegistry::new(PREFIX));
        let transport = Arc::new(LoopbackTransport::new());
        for peer in peers {
            let throughput = peer.throughput.unwrap_or(default_throughput);
            let ann = ServerAnnouncement::new(peer.id.as_str(), PREFIX, peer.blocks, Some(throughput));
            if !registry.ingest(&encode_announcement(&ann)?) {
                bail!("announcement from {} was rejected", peer.id);
            }
            let handler = SimulatedPeer::new(peer.id.as_str(), PREFIX, peer.blocks, hidden_size);
            transport.register(peer.id.as_str(), Arc::new(handler));
            info!(peer = %peer.id, blocks = %peer.blocks, throughput, "simulated peer up");
        }
        let num_blocks = peers.iter().map(|p| p.blocks.end).max().unwrap_or(0);
        Ok(Self { registry, transport, num_blocks })
    }

    pub fn uids(&self) -> Vec<BlockUid> {
        BlockUid::sequence(PREFIX, self.num_blocks)
    }

    /// Take `peer` offline; every later call to it fails.
    pub fn kill(&self, peer: &str) {
        info!(peer, "taking peer offline");
        self.transport.inject(PeerId::from(peer), Fault::Offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_specs() {
        let p: PeerSpec = "a:0-6".parse().unwrap();
        assert_eq!(p, PeerSpec { id: "a".into(), blocks: BlockRange { start: 0, end: 6 }, throughput: None });
        let p: PeerSpec = "fast:4-10@2.5".parse().unwrap();
        assert_eq!(p.blocks, BlockRange { start: 4, end: 10 });
        assert_eq!(p.throughput, Some(2.5));
    }

    #[test]
    fn rejects_bad_specs() {
        for bad in ["a", "a:6-2", "a:3", ":0-2", "a:0-2@fast", "a:x-2"] {
            assert!(bad.parse::<PeerSpec>().is_err(), "{bad}");
        }
    }

    #[test]
    fn builds_a_routable_swarm() {
        let peers: Vec<PeerSpec> = ["a:0-6", "b:4-12@3"].iter().map(|s| s.parse().unwrap()).collect();
        let swarm = LocalSwarm::build(&peers, 4, 1.0).unwrap();
        assert_eq!(swarm.num_blocks, 12);
        assert_eq!(swarm.uids().len(), 12);
        assert!(LocalSwarm::build(&[], 4, 1.0).is_err());
    }
}

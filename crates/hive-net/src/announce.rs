//! Server availability announcements.
//!
//! A serving peer periodically publishes one [`ServerAnnouncement`] on the
//! `hive/announce/v1` gossip topic. Registries ingest them and answer block
//! lookups from the latest announcement per peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hive_types::{BlockRange, PeerId, PeerRecord};

use crate::error::{NetError, Result};

// ── Topic constants ───────────────────────────────────────────────────────────

pub const TOPIC_ANNOUNCE: &str = "hive/announce/v1";

/// Message published on `hive/announce/v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAnnouncement {
    pub peer_id: PeerId,
    /// Model namespace, the `prefix` part of every served uid.
    pub prefix: String,
    /// Contiguous blocks the peer serves.
    pub blocks: BlockRange,
    /// Measured compute throughput in requests per second.
    pub throughput: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ServerAnnouncement {
    pub fn new(
        peer_id: impl Into<PeerId>,
        prefix: impl Into<String>,
        blocks: BlockRange,
        throughput: Option<f64>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            prefix: prefix.into(),
            blocks,
            throughput,
            timestamp: Utc::now(),
        }
    }

    /// Directory record carrying the announcement's timestamp.
    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            peer_id: self.peer_id.clone(),
            blocks: self.blocks,
            updated_at: self.timestamp,
            throughput: self.throughput,
        }
    }
}

/// Encode a [`ServerAnnouncement`] to bincode bytes for gossip publishing.
pub fn encode_announcement(ann: &ServerAnnouncement) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(ann, bincode::config::standard())
        .map_err(|e| NetError::Serialization(e.to_string()))
}

/// Decode a [`ServerAnnouncement`] received via gossip. Malformed payloads
/// yield `None`.
pub fn decode_announcement(data: &[u8]) -> Option<ServerAnnouncement> {
    bincode::serde::decode_from_slice(data, bincode::config::standard())
        .ok()
        .map(|(ann, _)| ann)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trip() {
        let ann = ServerAnnouncement::new(
            "peer-a",
            "bloom-560m",
            BlockRange { start: 0, end: 12 },
            Some(350.0),
        );
        let bytes = encode_announcement(&ann).unwrap();
        let decoded = decode_announcement(&bytes).unwrap();
        assert_eq!(decoded, ann);

        let record = decoded.to_record();
        assert_eq!(record.peer_id.as_str(), "peer-a");
        assert_eq!(record.updated_at, ann.timestamp);
        assert_eq!(record.score(), 350.0);
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(decode_announcement(&[0xff, 0x01]).is_none());
    }
}

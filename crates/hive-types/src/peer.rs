// Peer identities and the records the directory keeps about them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block::BlockRange;

/// Opaque peer identity as issued by the registry / transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the registry knows about one serving peer.
///
/// Records are replaced wholesale on every directory refresh, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Contiguous range of blocks the peer claims to serve.
    pub blocks: BlockRange,
    /// When the peer last announced itself.
    pub updated_at: DateTime<Utc>,
    /// Measured requests per second; `None` if the peer never reported one.
    pub throughput: Option<f64>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<PeerId>, blocks: BlockRange, throughput: Option<f64>) -> Self {
        Self {
            peer_id: peer_id.into(),
            blocks,
            updated_at: Utc::now(),
            throughput,
        }
    }

    /// Throughput used for ranking; unknown counts as zero.
    pub fn score(&self) -> f64 {
        self.throughput.filter(|t| t.is_finite()).unwrap_or(0.0)
    }

    /// Seconds since the last announcement.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.updated_at).num_milliseconds() as f64 / 1000.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_defaults_to_zero() {
        let r = PeerRecord::new("a", BlockRange { start: 0, end: 4 }, None);
        assert_eq!(r.score(), 0.0);
        let r = PeerRecord::new("a", BlockRange { start: 0, end: 4 }, Some(f64::NAN));
        assert_eq!(r.score(), 0.0);
        let r = PeerRecord::new("a", BlockRange { start: 0, end: 4 }, Some(12.5));
        assert_eq!(r.score(), 12.5);
    }

    #[test]
    fn peer_record_serde() {
        let r = PeerRecord::new("peer-a", BlockRange { start: 0, end: 5 }, Some(100.0));
        let json = serde_json::to_string(&r).unwrap();
        let round: PeerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(round, r);
    }
}

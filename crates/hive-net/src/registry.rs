//! Peer registry seam.
//!
//! The routing layer asks a [`PeerRegistry`] which peers serve which blocks.
//! [`AnnouncementRegistry`] answers from the latest [`ServerAnnouncement`]
//! of every peer, as received on the announce topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use hive_types::{BlockUid, PeerId, PeerRecord};

use crate::announce::{decode_announcement, ServerAnnouncement};
use crate::error::{NetError, Result};

#[async_trait]
pub trait PeerRegistry: Send + Sync {
    /// Records of the peers serving each uid, in the order of `uids`.
    async fn resolve(&self, uids: &[BlockUid]) -> Result<Vec<Vec<PeerRecord>>>;
}

// ── AnnouncementRegistry ──────────────────────────────────────────────────────

/// In-memory registry for one model prefix.
pub struct AnnouncementRegistry {
    prefix: String,
    announcements: RwLock<HashMap<PeerId, ServerAnnouncement>>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl AnnouncementRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            announcements: RwLock::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store `ann` unless a newer announcement from the same peer is known.
    /// Returns whether it was stored.
    pub fn announce(&self, ann: ServerAnnouncement) -> bool {
        if ann.prefix != self.prefix {
            debug!(peer = %ann.peer_id, prefix = %ann.prefix, "ignoring announcement for another model");
            return false;
        }
        let mut map = self
            .announcements
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match map.get(&ann.peer_id) {
            Some(known) if known.timestamp > ann.timestamp => false,
            _ => {
                debug!(peer = %ann.peer_id, blocks = %ann.blocks, "announcement stored");
                map.insert(ann.peer_id.clone(), ann);
                true
            }
        }
    }

    /// Ingest a raw gossip payload. Malformed payloads are dropped.
    pub fn ingest(&self, data: &[u8]) -> bool {
        match decode_announcement(data) {
            Some(ann) => self.announce(ann),
            None => {
                warn!(len = data.len(), "dropping malformed announcement");
                false
            }
        }
    }

    pub fn remove(&self, peer: &PeerId) {
        self.announcements
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
    }

    /// Make every subsequent `resolve` fail, as if the registry went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `resolve` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerRegistry for AnnouncementRegistry {
    async fn resolve(&self, uids: &[BlockUid]) -> Result<Vec<Vec<PeerRecord>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NetError::Registry("registry unavailable".into()));
        }

        let map = self
            .announcements
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut anns: Vec<&ServerAnnouncement> = map.values().collect();
        anns.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        Ok(uids
            .iter()
            .map(|uid| {
                if uid.prefix != self.prefix {
                    return Vec::new();
                }
                anns.iter()
                    .filter(|a| a.blocks.contains(uid.index))
                    .map(|a| a.to_record())
                    .collect()
            })
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

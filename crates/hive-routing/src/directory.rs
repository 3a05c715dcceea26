//! Which peers can serve which blocks.
//!
//! The directory keeps an immutable [`DirectoryView`] behind an [`ArcSwap`]:
//! readers take a snapshot without locking, refreshes build a new view and
//! swap it in. Two refreshes racing on different ranges both land because the
//! swap is a read-copy-update loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tracing::{debug, info, warn};

use hive_net::PeerRegistry;
use hive_types::{BlockRange, BlockUid, PeerId, PeerRecord};

use crate::error::{Result, RoutingError};
use crate::liveness::PeerLiveness;

// ── DirectoryView ─────────────────────────────────────────────────────────────

/// Snapshot of the registry for the blocks fetched so far.
#[derive(Debug, Clone, Default)]
pub struct DirectoryView {
    /// `block index → candidates`, best first.
    blocks: HashMap<u32, Vec<PeerRecord>>,
    /// Number of refreshes merged into this view.
    pub version: u64,
}

impl DirectoryView {
    /// All known records for `index`, ignoring bans and age.
    pub fn records(&self, index: u32) -> &[PeerRecord] {
        self.blocks.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Throughput descending, then peer id ascending.
pub fn rank(records: &mut [PeerRecord]) {
    records.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}

fn block_count(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| RoutingError::InvalidRequest(format!("{len} blocks exceed the u32 block index")))
}

// ── PeerDirectory ─────────────────────────────────────────────────────────────

pub struct PeerDirectory {
    registry: Arc<dyn PeerRegistry>,
    uids: Vec<BlockUid>,
    num_blocks: u32,
    view: ArcSwap<DirectoryView>,
    liveness: PeerLiveness,
    max_record_age: Duration,
}

impl PeerDirectory {
    pub fn new(
        registry: Arc<dyn PeerRegistry>,
        uids: Vec<BlockUid>,
        ban_timeout: Duration,
        max_record_age: Duration,
    ) -> Result<Self> {
        let num_blocks = block_count(uids.len())?;
        Ok(Self {
            registry,
            uids,
            num_blocks,
            view: ArcSwap::from_pointee(DirectoryView::default()),
            liveness: PeerLiveness::new(ban_timeout),
            max_record_age,
        })
    }

    pub fn uids(&self) -> &[BlockUid] {
        &self.uids
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// The whole served chain, `[0, num_blocks)`.
    pub fn full_range(&self) -> Result<BlockRange> {
        Ok(BlockRange::new(0, self.num_blocks())?)
    }

    /// Reject ranges reaching past the last block.
    pub fn check_range(&self, range: BlockRange) -> Result<()> {
        if range.is_empty() || range.end > self.num_blocks() {
            return Err(RoutingError::InvalidRequest(format!(
                "block range {range} outside [0, {})",
                self.num_blocks()
            )));
        }
        Ok(())
    }

    pub fn view(&self) -> Arc<DirectoryView> {
        self.view.load_full()
    }

    /// Fetch fresh records for `range` from the registry and merge them into
    /// the view.
    pub async fn refresh(&self, range: BlockRange) -> Result<()> {
        self.check_range(range)?;
        let uids = &self.uids[range.as_usize()];
        let mut found = self
            .registry
            .resolve(uids)
            .await
            .map_err(|e| RoutingError::Registry(e.to_string()))?;
        if found.len() != uids.len() {
            return Err(RoutingError::Registry(format!(
                "asked for {} blocks, registry answered {}",
                uids.len(),
                found.len()
            )));
        }
        for records in &mut found {
            rank(records);
        }

        let previous = self.view.rcu(|old| {
            let mut next = DirectoryView::clone(old);
            for (index, records) in range.iter().zip(&found) {
                next.blocks.insert(index, records.clone());
            }
            next.version += 1;
            next
        });
        self.liveness.expire();
        debug!(blocks = %range, version = previous.version + 1, "directory refreshed");
        Ok(())
    }

    /// Whether `record` may be routed to right now.
    fn usable(&self, record: &PeerRecord) -> bool {
        let fresh = record.age_secs(Utc::now()) <= self.max_record_age.as_secs_f64();
        fresh && !self.liveness.is_banned(&record.peer_id)
    }

    /// Usable candidates for block `index`, best first.
    pub fn lookup(&self, index: u32) -> Vec<PeerRecord> {
        self.view
            .load()
            .records(index)
            .iter()
            .filter(|r| self.usable(r))
            .cloned()
            .collect()
    }

    /// Refresh `range` if any of its blocks has no usable candidate.
    pub async fn ensure(&self, range: BlockRange) -> Result<()> {
        self.check_range(range)?;
        let missing = range.iter().find(|&i| self.lookup(i).is_empty());
        if let Some(index) = missing {
            debug!(block = index, blocks = %range, "no usable peers cached, asking the registry");
            self.refresh(range).await?;
        }
        Ok(())
    }

    /// Exclude `peer` from routing until its ban runs out.
    pub fn mark_stale(&self, peer: &PeerId) {
        warn!(peer = %peer, ban = ?self.liveness.ban_timeout(), "banning peer after failed hop");
        self.liveness.ban(peer);
    }

    pub fn mark_healthy(&self, peer: &PeerId) {
        if self.liveness.clear(peer) {
            info!(peer = %peer, "peer recovered, ban lifted");
        }
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.liveness.is_banned(peer)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hive_net::{AnnouncementRegistry, ServerAnnouncement};

    fn registry(peers: &[(&str, u32, u32, f64)]) -> Arc<AnnouncementRegistry> {
        let reg = Arc::new(AnnouncementRegistry::new("m"));
        for &(id, start, end, tp) in peers {
            reg.announce(ServerAnnouncement::new(id, "m", BlockRange { start, end }, Some(tp)));
        }
        reg
    }

    fn directory(reg: Arc<AnnouncementRegistry>) -> PeerDirectory {
        PeerDirectory::new(
            reg,
            BlockUid::sequence("m", 10),
            Duration::from_secs(15),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    fn ids(records: &[PeerRecord]) -> Vec<&str> {
        records.iter().map(|r| r.peer_id.as_str()).collect()
    }

    #[test]
    fn rank_by_throughput_then_id() {
        let r = |id: &str, tp: Option<f64>| PeerRecord::new(id, BlockRange { start: 0, end: 1 }, tp);
        let mut recs = vec![r("c", Some(5.0)), r("b", None), r("a", Some(5.0)), r("d", Some(9.0))];
        rank(&mut recs);
        assert_eq!(ids(&recs), vec!["d", "a", "c", "b"]);
    }

    #[tokio::test]
    async fn refresh_merges_ranges() {
        let dir = directory(registry(&[("a", 0, 5, 1.0), ("b", 5, 10, 1.0)]));
        dir.refresh(BlockRange { start: 0, end: 3 }).await.unwrap();
        dir.refresh(BlockRange { start: 6, end: 8 }).await.unwrap();
        let view = dir.view();
        assert_eq!(view.version, 2);
        assert_eq!(ids(view.records(1)), vec!["a"]);
        assert_eq!(ids(view.records(7)), vec!["b"]);
        assert!(view.records(4).is_empty());
    }

    #[tokio::test]
    async fn concurrent_refreshes_are_not_lost() {
        let dir = Arc::new(directory(registry(&[("a", 0, 10, 1.0)])));
        let tasks: Vec<_> = (0..10u32)
            .map(|i| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.refresh(BlockRange { start: i, end: i + 1 }).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let view = dir.view();
        assert_eq!(view.version, 10);
        assert!((0..10).all(|i| !view.records(i).is_empty()));
    }

    #[tokio::test]
    async fn banned_peer_is_skipped_until_healthy() {
        let dir = directory(registry(&[("a", 0, 5, 9.0), ("b", 0, 5, 1.0)]));
        dir.refresh(BlockRange { start: 0, end: 5 }).await.unwrap();
        assert_eq!(ids(&dir.lookup(2)), vec!["a", "b"]);

        dir.mark_stale(&PeerId::from("a"));
        assert_eq!(ids(&dir.lookup(2)), vec!["b"]);

        dir.mark_healthy(&PeerId::from("a"));
        assert_eq!(ids(&dir.lookup(2)), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn ensure_refreshes_only_when_needed() {
        let reg = registry(&[("a", 0, 10, 1.0)]);
        let dir = directory(reg.clone());
        dir.ensure(BlockRange { start: 0, end: 4 }).await.unwrap();
        assert_eq!(reg.lookups(), 1);
        dir.ensure(BlockRange { start: 1, end: 3 }).await.unwrap();
        assert_eq!(reg.lookups(), 1);
        dir.ensure(BlockRange { start: 3, end: 6 }).await.unwrap();
        assert_eq!(reg.lookups(), 2);
    }

    #[tokio::test]
    async fn old_records_are_unusable() {
        let reg = Arc::new(AnnouncementRegistry::new("m"));
        let mut ann = ServerAnnouncement::new("a", "m", BlockRange { start: 0, end: 10 }, Some(1.0));
        ann.timestamp = Utc::now() - chrono::Duration::seconds(600);
        reg.announce(ann);
        let dir = directory(reg);
        dir.refresh(BlockRange { start: 0, end: 10 }).await.unwrap();
        assert_eq!(dir.view().records(0).len(), 1);
        assert!(dir.lookup(0).is_empty());
    }

    #[test]
    fn block_count_must_fit_an_index() {
        assert_eq!(block_count(10).unwrap(), 10);
        assert_eq!(directory(registry(&[])).num_blocks(), 10);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            block_count(u32::MAX as usize + 1),
            Err(RoutingError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn out_of_range_and_registry_errors() {
        let reg = registry(&[("a", 0, 10, 1.0)]);
        let dir = directory(reg.clone());
        assert!(matches!(
            dir.refresh(BlockRange { start: 5, end: 11 }).await,
            Err(RoutingError::InvalidRequest(_))
        ));
        reg.set_unavailable(true);
        assert!(matches!(
            dir.refresh(BlockRange { start: 0, end: 1 }).await,
            Err(RoutingError::Registry(_))
        ));
    }
}

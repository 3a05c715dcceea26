//! Turning a block range into a chain of peers.
//!
//! Algorithm:
//! 1. Walk the required block indices left to right.
//! 2. For the first index not yet covered, ask the directory for candidates.
//! 3. Let the [`PeerSelector`] pick one.
//! 4. Extend the span to the end of that peer's claimed range, clamped to the
//!    requested end, and continue from there.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;

use hive_types::{BlockRange, PeerId, PeerRecord};

use crate::error::{Result, RoutingError};

// ── Span / Sequence ───────────────────────────────────────────────────────────

/// Consecutive blocks served by one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub range: BlockRange,
    pub peer: PeerRecord,
}

impl Span {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer.peer_id
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.range, self.peer.peer_id)
    }
}

/// Ordered spans covering exactly one block range. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    range: BlockRange,
    spans: Vec<Span>,
}

impl Sequence {
    /// Check that `spans` tile `range` with no gap or overlap.
    pub fn new(range: BlockRange, spans: Vec<Span>) -> Result<Self> {
        let mut cursor = range.start;
        for span in &spans {
            if span.range.start != cursor || span.range.is_empty() || !span.peer.blocks.covers(&span.range) {
                return Err(RoutingError::InvalidRequest(format!(
                    "span {span} does not continue {range} at block {cursor}"
                )));
            }
            cursor = span.range.end;
        }
        if cursor != range.end {
            return Err(RoutingError::InvalidRequest(format!(
                "spans end at block {cursor}, expected {}",
                range.end
            )));
        }
        Ok(Self { range, spans })
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.spans.iter().map(Span::peer_id)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{span}")?;
        }
        Ok(())
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Built-in routing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// Highest throughput first, ties broken by peer id.
    #[default]
    Fastest,
    /// Uniform among candidates, avoiding the previous span's peer.
    Random,
}

/// Picks the peer that serves the span starting at `index`.
pub trait PeerSelector: Send + Sync {
    /// Index into `candidates`, which is never empty.
    fn select(&self, index: u32, candidates: &[PeerRecord], previous: Option<&PeerId>) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FastestSelector;

impl PeerSelector for FastestSelector {
    fn select(&self, _index: u32, candidates: &[PeerRecord], _previous: Option<&PeerId>) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| match b.score().total_cmp(&a.score()) {
                Ordering::Equal => a.peer_id.cmp(&b.peer_id),
                other => other,
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct RandomSelector {
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    pub fn new(rng: StdRng) -> Self {
        Self { rng: Mutex::new(rng) }
    }
}

impl PeerSelector for RandomSelector {
    fn select(&self, _index: u32, candidates: &[PeerRecord], previous: Option<&PeerId>) -> usize {
        let allowed: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, r)| Some(&r.peer_id) != previous)
            .map(|(i, _)| i)
            .collect();
        let pool: Vec<usize> = if allowed.is_empty() { (0..candidates.len()).collect() } else { allowed };
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        pool[rng.gen_range(0..pool.len())]
    }
}

// ── Planning ──────────────────────────────────────────────────────────────────

/// Build a [`Sequence`] over `range`. `lookup(index)` returns the usable
/// candidates for one block.
pub fn plan(
    range: BlockRange,
    lookup: impl Fn(u32) -> Vec<PeerRecord>,
    selector: &dyn PeerSelector,
) -> Result<Sequence> {
    let mut spans = Vec::new();
    let mut previous: Option<PeerId> = None;
    let mut cursor = range.start;

    while cursor < range.end {
        let candidates: Vec<PeerRecord> =
            lookup(cursor).into_iter().filter(|r| r.blocks.contains(cursor)).collect();
        if candidates.is_empty() {
            return Err(RoutingError::NoPeersAvailable { block: cursor });
        }
        let choice = selector.select(cursor, &candidates, previous.as_ref()).min(candidates.len() - 1);
        let peer = candidates[choice].clone();
        let end = peer.blocks.end.min(range.end);

        previous = Some(peer.peer_id.clone());
        spans.push(Span { range: BlockRange { start: cursor, end }, peer });
        cursor = end;
    }

    Sequence::new(range, spans)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rec(id: &str, start: u32, end: u32, tp: f64) -> PeerRecord {
        PeerRecord::new(id, BlockRange { start, end }, Some(tp))
    }

    fn swarm(records: Vec<PeerRecord>) -> impl Fn(u32) -> Vec<PeerRecord> {
        move |i| records.iter().filter(|r| r.blocks.contains(i)).cloned().collect()
    }

    #[test]
    fn fastest_splits_at_peer_boundary() {
        let lookup = swarm(vec![rec("A", 0, 5, 1.0), rec("B", 5, 10, 1.0)]);
        let seq = plan(BlockRange { start: 3, end: 6 }, lookup, &FastestSelector).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.spans()[0].range, BlockRange { start: 3, end: 5 });
        assert_eq!(seq.spans()[0].peer_id().as_str(), "A");
        assert_eq!(seq.spans()[1].range, BlockRange { start: 5, end: 6 });
        assert_eq!(seq.spans()[1].peer_id().as_str(), "B");
        assert_eq!(seq.to_string(), "[3, 5)→A [5, 6)→B");
    }

    #[test]
    fn fastest_prefers_throughput_then_id() {
        let lookup = swarm(vec![rec("b", 0, 8, 5.0), rec("a", 0, 8, 5.0), rec("c", 0, 8, 1.0)]);
        let seq = plan(BlockRange { start: 0, end: 8 }, lookup, &FastestSelector).unwrap();
        assert_eq!(seq.peers().map(PeerId::as_str).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn missing_block_is_an_error() {
        let lookup = swarm(vec![rec("A", 0, 4, 1.0), rec("B", 5, 10, 1.0)]);
        let err = plan(BlockRange { start: 2, end: 7 }, lookup, &FastestSelector).unwrap_err();
        assert!(matches!(err, RoutingError::NoPeersAvailable { block: 4 }));
    }

    #[test]
    fn random_spans_tile_the_range_and_alternate() {
        let records = vec![
            rec("a", 0, 3, 1.0),
            rec("b", 0, 6, 1.0),
            rec("c", 2, 8, 1.0),
            rec("d", 5, 12, 1.0),
            rec("e", 7, 12, 1.0),
        ];
        let selector = RandomSelector::new(StdRng::seed_from_u64(42));
        for _ in 0..200 {
            let seq = plan(BlockRange { start: 1, end: 11 }, swarm(records.clone()), &selector).unwrap();
            let mut cursor = 1;
            for span in seq.spans() {
                assert_eq!(span.range.start, cursor);
                assert!(span.peer.blocks.covers(&span.range));
                cursor = span.range.end;
            }
            assert_eq!(cursor, 11);
            for pair in seq.spans().windows(2) {
                assert_ne!(pair[0].peer_id(), pair[1].peer_id());
            }
        }
    }

    #[test]
    fn random_reuses_peer_without_alternative() {
        let selector = RandomSelector::new(StdRng::seed_from_u64(1));
        let only = [rec("a", 0, 4, 1.0)];
        assert_eq!(selector.select(0, &only, Some(&PeerId::from("a"))), 0);
    }

    #[test]
    fn sequence_rejects_gaps() {
        let range = BlockRange { start: 0, end: 4 };
        let spans = vec![
            Span { range: BlockRange { start: 0, end: 2 }, peer: rec("a", 0, 2, 1.0) },
            Span { range: BlockRange { start: 3, end: 4 }, peer: rec("b", 3, 4, 1.0) },
        ];
        assert!(Sequence::new(range, spans).is_err());
    }
}

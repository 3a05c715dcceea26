// Block identifiers and block ranges.
//
// Consumed by `hive-net` (wire messages, announcements) and `hive-routing`
// (directory, sequences, sessions).

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// Separates the namespace prefix from the block index in textual uids.
pub const UID_DELIMITER: char = '.';

// ── Block UID ─────────────────────────────────────────────────────────────────

/// Stable identifier of one model layer: `"{prefix}.{index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockUid {
    pub prefix: String,
    pub index: u32,
}

impl BlockUid {
    pub fn new(prefix: impl Into<String>, index: u32) -> Self {
        Self { prefix: prefix.into(), index }
    }

    /// Uids `prefix.0 .. prefix.(n_blocks - 1)` in order.
    pub fn sequence(prefix: &str, n_blocks: u32) -> Vec<BlockUid> {
        (0..n_blocks).map(|i| BlockUid::new(prefix, i)).collect()
    }
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.prefix, UID_DELIMITER, self.index)
    }
}

impl FromStr for BlockUid {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, index) = s
            .rsplit_once(UID_DELIMITER)
            .ok_or_else(|| HiveError::InvalidUid(format!("missing '{UID_DELIMITER}' in {s:?}")))?;
        if prefix.is_empty() {
            return Err(HiveError::InvalidUid(format!("empty prefix in {s:?}")));
        }
        let index = index
            .parse::<u32>()
            .map_err(|e| HiveError::InvalidUid(format!("bad index in {s:?}: {e}")))?;
        Ok(Self::new(prefix, index))
    }
}

// ── Block Range ───────────────────────────────────────────────────────────────

/// Half-open range of block indices.
///
/// `BlockRange { start: 3, end: 6 }` covers blocks 3, 4, 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
}

impl BlockRange {
    /// Build a non-empty range.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start >= end {
            return Err(HiveError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, index: u32) -> bool {
        self.start <= index && index < self.end
    }

    /// True if `other` lies entirely within `self`.
    pub fn covers(&self, other: &BlockRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn iter(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Indices as a `usize` range, for slicing per-block vectors.
    pub fn as_usize(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }

    /// Sub-range expressed relative to `self.start`.
    ///
    /// `BlockRange(10, 20).slice(2, 5)` is `BlockRange(12, 15)`.
    pub fn slice(&self, start: u32, end: u32) -> Result<Self> {
        if start >= end || end > self.len() {
            return Err(HiveError::InvalidRange { start, end });
        }
        Ok(Self { start: self.start + start, end: self.start + end })
    }

    /// Position of `other` relative to `self.start`.
    pub fn relative(&self, other: &BlockRange) -> Range<usize> {
        (other.start - self.start) as usize..(other.end - self.start) as usize
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_display_and_parse() {
        let uid = BlockUid::new("bloom-560m", 7);
        assert_eq!(uid.to_string(), "bloom-560m.7");
        let parsed: BlockUid = "bloom-560m.7".parse().unwrap();
        assert_eq!(parsed, uid);
    }

    #[test]
    fn uid_prefix_may_contain_delimiter() {
        let parsed: BlockUid = "org.model.12".parse().unwrap();
        assert_eq!(parsed.prefix, "org.model");
        assert_eq!(parsed.index, 12);
    }

    #[test]
    fn uid_rejects_garbage() {
        assert!("nodelimiter".parse::<BlockUid>().is_err());
        assert!("model.x".parse::<BlockUid>().is_err());
        assert!(".3".parse::<BlockUid>().is_err());
    }

    #[test]
    fn uid_sequence_is_ordered() {
        let uids = BlockUid::sequence("m", 4);
        assert_eq!(uids.len(), 4);
        assert_eq!(uids[3].to_string(), "m.3");
    }

    #[test]
    fn range_basics() {
        let r = BlockRange::new(3, 6).unwrap();
        assert_eq!(r.len(), 3);
        assert!(r.contains(3));
        assert!(r.contains(5));
        assert!(!r.contains(6));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(r.to_string(), "[3, 6)");
    }

    #[test]
    fn empty_range_rejected() {
        assert!(BlockRange::new(5, 5).is_err());
        assert!(BlockRange::new(6, 5).is_err());
    }

    #[test]
    fn slice_is_relative() {
        let r = BlockRange::new(10, 20).unwrap();
        assert_eq!(r.slice(2, 5).unwrap(), BlockRange { start: 12, end: 15 });
        assert!(r.slice(5, 11).is_err());
        assert_eq!(r.relative(&BlockRange { start: 12, end: 15 }), 2..5);
        assert!(r.covers(&BlockRange { start: 12, end: 15 }));
        assert!(!r.covers(&BlockRange { start: 9, end: 15 }));
    }
}

//! Temporary exclusion of peers after failed hops.
//!
//! A peer that fails a call is banned for `ban_timeout`. Bans expire on their
//! own; a later successful call clears the ban early.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use hive_types::PeerId;

/// Tracks banned peers and when each ban ends.
#[derive(Debug)]
pub struct PeerLiveness {
    ban_timeout: Duration,
    /// `peer → ban expiry`
    banned_until: Mutex<HashMap<PeerId, Instant>>,
}

impl PeerLiveness {
    pub fn new(ban_timeout: Duration) -> Self {
        Self { ban_timeout, banned_until: Mutex::new(HashMap::new()) }
    }

    fn bans(&self) -> MutexGuard<'_, HashMap<PeerId, Instant>> {
        self.banned_until.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ban `peer` for `ban_timeout` from now. Re-banning extends the ban.
    pub fn ban(&self, peer: &PeerId) {
        self.bans().insert(peer.clone(), Instant::now() + self.ban_timeout);
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        match self.bans().get(peer) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    /// Lift the ban on `peer`. Returns whether one was active.
    pub fn clear(&self, peer: &PeerId) -> bool {
        self.bans().remove(peer).is_some()
    }

    /// Drop expired bans.
    pub fn expire(&self) {
        let now = Instant::now();
        self.bans().retain(|_, until| now < *until);
    }

    pub fn banned(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.bans()
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn ban_timeout(&self) -> Duration {
        self.ban_timeout
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ban_expires() {
        let live = PeerLiveness::new(Duration::from_secs(15));
        let a = PeerId::from("a");
        live.ban(&a);
        assert!(live.is_banned(&a));
        assert_eq!(live.banned(), vec![a.clone()]);

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!live.is_banned(&a));
        live.expire();
        assert!(live.banned().is_empty());
    }

    #[tokio::test]
    async fn clear_lifts_ban() {
        let live = PeerLiveness::new(Duration::from_secs(15));
        let a = PeerId::from("a");
        assert!(!live.clear(&a));
        live.ban(&a);
        assert!(live.clear(&a));
        assert!(!live.is_banned(&a));
        assert!(!live.is_banned(&PeerId::from("b")));
    }
}

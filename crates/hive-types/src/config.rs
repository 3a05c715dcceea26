// Client-side configuration. Every field has a default; TOML files may set
// any subset of them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

// ── Routing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Period of the background directory refresh.
    /// Default: 30 s.
    pub update_period_ms: u64,

    /// Upper bound on a single remote call. A call that exceeds it counts as
    /// a failed hop.
    /// Default: 30 s.
    pub request_timeout_ms: u64,

    /// Re-plan attempts allowed per hop before giving up.
    /// Default: 3.
    pub max_retries: u32,

    /// First retry delay; doubles per attempt.
    /// Default: 100 ms.
    pub min_backoff_ms: u64,

    /// Retry delay ceiling.
    /// Default: 5 s.
    pub max_backoff_ms: u64,

    /// How long a peer stays excluded from routing after a failed hop.
    /// Default: 15 s.
    pub ban_timeout_ms: u64,

    /// Peer records older than this are treated as unknown.
    /// Default: 5 min.
    pub max_record_age_ms: u64,

    /// Seed for `Random` routing. `None` draws from OS entropy.
    pub random_seed: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            update_period_ms: 30_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
            ban_timeout_ms: 15_000,
            max_record_age_ms: 300_000,
            random_seed: None,
        }
    }
}

impl RoutingConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ban_timeout(&self) -> Duration {
        Duration::from_millis(self.ban_timeout_ms)
    }

    pub fn max_record_age(&self) -> Duration {
        Duration::from_millis(self.max_record_age_ms)
    }

    /// Delay before retry number `attempt` (0-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.min_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a peer may drop its side of a session.
    /// Default: 5 min.
    pub lease_ms: u64,

    /// Recovery attempts per step before the session fails.
    /// Default: 3.
    pub max_recoveries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { lease_ms: 300_000, max_recoveries: 3 }
    }
}

impl SessionConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

// ── File loading ──────────────────────────────────────────────────────────────

/// Top-level TOML document: `[routing]` and `[session]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub routing: RoutingConfig,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HiveError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HiveError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

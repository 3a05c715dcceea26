//! Host throughput for simulated peers, in block-forward tokens per second.
//!
//! Measuring takes a moment, so results are kept in a JSON file keyed by the
//! measurement parameters. One process measures at a time: the cache is
//! guarded by an exclusive lock on a sibling lock file, released when the
//! file handle drops.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use tracing::{info, warn};

use hive_net::{BlockCache, SimBlock};
use hive_types::Tensor;

const CACHE_FILE: &str = "throughput_v1.json";
const LOCK_FILE: &str = "throughput.lock";

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputParams {
    pub hidden_size: usize,
    /// Tokens per measured step.
    pub n_tokens: usize,
    pub n_steps: usize,
}

impl Default for ThroughputParams {
    fn default() -> Self {
        Self { hidden_size: 16, n_tokens: 16, n_steps: 200 }
    }
}

impl ThroughputParams {
    fn cache_key(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        let digest = blake3::hash(&encoded).to_hex();
        Ok(format!("sim_hidden{}_{}", self.hidden_size, &digest[..16]))
    }
}

/// Cached throughput for `params`, measuring it on a miss or when `force`
/// is set.
pub fn host_throughput(cache_dir: &Path, params: &ThroughputParams, force: bool) -> Result<f64> {
    fs::create_dir_all(cache_dir).with_context(|| format!("creating {}", cache_dir.display()))?;
    let lock_path = cache_dir.join(LOCK_FILE);
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("opening {}", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("locking {}", lock_path.display()))?;

    let cache_path = cache_dir.join(CACHE_FILE);
    let key = params.cache_key()?;
    let mut cache = load_cache(&cache_path);

    if let Some(&rps) = cache.get(&key).filter(|_| !force) {
        info!(key = %key, rps, "using cached throughput");
        return Ok(rps);
    }

    let rps = measure_compute_rps(params)?;
    cache.insert(key, rps);
    if let Err(e) = save_cache(&cache_path, &cache) {
        warn!(path = %cache_path.display(), error = %e, "failed to save throughput cache");
    }
    Ok(rps)
}

/// Tokens per second through one toy block with a live cache.
pub fn measure_compute_rps(params: &ThroughputParams) -> Result<f64> {
    info!(?params, "measuring compute throughput");
    let block = SimBlock::new(0);
    let n = params.n_tokens * params.hidden_size;
    let step = Tensor::new(
        vec![1, params.n_tokens, params.hidden_size],
        (0..n).map(|i| ((i % 17) as f32 - 8.0) / 8.0).collect(),
    )?;

    let mut cache = BlockCache::new(1, params.hidden_size);
    block.forward(&step, Some(&mut cache))?;

    let start = Instant::now();
    for _ in 0..params.n_steps {
        block.forward(&step, Some(&mut cache))?;
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    let rps = (params.n_tokens * params.n_steps) as f64 / elapsed;
    info!(rps, "compute throughput measured");
    Ok(rps)
}

fn load_cache(path: &Path) -> HashMap<String, f64> {
    if !path.exists() {
        return HashMap::new();
    }
    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from));
    match parsed {
        Ok(cache) => cache,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable throughput cache");
            HashMap::new()
        }
    }
}

fn save_cache(path: &Path, cache: &HashMap<String, f64>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(cache)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Simulated block peers.
//!
//! A [`SimBlock`] is a small deterministic, differentiable, causal layer over
//! hidden states `[batch, seq, hidden]`:
//!
//! ```text
//! m_t = mean(h_0 ..= h_t)                 (running mean, includes the cache)
//! z_t = a * h_t + bias + K * m_t
//! y_t = 0.5 * h_t + tanh(z_t)
//! ```
//!
//! Each hidden channel is independent. Because `y_t` depends only on
//! positions `<= t`, running a sequence in several cached steps gives the same
//! outputs as running it in one go, which is what inference sessions rely on.
//!
//! [`SimulatedPeer`] serves a contiguous range of such blocks through
//! [`RequestHandler`], with per-session caches, position checks and leases.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use hive_types::{BlockRange, BlockUid, HiveError, PeerId, RequestMetadata, RpcInfo, Tensor};

use crate::codec::{BlockRequest, BlockResponse, RemoteErrorKind};
use crate::compression::{deserialize_tensor, serialize_tensor, WireTensor};
use crate::transport::RequestHandler;

/// Weight of the causal running mean.
const COUPLING: f32 = 0.3;
/// Weight of the residual path.
const RESIDUAL: f32 = 0.5;

type SimResult<T> = std::result::Result<T, HiveError>;

// ── SimBlock ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimBlock {
    pub index: u32,
    a: f32,
    bias: f32,
}

/// Running per-channel sums of every position a block has seen.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCache {
    sum: Vec<f32>,
    len: usize,
}

impl BlockCache {
    pub fn new(batch: usize, hidden: usize) -> Self {
        Self { sum: vec![0.0; batch * hidden], len: 0 }
    }

    /// Positions absorbed so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn dims3(t: &Tensor) -> SimResult<(usize, usize, usize)> {
    match *t.shape() {
        [b, s, h] => Ok((b, s, h)),
        _ => Err(HiveError::Tensor(format!(
            "expected [batch, seq, hidden], got {:?}",
            t.shape()
        ))),
    }
}

impl SimBlock {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            a: 0.5 + 0.1 * (index % 5) as f32,
            bias: 0.02 * (index % 7) as f32 - 0.05,
        }
    }

    /// Blocks `range.start .. range.end`.
    pub fn range(range: BlockRange) -> Vec<SimBlock> {
        range.iter().map(SimBlock::new).collect()
    }

    /// Apply the block to `hidden`, continuing from `cache` if given.
    pub fn forward(&self, hidden: &Tensor, cache: Option<&mut BlockCache>) -> SimResult<Tensor> {
        let (batch, seq, width) = dims3(hidden)?;
        let mut scratch;
        let cache = match cache {
            Some(c) => c,
            None => {
                scratch = BlockCache::new(batch, width);
                &mut scratch
            }
        };
        if cache.sum.len() != batch * width {
            return Err(HiveError::Tensor(format!(
                "cache holds {} channels, input has {}",
                cache.sum.len(),
                batch * width
            )));
        }

        let x = hidden.data();
        let mut out = vec![0.0; x.len()];
        for b in 0..batch {
            for t in 0..seq {
                let count = (cache.len + t + 1) as f32;
                for c in 0..width {
                    let i = (b * seq + t) * width + c;
                    let sum = &mut cache.sum[b * width + c];
                    *sum += x[i];
                    let z = self.a * x[i] + self.bias + COUPLING * *sum / count;
                    out[i] = RESIDUAL * x[i] + z.tanh();
                }
            }
        }
        cache.len += seq;
        Tensor::new(hidden.shape().to_vec(), out)
    }

    /// Gradient with respect to `input` of `sum(grad_output * forward(input))`,
    /// for a forward pass that starts from an empty cache.
    pub fn backward(&self, input: &Tensor, grad_output: &Tensor) -> SimResult<Tensor> {
        let (batch, seq, width) = dims3(input)?;
        if grad_output.shape() != input.shape() {
            return Err(HiveError::Tensor(format!(
                "grad {:?} does not match input {:?}",
                grad_output.shape(),
                input.shape()
            )));
        }

        let x = input.data();
        let g = grad_output.data();
        let mut grad = vec![0.0; x.len()];
        let mut u = vec![0.0; seq];
        for b in 0..batch {
            for c in 0..width {
                let at = |t: usize| (b * seq + t) * width + c;
                let mut sum = 0.0;
                for (t, u_t) in u.iter_mut().enumerate() {
                    sum += x[at(t)];
                    let z = self.a * x[at(t)] + self.bias + COUPLING * sum / (t + 1) as f32;
                    let th = z.tanh();
                    *u_t = g[at(t)] * (1.0 - th * th);
                }
                // d m_t / d h_s = 1 / (t + 1) for every s <= t.
                let mut acc = 0.0;
                for t in (0..seq).rev() {
                    acc += u[t] / (t + 1) as f32;
                    grad[at(t)] = RESIDUAL * g[at(t)] + self.a * u[t] + COUPLING * acc;
                }
            }
        }
        Tensor::new(input.shape().to_vec(), grad)
    }
}

// ── Span execution ────────────────────────────────────────────────────────────

fn prompt_for(prompts: Option<&Tensor>, k: usize) -> SimResult<Option<Tensor>> {
    prompts.map(|p| p.select(k)).transpose()
}

/// Run `blocks` in order. Prompt entry `k` (`[batch, pre_seq, hidden]`) is
/// added to the hidden-state prefix before block `k`.
pub fn run_forward(blocks: &[SimBlock], hidden: &Tensor, prompts: Option<&Tensor>) -> SimResult<Tensor> {
    let mut h = hidden.clone();
    for (k, block) in blocks.iter().enumerate() {
        if let Some(p) = prompt_for(prompts, k)? {
            h.add_prefix(1, &p)?;
        }
        h = block.forward(&h, None)?;
    }
    Ok(h)
}

/// Gradients of a [`run_forward`] call: input gradient, and per-block prompt
/// gradients when prompts were used.
pub fn run_backward(
    blocks: &[SimBlock],
    inputs: &Tensor,
    grad_outputs: &Tensor,
    prompts: Option<&Tensor>,
) -> SimResult<(Tensor, Option<Tensor>)> {
    let mut block_inputs = Vec::with_capacity(blocks.len());
    let mut h = inputs.clone();
    for (k, block) in blocks.iter().enumerate() {
        if let Some(p) = prompt_for(prompts, k)? {
            h.add_prefix(1, &p)?;
        }
        let next = block.forward(&h, None)?;
        block_inputs.push(h);
        h = next;
    }

    let mut grad = grad_outputs.clone();
    let mut grad_prompts = Vec::new();
    for (k, block) in blocks.iter().enumerate().rev() {
        grad = block.backward(&block_inputs[k], &grad)?;
        if let Some(p) = prompts {
            let pre = p.size(2)?;
            grad_prompts.push(grad.narrow(1, 0, pre)?);
        }
    }
    if prompts.is_none() {
        return Ok((grad, None));
    }
    grad_prompts.reverse();
    Ok((grad, Some(Tensor::stack(&grad_prompts)?)))
}

// ── SimulatedPeer ─────────────────────────────────────────────────────────────

struct PeerSession {
    first: u32,
    caches: Vec<BlockCache>,
    position: usize,
    max_length: usize,
    lease: Duration,
    last_used: Instant,
}

type Reply<T> = std::result::Result<T, BlockResponse>;

fn reject(kind: RemoteErrorKind, message: impl Into<String>) -> BlockResponse {
    BlockResponse::error(kind, message)
}

/// A peer serving `blocks` of model `prefix`.
pub struct SimulatedPeer {
    peer_id: PeerId,
    prefix: String,
    blocks: BlockRange,
    hidden_size: usize,
    sessions: Mutex<HashMap<String, PeerSession>>,
}

impl SimulatedPeer {
    pub fn new(peer_id: impl Into<PeerId>, prefix: impl Into<String>, blocks: BlockRange, hidden_size: usize) -> Self {
        Self {
            peer_id: peer_id.into(),
            prefix: prefix.into(),
            blocks,
            hidden_size,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn blocks(&self) -> BlockRange {
        self.blocks
    }

    pub fn rpc_info(&self) -> RpcInfo {
        RpcInfo::hidden_states(self.hidden_size)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, PeerSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sessions currently holding cache on this peer.
    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions().contains_key(session_id)
    }

    /// Map `uids` to the contiguous local blocks they name.
    fn resolve(&self, uids: &[BlockUid]) -> Reply<Vec<SimBlock>> {
        let first = uids
            .first()
            .ok_or_else(|| reject(RemoteErrorKind::InvalidRequest, "empty uid list"))?;
        for (k, uid) in uids.iter().enumerate() {
            let contiguous = uid.index == first.index + k as u32;
            if uid.prefix != self.prefix || !self.blocks.contains(uid.index) || !contiguous {
                return Err(reject(
                    RemoteErrorKind::NotServed,
                    format!("{} does not serve {uid} as part of a contiguous span", self.peer_id),
                ));
            }
        }
        Ok(uids.iter().map(|u| SimBlock::new(u.index)).collect())
    }

    fn decode(&self, wire: &WireTensor, what: &str) -> Reply<Tensor> {
        deserialize_tensor(wire)
            .map_err(|e| reject(RemoteErrorKind::SchemaMismatch, format!("{what}: {e}")))
    }

    fn decode_hidden(&self, wire: &WireTensor, metadata: &RequestMetadata) -> Reply<Tensor> {
        if metadata.schema.trailing_shape != [self.hidden_size] {
            return Err(reject(
                RemoteErrorKind::SchemaMismatch,
                format!(
                    "declared schema {:?}, served blocks take [{}]",
                    metadata.schema.trailing_shape, self.hidden_size
                ),
            ));
        }
        let t = self.decode(wire, "hidden states")?;
        match *t.shape() {
            [_, _, h] if h == self.hidden_size => Ok(t),
            _ => Err(reject(
                RemoteErrorKind::SchemaMismatch,
                format!("hidden states {:?}, expected [batch, seq, {}]", t.shape(), self.hidden_size),
            )),
        }
    }

    fn check_mask(&self, mask: Option<&WireTensor>, hidden: &Tensor) -> Reply<()> {
        let Some(wire) = mask else { return Ok(()) };
        let mask = self.decode(wire, "attention mask")?;
        if mask.shape() != &hidden.shape()[..2] {
            return Err(reject(
                RemoteErrorKind::SchemaMismatch,
                format!("attention mask {:?} does not match hidden {:?}", mask.shape(), hidden.shape()),
            ));
        }
        Ok(())
    }

    fn decode_prompts(&self, prompts: Option<&WireTensor>, n_blocks: usize, hidden: &Tensor) -> Reply<Option<Tensor>> {
        let Some(wire) = prompts else { return Ok(None) };
        let p = self.decode(wire, "prompts")?;
        let ok = match *p.shape() {
            [n, b, pre, h] => n == n_blocks && b == hidden.shape()[0] && pre <= hidden.shape()[1] && h == self.hidden_size,
            _ => false,
        };
        if !ok {
            return Err(reject(
                RemoteErrorKind::SchemaMismatch,
                format!("prompts {:?} do not fit {n_blocks} blocks over {:?}", p.shape(), hidden.shape()),
            ));
        }
        Ok(Some(p))
    }

    fn internal(e: HiveError) -> BlockResponse {
        reject(RemoteErrorKind::Internal, e.to_string())
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.sessions().retain(|id, s| {
            let alive = now.duration_since(s.last_used) < s.lease;
            if !alive {
                info!(peer = %self.peer_id, session = %id, "session lease expired");
            }
            alive
        });
    }

    fn serve(&self, request: BlockRequest) -> Reply<BlockResponse> {
        match request {
            BlockRequest::Info { uid } => {
                self.resolve(std::slice::from_ref(&uid))?;
                Ok(BlockResponse::Info(self.rpc_info()))
            }

            BlockRequest::Forward { uids, hidden, attention_mask, prompts, metadata } => {
                let blocks = self.resolve(&uids)?;
                let hidden = self.decode_hidden(&hidden, &metadata)?;
                self.check_mask(attention_mask.as_ref(), &hidden)?;
                let prompts = self.decode_prompts(prompts.as_ref(), blocks.len(), &hidden)?;
                let outputs = run_forward(&blocks, &hidden, prompts.as_ref()).map_err(Self::internal)?;
                Ok(BlockResponse::Forward {
                    outputs: serialize_tensor(&outputs, metadata.output_compression),
                })
            }

            BlockRequest::Backward { uids, inputs, grad_outputs, attention_mask, prompts, metadata } => {
                let blocks = self.resolve(&uids)?;
                let inputs = self.decode_hidden(&inputs, &metadata)?;
                let grad_outputs = self.decode(&grad_outputs, "output gradients")?;
                if grad_outputs.shape() != inputs.shape() {
                    return Err(reject(
                        RemoteErrorKind::SchemaMismatch,
                        format!("gradients {:?} vs inputs {:?}", grad_outputs.shape(), inputs.shape()),
                    ));
                }
                self.check_mask(attention_mask.as_ref(), &inputs)?;
                let prompts = self.decode_prompts(prompts.as_ref(), blocks.len(), &inputs)?;
                let (grad_inputs, grad_prompts) =
                    run_backward(&blocks, &inputs, &grad_outputs, prompts.as_ref()).map_err(Self::internal)?;
                let c = metadata.output_compression;
                Ok(BlockResponse::Backward {
                    grad_inputs: serialize_tensor(&grad_inputs, c),
                    grad_prompts: grad_prompts.map(|g| serialize_tensor(&g, c)),
                })
            }

            BlockRequest::InferenceStep { uids, session_id, start_position, max_length, lease_ms, hidden, metadata } => {
                self.evict_expired();
                let blocks = self.resolve(&uids)?;
                let hidden = self.decode_hidden(&hidden, &metadata)?;
                let (batch, seq, width) = dims3(&hidden).map_err(Self::internal)?;
                let start = start_position as usize;

                let mut sessions = self.sessions();
                if !sessions.contains_key(&session_id) {
                    if start != 0 {
                        return Err(reject(
                            RemoteErrorKind::SessionState,
                            format!("unknown session {session_id} at position {start}"),
                        ));
                    }
                    debug!(peer = %self.peer_id, session = %session_id, blocks = blocks.len(), "opening session");
                    sessions.insert(
                        session_id.clone(),
                        PeerSession {
                            first: blocks[0].index,
                            caches: vec![BlockCache::new(batch, width); blocks.len()],
                            position: 0,
                            max_length: max_length as usize,
                            lease: Duration::from_millis(lease_ms),
                            last_used: Instant::now(),
                        },
                    );
                }
                let Some(session) = sessions.get_mut(&session_id) else {
                    return Err(reject(RemoteErrorKind::Internal, "session vanished"));
                };
                if session.first != blocks[0].index || session.caches.len() != blocks.len() {
                    return Err(reject(
                        RemoteErrorKind::SessionState,
                        format!("session {session_id} was opened for other blocks"),
                    ));
                }
                if session.position != start {
                    return Err(reject(
                        RemoteErrorKind::SessionState,
                        format!("session {session_id} is at position {}, got {start}", session.position),
                    ));
                }
                if start + seq > session.max_length {
                    return Err(reject(
                        RemoteErrorKind::InvalidRequest,
                        format!("{} positions exceed max_length {}", start + seq, session.max_length),
                    ));
                }

                let mut h = hidden;
                for (block, cache) in blocks.iter().zip(session.caches.iter_mut()) {
                    h = block.forward(&h, Some(cache)).map_err(Self::internal)?;
                }
                session.position += seq;
                session.last_used = Instant::now();
                Ok(BlockResponse::InferenceStep {
                    outputs: serialize_tensor(&h, metadata.output_compression),
                })
            }

            BlockRequest::CloseSession { session_id } => {
                if self.sessions().remove(&session_id).is_some() {
                    debug!(peer = %self.peer_id, session = %session_id, "session closed");
                }
                Ok(BlockResponse::Closed)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for SimulatedPeer {
    async fn handle(&self, request: BlockRequest) -> BlockResponse {
        self.serve(request).unwrap_or_else(|reply| reply)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Stateful incremental decoding over a pinned chain of peers.
//!
//! Open → Stepping → Open | Recovering → Open | Failed → Closed
//!
//! Every span keeps the hidden states it has been fed so far. When a peer
//! fails mid-step only that span's range is re-planned; the first replacement
//! inherits the recorded history and replays it to rebuild the peer-side
//! cache, later replacements are fed the replayed outputs. Spans before the
//! failure keep their peer and cache.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hive_net::{deserialize_tensor, serialize_tensor, BlockRequest, BlockResponse};
use hive_types::{BlockRange, PeerId, Protocol, SessionConfig, Tensor};

use crate::error::{Result, RoutingError};
use crate::manager::SequenceManager;
use crate::sequence::{RoutingMode, Span};

// ── Session State Machine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for the next step.
    Open,
    /// A step is in flight.
    Stepping,
    /// A step is replacing a failed span.
    Recovering,
    /// A step failed or was abandoned; peer-side state has been released.
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open       => write!(f, "Open"),
            Self::Stepping   => write!(f, "Stepping"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Failed     => write!(f, "Failed"),
            Self::Closed     => write!(f, "Closed"),
        }
    }
}

// ── Per-span state ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct SpanSession {
    span: Span,
    /// Peer-side session id; fresh for every peer binding.
    session_id: String,
    /// Every input this span has been fed, `[batch, len, hidden]`.
    history: Option<Tensor>,
    /// Positions the peer holds in its cache.
    position: usize,
    contacted: bool,
}

impl SpanSession {
    fn new(span: Span) -> Self {
        Self {
            span,
            session_id: Uuid::new_v4().to_string(),
            history: None,
            position: 0,
            contacted: false,
        }
    }

    fn history_len(&self) -> Result<usize> {
        match &self.history {
            Some(h) => Ok(h.size(1)?),
            None => Ok(0),
        }
    }
}

/// Outputs of one span covering positions `start ..`.
struct Carry {
    start: usize,
    hidden: Tensor,
}

/// Positions travel as `u32` on the wire.
fn wire_position(position: usize) -> Result<u32> {
    u32::try_from(position)
        .map_err(|_| RoutingError::InvalidRequest(format!("position {position} does not fit in u32")))
}

// ── InferenceSession ─────────────────────────────────────────────────────────

pub struct InferenceSession {
    manager: Arc<SequenceManager>,
    range: BlockRange,
    mode: RoutingMode,
    max_length: usize,
    config: SessionConfig,
    spans: Vec<SpanSession>,
    position: usize,
    steps: u64,
    state: SessionState,
}

impl InferenceSession {
    /// Pin a chain over `range` for up to `max_length` positions.
    pub async fn open(
        manager: Arc<SequenceManager>,
        range: BlockRange,
        mode: RoutingMode,
        max_length: usize,
        config: SessionConfig,
    ) -> Result<Self> {
        if max_length == 0 {
            return Err(RoutingError::InvalidRequest("max_length must be positive".into()));
        }
        wire_position(max_length)?;
        let sequence = manager.make_sequence(range, mode).await?;
        info!(blocks = %range, route = %sequence, max_length, "inference session opened");
        Ok(Self {
            manager,
            range,
            mode,
            max_length,
            config,
            spans: sequence.into_spans().into_iter().map(SpanSession::new).collect(),
            position: 0,
            steps: 0,
            state: SessionState::Open,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Positions processed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    /// The chain currently pinned.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.iter().map(|s| s.span.clone()).collect()
    }

    /// Feed `inputs` (`[batch, k, hidden]`) through the chain and return the
    /// final hidden states for those `k` positions.
    pub async fn step(&mut self, inputs: &Tensor) -> Result<Tensor> {
        match self.state {
            SessionState::Open => {}
            SessionState::Stepping | SessionState::Recovering => {
                // The previous step was dropped mid-flight; peer caches are
                // in an unknown state.
                warn!(blocks = %self.range, "previous step was interrupted, failing session");
                self.fail().await;
                return Err(RoutingError::SessionClosed("previous step was interrupted".into()));
            }
            SessionState::Failed | SessionState::Closed => {
                return Err(RoutingError::SessionClosed(format!("session is {}", self.state)));
            }
        }

        let k = match *inputs.shape() {
            [_, k, _] if k > 0 => k,
            _ => {
                return Err(RoutingError::InvalidRequest(format!(
                    "step inputs must be [batch, k > 0, hidden], got {:?}",
                    inputs.shape()
                )))
            }
        };
        if self.position + k > self.max_length {
            return Err(RoutingError::InvalidRequest(format!(
                "{} positions exceed max_length {}",
                self.position + k,
                self.max_length
            )));
        }
        if let Some(h) = self.spans.first().and_then(|s| s.history.as_ref()) {
            if h.shape()[0] != inputs.shape()[0] || h.shape()[2] != inputs.shape()[2] {
                return Err(RoutingError::InvalidRequest(format!(
                    "step inputs {:?} do not continue history {:?}",
                    inputs.shape(),
                    h.shape()
                )));
            }
        }

        self.state = SessionState::Stepping;
        match self.run_step(inputs).await {
            Ok(outputs) => {
                self.position += k;
                self.steps += 1;
                self.state = SessionState::Open;
                Ok(outputs)
            }
            Err(e) => {
                warn!(blocks = %self.range, error = %e, "inference step failed");
                self.fail().await;
                Err(e)
            }
        }
    }

    async fn run_step(&mut self, inputs: &Tensor) -> Result<Tensor> {
        let step_id = self.steps.to_string();
        let mut carry = Carry { start: self.position, hidden: inputs.clone() };
        let mut recoveries = 0u32;
        let mut i = 0;

        while i < self.spans.len() {
            match self.step_span(i, &carry, &step_id).await {
                Ok(next) => {
                    carry = next;
                    i += 1;
                }
                Err(e) if e.is_retryable() => {
                    recoveries += 1;
                    if recoveries > self.config.max_recoveries {
                        return Err(RoutingError::ChainExecutionFailed {
                            attempts: recoveries,
                            last_error: e.to_string(),
                        });
                    }
                    self.state = SessionState::Recovering;
                    tokio::time::sleep(self.manager.config().backoff(recoveries - 1)).await;
                    self.replace_span(i).await?;
                    self.state = SessionState::Stepping;
                }
                Err(e) => return Err(e),
            }
        }

        let k = inputs.size(1)?;
        let offset = self.position - carry.start;
        Ok(carry.hidden.narrow(1, offset, k)?)
    }

    /// Send span `i` everything it has not processed yet. On success the
    /// span's history and position advance and its outputs become the next
    /// carry.
    async fn step_span(&mut self, i: usize, carry: &Carry, step_id: &str) -> Result<Carry> {
        let span = &self.spans[i];
        let known = span.history_len()?;
        if known < carry.start {
            return Err(RoutingError::InvalidRequest(format!(
                "span {} history ends at {known}, inputs start at {}",
                span.span, carry.start
            )));
        }
        let full = match (&span.history, carry.start) {
            (_, 0) | (None, _) => carry.hidden.clone(),
            (Some(h), start) => Tensor::cat(&[h.narrow(1, 0, start)?, carry.hidden.clone()], 1)?,
        };
        let end = full.size(1)?;
        let start = span.position;
        let pending = full.narrow(1, start, end - start)?;

        let metadata = self
            .manager
            .get_request_metadata(Protocol::Inference, Some(&span.session_id), Some(step_id))
            .await?;
        let request = BlockRequest::InferenceStep {
            uids: self.manager.uids(span.span.range)?,
            session_id: span.session_id.clone(),
            start_position: wire_position(start)?,
            max_length: wire_position(self.max_length)?,
            lease_ms: self.config.lease_ms,
            hidden: serialize_tensor(&pending, metadata.input_compression),
            metadata,
        };
        let peer = span.span.peer_id().clone();
        debug!(peer = %peer, blocks = %span.span.range, start, len = end - start, "inference hop");

        self.spans[i].contacted = true;
        let outputs = match self.manager.call(&peer, request).await? {
            BlockResponse::InferenceStep { outputs } => {
                deserialize_tensor(&outputs).map_err(|e| RoutingError::from_hop(&peer, e))?
            }
            other => {
                return Err(RoutingError::HopUnreachable {
                    peer,
                    reason: format!("unexpected {} reply to inference step", other.kind()),
                })
            }
        };
        if outputs.shape() != pending.shape() {
            return Err(RoutingError::HopUnreachable {
                peer,
                reason: format!("reply shape {:?}, expected {:?}", outputs.shape(), pending.shape()),
            });
        }

        let span = &mut self.spans[i];
        span.history = Some(full);
        span.position = end;
        Ok(Carry { start, hidden: outputs })
    }

    /// Swap span `i` for a fresh plan over its range.
    async fn replace_span(&mut self, i: usize) -> Result<()> {
        let range = self.spans[i].span.range;
        let sequence = self.manager.make_sequence(range, self.mode).await?;
        let old = self.spans.remove(i);
        info!(
            blocks = %range,
            failed = %old.span.peer_id(),
            route = %sequence,
            "replacing failed span"
        );
        if old.contacted {
            self.release_later(vec![(old.span.peer_id().clone(), old.session_id)]);
        }

        let mut replacement: Vec<SpanSession> =
            sequence.into_spans().into_iter().map(SpanSession::new).collect();
        if let Some(first) = replacement.first_mut() {
            first.history = old.history;
        }
        self.spans.splice(i..i, replacement);
        Ok(())
    }

    /// Release every peer-side session and mark the session failed.
    async fn fail(&mut self) {
        self.release_all().await;
        self.state = SessionState::Failed;
    }

    async fn release_all(&mut self) {
        let calls = self.spans.iter_mut().filter(|s| s.contacted).map(|span| {
            span.contacted = false;
            let peer = span.span.peer_id().clone();
            let session_id = span.session_id.clone();
            let manager = &self.manager;
            async move {
                let request = BlockRequest::CloseSession { session_id: session_id.clone() };
                match manager.call(&peer, request).await {
                    Ok(_) => debug!(peer = %peer, session = %session_id, "peer session released"),
                    Err(e) => debug!(peer = %peer, error = %e, "could not release peer session"),
                }
            }
        });
        join_all(calls).await;
    }

    /// Best-effort release from contexts that cannot await.
    fn release_later(&self, sessions: Vec<(PeerId, String)>) {
        if sessions.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(count = sessions.len(), "no runtime to release peer sessions; leases will reclaim them");
            return;
        };
        let manager = self.manager.clone();
        handle.spawn(async move {
            for (peer, session_id) in sessions {
                if let Err(e) = manager.call(&peer, BlockRequest::CloseSession { session_id }).await {
                    debug!(peer = %peer, error = %e, "could not release peer session");
                }
            }
        });
    }

    /// Release all peer-side state. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.release_all().await;
        self.state = SessionState::Closed;
        info!(blocks = %self.range, steps = self.steps, "inference session closed");
        Ok(())
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        let contacted: Vec<(PeerId, String)> = self
            .spans
            .iter()
            .filter(|s| s.contacted)
            .map(|s| (s.span.peer_id().clone(), s.session_id.clone()))
            .collect();
        self.release_later(contacted);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

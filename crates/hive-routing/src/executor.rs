//! Running forward and backward passes over a chain of remote spans.
//!
//! Forward feeds each span's output into the next, carrying the attention
//! mask unchanged and handing every span its slice of the per-block prompts.
//! The input each span received is recorded in the [`ForwardPass`] so that
//! backward can walk the spans in reverse without recomputing anything.
//!
//! A failed hop bans the peer, re-plans from the failed span onward and
//! resumes there; completed spans are never re-executed.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use hive_net::{deserialize_tensor, serialize_tensor, BlockRequest, BlockResponse};
use hive_types::{BlockRange, CompressionType, Protocol, Tensor};

use crate::error::{Result, RoutingError};
use crate::manager::SequenceManager;
use crate::sequence::{RoutingMode, Span};

// ── Results ───────────────────────────────────────────────────────────────────

/// One executed span and the hidden states it was given.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub span: Span,
    pub inputs: Tensor,
}

/// Outcome of [`ChainExecutor::forward`], consumed by
/// [`ChainExecutor::backward`].
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub range: BlockRange,
    pub outputs: Tensor,
    pub trace: Vec<TraceEntry>,
    pub prompts: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
}

impl ForwardPass {
    /// Spans that produced the outputs, in order.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.trace.iter().map(|t| &t.span)
    }
}

#[derive(Debug, Clone)]
pub struct Gradients {
    /// Same shape as the forward inputs.
    pub grad_inputs: Tensor,
    /// Same shape as the forward prompts, when prompts were used.
    pub grad_prompts: Option<Tensor>,
}

// ── ChainExecutor ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ChainExecutor {
    manager: Arc<SequenceManager>,
    mode: RoutingMode,
}

impl ChainExecutor {
    pub fn new(manager: Arc<SequenceManager>, mode: RoutingMode) -> Self {
        Self { manager, mode }
    }

    pub fn manager(&self) -> &Arc<SequenceManager> {
        &self.manager
    }

    /// Run blocks `range` over `inputs` (`[batch, seq, hidden]`).
    ///
    /// `prompts` is `[range.len(), batch, pre_seq, hidden]`; `attention_mask`
    /// is `[batch, seq]`.
    pub async fn forward(
        &self,
        range: BlockRange,
        inputs: &Tensor,
        prompts: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> Result<ForwardPass> {
        check_inputs(range, inputs, prompts, attention_mask)?;
        let (outputs, trace) = self
            .run_chain(range, range, inputs.clone(), prompts, attention_mask)
            .await?;
        Ok(ForwardPass {
            range,
            outputs,
            trace,
            prompts: prompts.cloned(),
            attention_mask: attention_mask.cloned(),
        })
    }

    /// Gradients of `pass` given the gradient of its outputs.
    pub async fn backward(&self, pass: &ForwardPass, grad_outputs: &Tensor) -> Result<Gradients> {
        if grad_outputs.shape() != pass.outputs.shape() {
            return Err(RoutingError::InvalidRequest(format!(
                "output gradient {:?} does not match outputs {:?}",
                grad_outputs.shape(),
                pass.outputs.shape()
            )));
        }
        let config = self.manager.config();
        let prompts = pass.prompts.as_ref();
        let mask = pass.attention_mask.as_ref();

        let mut pending = pass.trace.clone();
        let mut grad = grad_outputs.clone();
        let mut prompt_grads: Vec<(u32, Tensor)> = Vec::new();
        let mut attempt = 0u32;

        while let Some(entry) = pending.pop() {
            match self.backward_span(pass.range, &entry, &grad, prompts, mask).await {
                Ok((grad_inputs, grad_prompts)) => {
                    grad = grad_inputs;
                    if let Some(g) = grad_prompts {
                        prompt_grads.push((entry.span.range.start, g));
                    }
                    attempt = 0;
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        return Err(RoutingError::ChainExecutionFailed {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(config.backoff(attempt - 1)).await;
                    info!(
                        blocks = %entry.span.range,
                        failed = %entry.span.peer_id(),
                        attempt,
                        "re-planning span for backward"
                    );
                    // Replacement spans need their own inputs: replay forward
                    // through them from the recorded span input.
                    let (_, replay) = self
                        .run_chain(pass.range, entry.span.range, entry.inputs, prompts, mask)
                        .await?;
                    pending.extend(replay);
                }
                Err(e) => return Err(e),
            }
        }

        let grad_prompts = if prompt_grads.is_empty() {
            None
        } else {
            prompt_grads.sort_by_key(|(start, _)| *start);
            let parts: Vec<Tensor> = prompt_grads.into_iter().map(|(_, g)| g).collect();
            Some(Tensor::cat(&parts, 0)?)
        };
        Ok(Gradients { grad_inputs: grad, grad_prompts })
    }

    /// Forward through `sub`, a part of `outer`, re-planning on hop failures.
    /// Prompts are indexed relative to `outer`.
    async fn run_chain(
        &self,
        outer: BlockRange,
        sub: BlockRange,
        inputs: Tensor,
        prompts: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<TraceEntry>)> {
        let config = self.manager.config();
        let mut pending: VecDeque<Span> = self.manager.make_sequence(sub, self.mode).await?.into_spans().into();
        let mut trace = Vec::with_capacity(pending.len());
        let mut hidden = inputs;
        let mut attempt = 0u32;

        while let Some(span) = pending.pop_front() {
            match self.forward_span(outer, &span, &hidden, prompts, mask).await {
                Ok(outputs) => {
                    let inputs = std::mem::replace(&mut hidden, outputs);
                    trace.push(TraceEntry { span, inputs });
                    attempt = 0;
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        return Err(RoutingError::ChainExecutionFailed {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(config.backoff(attempt - 1)).await;
                    let remaining = BlockRange { start: span.range.start, end: sub.end };
                    info!(blocks = %remaining, failed = %span.peer_id(), attempt, "re-planning forward");
                    pending = self.manager.make_sequence(remaining, self.mode).await?.into_spans().into();
                }
                Err(e) => return Err(e),
            }
        }
        Ok((hidden, trace))
    }

    async fn forward_span(
        &self,
        outer: BlockRange,
        span: &Span,
        hidden: &Tensor,
        prompts: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let metadata = self.manager.get_request_metadata(Protocol::Forward, None, None).await?;
        let c = metadata.input_compression;
        let prompts = span_prompts(outer, span, prompts)?;
        let request = BlockRequest::Forward {
            uids: self.manager.uids(span.range)?,
            hidden: serialize_tensor(hidden, c),
            attention_mask: mask.map(|m| serialize_tensor(m, CompressionType::None)),
            prompts: prompts.map(|p| serialize_tensor(&p, c)),
            metadata,
        };
        debug!(peer = %span.peer_id(), blocks = %span.range, "forward hop");
        match self.manager.call(span.peer_id(), request).await? {
            BlockResponse::Forward { outputs } => decode_like(span, &outputs, hidden),
            other => Err(unexpected(span, other, "forward")),
        }
    }

    async fn backward_span(
        &self,
        outer: BlockRange,
        entry: &TraceEntry,
        grad_outputs: &Tensor,
        prompts: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let span = &entry.span;
        let metadata = self.manager.get_request_metadata(Protocol::Backward, None, None).await?;
        let c = metadata.input_compression;
        let prompts = span_prompts(outer, span, prompts)?;
        let request = BlockRequest::Backward {
            uids: self.manager.uids(span.range)?,
            inputs: serialize_tensor(&entry.inputs, c),
            grad_outputs: serialize_tensor(grad_outputs, c),
            attention_mask: mask.map(|m| serialize_tensor(m, CompressionType::None)),
            prompts: prompts.as_ref().map(|p| serialize_tensor(p, c)),
            metadata,
        };
        debug!(peer = %span.peer_id(), blocks = %span.range, "backward hop");
        match self.manager.call(span.peer_id(), request).await? {
            BlockResponse::Backward { grad_inputs, grad_prompts } => {
                let grad_inputs = decode_like(span, &grad_inputs, &entry.inputs)?;
                let grad_prompts = match (grad_prompts, prompts) {
                    (Some(wire), Some(p)) => Some(decode_like(span, &wire, &p)?),
                    (None, None) => None,
                    _ => {
                        return Err(RoutingError::HopUnreachable {
                            peer: span.peer_id().clone(),
                            reason: "prompt gradients missing or unexpected".into(),
                        })
                    }
                };
                Ok((grad_inputs, grad_prompts))
            }
            other => Err(unexpected(span, other, "backward")),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn check_inputs(
    range: BlockRange,
    inputs: &Tensor,
    prompts: Option<&Tensor>,
    mask: Option<&Tensor>,
) -> Result<()> {
    let [batch, seq, hidden] = *inputs.shape() else {
        return Err(RoutingError::InvalidRequest(format!(
            "inputs must be [batch, seq, hidden], got {:?}",
            inputs.shape()
        )));
    };
    if let Some(p) = prompts {
        let fits = matches!(*p.shape(), [n, b, pre, h] if n == range.len() as usize && b == batch && pre <= seq && h == hidden);
        if !fits {
            return Err(RoutingError::InvalidRequest(format!(
                "prompts {:?} do not fit {} blocks over inputs {:?}",
                p.shape(),
                range.len(),
                inputs.shape()
            )));
        }
    }
    if let Some(m) = mask {
        if m.shape() != [batch, seq] {
            return Err(RoutingError::InvalidRequest(format!(
                "attention mask {:?}, expected [{batch}, {seq}]",
                m.shape()
            )));
        }
    }
    Ok(())
}

/// The slice of `prompts` for the blocks of `span`.
fn span_prompts(outer: BlockRange, span: &Span, prompts: Option<&Tensor>) -> Result<Option<Tensor>> {
    let Some(p) = prompts else { return Ok(None) };
    let rel = outer.relative(&span.range);
    Ok(Some(p.narrow(0, rel.start, rel.len())?))
}

/// Decode a peer reply that must have the same shape as `like`.
fn decode_like(span: &Span, wire: &hive_net::WireTensor, like: &Tensor) -> Result<Tensor> {
    let t = deserialize_tensor(wire).map_err(|e| RoutingError::from_hop(span.peer_id(), e))?;
    if t.shape() != like.shape() {
        return Err(RoutingError::HopUnreachable {
            peer: span.peer_id().clone(),
            reason: format!("reply shape {:?}, expected {:?}", t.shape(), like.shape()),
        });
    }
    Ok(t)
}

fn unexpected(span: &Span, reply: BlockResponse, call: &str) -> RoutingError {
    RoutingError::HopUnreachable {
        peer: span.peer_id().clone(),
        reason: format!("unexpected {} reply to {call}", reply.kind()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use hive_net::{run_backward, run_forward, Fault, SimBlock};
    use hive_types::{PeerId, RoutingConfig};

    use crate::compression::ProtocolCompression;
    use crate::testing::{fast_retries, random, Swarm, HIDDEN};

    fn range(start: u32, end: u32) -> BlockRange {
        BlockRange { start, end }
    }

    fn ids(pass: &ForwardPass) -> Vec<&str> {
        pass.spans().map(|s| s.peer_id().as_str()).collect()
    }

    #[tokio::test]
    async fn forward_and_backward_match_local_blocks() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 1.0)]);
        let exec = ChainExecutor::new(s.manager(RoutingConfig::default()), RoutingMode::Fastest);
        let r = range(2, 9);
        let x = random(&[2, 4, HIDDEN], 1, 1.0);
        let prompts = random(&[7, 2, 2, HIDDEN], 2, 0.1);
        let mask = Tensor::new(vec![2, 4], vec![1.0; 8]).unwrap();

        let pass = exec.forward(r, &x, Some(&prompts), Some(&mask)).await.unwrap();
        assert_eq!(ids(&pass), vec!["A", "B"]);
        let blocks = SimBlock::range(r);
        let expected = run_forward(&blocks, &x, Some(&prompts)).unwrap();
        assert!(pass.outputs.allclose(&expected, 1e-5));

        let g = random(&[2, 4, HIDDEN], 3, 1.0);
        let grads = exec.backward(&pass, &g).await.unwrap();
        let (grad_x, grad_p) = run_backward(&blocks, &x, &g, Some(&prompts)).unwrap();
        assert!(grads.grad_inputs.allclose(&grad_x, 1e-4));
        let got_p = grads.grad_prompts.unwrap();
        assert_eq!(got_p.shape(), prompts.shape());
        assert!(got_p.allclose(&grad_p.unwrap(), 1e-4));
    }

    #[tokio::test]
    async fn failed_peer_is_replanned_mid_chain() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 5.0), ("C", 5, 10, 1.0)]);
        s.transport.inject("B", Fault::Offline);
        let exec = ChainExecutor::new(s.manager(fast_retries()), RoutingMode::Fastest);
        let x = random(&[1, 3, HIDDEN], 4, 1.0);

        let pass = exec.forward(range(0, 10), &x, None, None).await.unwrap();
        assert_eq!(ids(&pass), vec!["A", "C"]);
        let expected = run_forward(&SimBlock::range(range(0, 10)), &x, None).unwrap();
        assert!(pass.outputs.allclose(&expected, 1e-5));

        assert_eq!(s.transport.call_count(&PeerId::from("A"), "forward"), 1);
        assert_eq!(s.transport.call_count(&PeerId::from("B"), "forward"), 1);
        assert_eq!(s.transport.call_count(&PeerId::from("C"), "forward"), 1);
        assert!(exec.manager().directory().is_banned(&PeerId::from("B")));
    }

    #[tokio::test]
    async fn backward_replays_replacement_span() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 5.0), ("C", 5, 10, 1.0)]);
        let exec = ChainExecutor::new(s.manager(fast_retries()), RoutingMode::Fastest);
        let r = range(0, 10);
        let x = random(&[1, 3, HIDDEN], 5, 1.0);
        let pass = exec.forward(r, &x, None, None).await.unwrap();
        assert_eq!(ids(&pass), vec!["A", "B"]);

        s.transport.inject("B", Fault::Offline);
        let g = random(&[1, 3, HIDDEN], 6, 1.0);
        let grads = exec.backward(&pass, &g).await.unwrap();
        let (expected, _) = run_backward(&SimBlock::range(r), &x, &g, None).unwrap();
        assert!(grads.grad_inputs.allclose(&expected, 1e-4));
        assert!(grads.grad_prompts.is_none());

        let c = PeerId::from("C");
        assert_eq!(s.transport.call_count(&c, "forward"), 1);
        assert_eq!(s.transport.call_count(&c, "backward"), 1);
        assert_eq!(s.transport.call_count(&PeerId::from("A"), "forward"), 1);
    }

    #[tokio::test]
    async fn schema_mismatch_is_not_retried() {
        let mut s = Swarm::new(&[("A", 0, 5, 1.0)]);
        s.add("B", range(5, 10), 1.0, HIDDEN - 2);
        let exec = ChainExecutor::new(s.manager(fast_retries()), RoutingMode::Fastest);
        let x = random(&[1, 2, HIDDEN], 7, 1.0);

        let err = exec.forward(range(0, 10), &x, None, None).await.unwrap_err();
        assert!(matches!(err, RoutingError::SchemaMismatch(_)), "{err}");
        assert_eq!(s.transport.call_count(&PeerId::from("B"), "forward"), 1);
        assert!(!exec.manager().directory().is_banned(&PeerId::from("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let s = Swarm::new(&[("A", 0, 10, 1.0)]);
        let config = RoutingConfig { ban_timeout_ms: 0, max_retries: 2, ..fast_retries() };
        let exec = ChainExecutor::new(s.manager(config), RoutingMode::Fastest);
        let x = random(&[1, 2, HIDDEN], 8, 1.0);
        exec.forward(range(0, 10), &x, None, None).await.unwrap();

        s.transport.inject("A", Fault::Offline);
        let err = exec.forward(range(0, 10), &x, None, None).await.unwrap_err();
        assert!(matches!(err, RoutingError::ChainExecutionFailed { attempts: 3, .. }), "{err}");
        assert_eq!(s.transport.call_count(&PeerId::from("A"), "forward"), 4);
    }

    #[tokio::test]
    async fn replan_without_candidates_is_terminal() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 1.0)]);
        s.transport.inject("B", Fault::Offline);
        let exec = ChainExecutor::new(s.manager(fast_retries()), RoutingMode::Fastest);
        let x = random(&[1, 2, HIDDEN], 9, 1.0);

        let err = exec.forward(range(0, 10), &x, None, None).await.unwrap_err();
        assert!(matches!(err, RoutingError::NoPeersAvailable { block: 5 }), "{err}");
        assert_eq!(s.transport.call_count(&PeerId::from("B"), "forward"), 1);
    }

    #[tokio::test]
    async fn lossy_compression_stays_close() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 1.0)]);
        let manager = s.manager_with(RoutingConfig::default(), Arc::new(ProtocolCompression::lossy()));
        let exec = ChainExecutor::new(manager, RoutingMode::Fastest);
        let r = range(0, 10);
        let blocks = SimBlock::range(r);
        let x = random(&[2, 6, HIDDEN], 10, 1.0);

        let pass = exec.forward(r, &x, None, None).await.unwrap();
        let expected = run_forward(&blocks, &x, None).unwrap();
        assert!(pass.outputs.max_abs_diff(&expected).unwrap() > 1e-4);
        assert!(pass.outputs.mean_abs_diff(&expected).unwrap() < 0.01);

        let g = random(&[2, 6, HIDDEN], 11, 0.1);
        let grads = exec.backward(&pass, &g).await.unwrap();
        let (grad_x, _) = run_backward(&blocks, &x, &g, None).unwrap();
        assert!(grads.grad_inputs.max_abs_diff(&grad_x).unwrap() > 1e-5);
        assert!(grads.grad_inputs.mean_abs_diff(&grad_x).unwrap() < 0.01);
    }

    #[tokio::test]
    async fn bad_shapes_are_rejected_before_any_call() {
        let s = Swarm::new(&[("A", 0, 10, 1.0)]);
        let exec = ChainExecutor::new(s.manager(RoutingConfig::default()), RoutingMode::Fastest);
        let x = random(&[1, 3, HIDDEN], 12, 1.0);

        let prompts = random(&[4, 1, 2, HIDDEN], 13, 0.1);
        let err = exec.forward(range(0, 5), &x, Some(&prompts), None).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));

        let mask = Tensor::new(vec![1, 2], vec![1.0; 2]).unwrap();
        let err = exec.forward(range(0, 5), &x, None, Some(&mask)).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));
        assert!(s.transport.calls().is_empty());

        let pass = exec.forward(range(0, 5), &x, None, None).await.unwrap();
        let err = exec.backward(&pass, &random(&[1, 2, HIDDEN], 14, 1.0)).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));
    }
}

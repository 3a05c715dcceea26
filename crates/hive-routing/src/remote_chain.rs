//! A contiguous run of remote blocks that callers can treat like one layer.

use std::sync::Arc;

use hive_types::{BlockRange, SessionConfig, Tensor};

use crate::error::Result;
use crate::executor::{ChainExecutor, ForwardPass, Gradients};
use crate::manager::SequenceManager;
use crate::sequence::RoutingMode;
use crate::session::InferenceSession;

/// Blocks `range` of the model served by the swarm behind `manager`.
///
/// Cheap to clone; every clone and every slice shares the manager.
#[derive(Clone)]
pub struct RemoteChain {
    executor: ChainExecutor,
    range: BlockRange,
    mode: RoutingMode,
    session_config: SessionConfig,
}

impl RemoteChain {
    /// The whole model.
    pub fn new(manager: Arc<SequenceManager>, mode: RoutingMode) -> Result<Self> {
        let range = manager.directory().full_range()?;
        Ok(Self {
            executor: ChainExecutor::new(manager, mode),
            range,
            mode,
            session_config: SessionConfig::default(),
        })
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn len(&self) -> u32 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn manager(&self) -> &Arc<SequenceManager> {
        self.executor.manager()
    }

    /// Blocks `start..end`, counted from the start of this chain.
    pub fn slice(&self, start: u32, end: u32) -> Result<Self> {
        Ok(Self { range: self.range.slice(start, end)?, ..self.clone() })
    }

    /// `prompts` has one entry per block of this chain.
    pub async fn forward(
        &self,
        inputs: &Tensor,
        prompts: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> Result<ForwardPass> {
        self.executor.forward(self.range, inputs, prompts, attention_mask).await
    }

    pub async fn backward(&self, pass: &ForwardPass, grad_outputs: &Tensor) -> Result<Gradients> {
        self.executor.backward(pass, grad_outputs).await
    }

    pub async fn inference_session(&self, max_length: usize) -> Result<InferenceSession> {
        InferenceSession::open(
            self.manager().clone(),
            self.range,
            self.mode,
            max_length,
            self.session_config.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hive_net::{run_forward, SimBlock};
    use hive_types::RoutingConfig;

    use crate::error::RoutingError;
    use crate::testing::{random, Swarm, HIDDEN};

    fn chain(s: &Swarm) -> RemoteChain {
        RemoteChain::new(s.manager(RoutingConfig::default()), RoutingMode::Fastest).unwrap()
    }

    #[tokio::test]
    async fn halves_compose_to_the_whole() {
        let s = Swarm::new(&[("A", 0, 4, 1.0), ("B", 3, 8, 1.0), ("C", 6, 10, 1.0)]);
        let whole = chain(&s);
        assert_eq!(whole.range(), BlockRange { start: 0, end: 10 });
        let x = random(&[1, 3, HIDDEN], 1, 1.0);

        let full = whole.forward(&x, None, None).await.unwrap();
        let head = whole.slice(0, 6).unwrap();
        let tail = whole.slice(6, 10).unwrap();
        assert_eq!(tail.range(), BlockRange { start: 6, end: 10 });
        let mid = head.forward(&x, None, None).await.unwrap();
        let out = tail.forward(&mid.outputs, None, None).await.unwrap();
        assert!(out.outputs.allclose(&full.outputs, 1e-5));
        assert!(full.outputs.allclose(&run_forward(&SimBlock::range(whole.range()), &x, None).unwrap(), 1e-5));
    }

    #[tokio::test]
    async fn nested_slices_are_relative() {
        let s = Swarm::new(&[("A", 0, 10, 1.0)]);
        let inner = chain(&s).slice(2, 8).unwrap().slice(1, 3).unwrap();
        assert_eq!(inner.range(), BlockRange { start: 3, end: 5 });
        assert_eq!(inner.len(), 2);
        assert!(matches!(chain(&s).slice(4, 11), Err(RoutingError::InvalidRequest(_))));
        assert!(chain(&s).slice(5, 5).is_err());
    }

    #[tokio::test]
    async fn sliced_session_covers_only_its_blocks() {
        let s = Swarm::new(&[("A", 0, 5, 1.0), ("B", 5, 10, 1.0)]);
        let tail = chain(&s).slice(5, 10).unwrap();
        let mut session = tail.inference_session(4).await.unwrap();
        let x = random(&[1, 2, HIDDEN], 2, 1.0);
        let y = session.step(&x).await.unwrap();
        assert!(y.allclose(&run_forward(&SimBlock::range(tail.range()), &x, None).unwrap(), 1e-5));
        assert_eq!(s.peer("A").open_sessions(), 0);
        assert_eq!(s.peer("B").open_sessions(), 1);
        session.close().await.unwrap();
    }
}

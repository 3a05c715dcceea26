//! Per-call compression choice.
//!
//! The sequence manager asks its [`CompressionPolicy`] which encoding to use
//! for every tensor it sends and every reply it requests. Policies are pure:
//! the answer depends only on the protocol, the tensor's role and the
//! declared schema.

use std::fmt::Debug;

use hive_types::{CompressionType, Protocol, RpcInfo, TensorDescriptor, TensorRole};

pub trait CompressionPolicy: Send + Sync + Debug {
    /// Encoding for one tensor. Defaults to the schema's declared encoding.
    fn select(&self, protocol: Protocol, role: TensorRole, schema: &TensorDescriptor) -> CompressionType {
        let _ = (protocol, role);
        schema.compression
    }

    /// Schema to advertise to callers. Defaults to the peer's own.
    fn rpc_info(&self, info: RpcInfo) -> RpcInfo {
        info
    }
}

/// Uses whatever the peer declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredCompression;

impl CompressionPolicy for DeclaredCompression {}

/// Fixed encodings per protocol and direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolCompression {
    pub forward_input: CompressionType,
    pub forward_output: CompressionType,
    pub backward_input: CompressionType,
    pub backward_output: CompressionType,
    pub inference_input: CompressionType,
    pub inference_output: CompressionType,
}

impl ProtocolCompression {
    /// Half-precision activations and 8-bit gradients.
    pub fn lossy() -> Self {
        Self {
            forward_input: CompressionType::Float16,
            forward_output: CompressionType::Float16,
            backward_input: CompressionType::Float16,
            backward_output: CompressionType::Blockwise8Bit,
            inference_input: CompressionType::Float16,
            inference_output: CompressionType::Float16,
        }
    }
}

impl CompressionPolicy for ProtocolCompression {
    fn select(&self, protocol: Protocol, role: TensorRole, _schema: &TensorDescriptor) -> CompressionType {
        match (protocol, role) {
            (Protocol::Forward, TensorRole::Input) => self.forward_input,
            (Protocol::Forward, TensorRole::Output) => self.forward_output,
            (Protocol::Backward, TensorRole::Input) => self.backward_input,
            (Protocol::Backward, TensorRole::Output) => self.backward_output,
            (Protocol::Inference, TensorRole::Input) => self.inference_input,
            (Protocol::Inference, TensorRole::Output) => self.inference_output,
        }
    }

    fn rpc_info(&self, info: RpcInfo) -> RpcInfo {
        RpcInfo {
            inputs: info.inputs.with_compression(self.forward_input),
            outputs: info.outputs.with_compression(self.forward_output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_follows_schema() {
        let schema = TensorDescriptor::new(vec![8]).with_compression(CompressionType::Float16);
        let policy = DeclaredCompression;
        assert_eq!(policy.select(Protocol::Backward, TensorRole::Output, &schema), CompressionType::Float16);
        assert_eq!(
            policy.select(Protocol::Forward, TensorRole::Input, &TensorDescriptor::new(vec![8])),
            CompressionType::None
        );
    }

    #[test]
    fn lossy_overrides_per_protocol() {
        let schema = TensorDescriptor::new(vec![8]);
        let policy = ProtocolCompression::lossy();
        assert_eq!(policy.select(Protocol::Forward, TensorRole::Input, &schema), CompressionType::Float16);
        assert_eq!(
            policy.select(Protocol::Backward, TensorRole::Output, &schema),
            CompressionType::Blockwise8Bit
        );
        let info = policy.rpc_info(RpcInfo::hidden_states(8));
        assert_eq!(info.inputs.compression, CompressionType::Float16);
    }
}

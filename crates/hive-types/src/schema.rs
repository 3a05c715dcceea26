// Tensor schemas and per-call request metadata.
//
// Shared across hive-net (wire messages) and hive-routing (compression policy).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

// ── Compression ──────────────────────────────────────────────────────────────

/// Wire encoding for a tensor payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    /// Full-precision `f32` passthrough.
    #[default]
    None = 0,
    /// IEEE 754 half precision.
    Float16 = 1,
    /// Per-block absmax scaling to `i8`.
    Blockwise8Bit = 2,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Float16),
            2 => Some(Self::Blockwise8Bit),
            _ => None,
        }
    }

    pub fn is_lossy(&self) -> bool {
        !matches!(self, Self::None)
    }
}

// ── Tensor Descriptor ────────────────────────────────────────────────────────

/// Declared schema of one tensor argument: its trailing (non-batch) shape
/// and the compression it travels with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub trailing_shape: Vec<usize>,
    pub compression: CompressionType,
}

impl TensorDescriptor {
    pub fn new(trailing_shape: Vec<usize>) -> Self {
        Self { trailing_shape, compression: CompressionType::None }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// True if `tensor`'s shape ends with the declared trailing shape.
    pub fn matches(&self, tensor: &Tensor) -> bool {
        let shape = tensor.shape();
        shape.len() >= self.trailing_shape.len()
            && shape[shape.len() - self.trailing_shape.len()..] == self.trailing_shape[..]
    }
}

/// Input/output schema a peer advertises for the blocks it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcInfo {
    pub inputs: TensorDescriptor,
    pub outputs: TensorDescriptor,
}

impl RpcInfo {
    /// Schema of a block that maps `[.., hidden]` to `[.., hidden]`.
    pub fn hidden_states(hidden_size: usize) -> Self {
        Self {
            inputs: TensorDescriptor::new(vec![hidden_size]),
            outputs: TensorDescriptor::new(vec![hidden_size]),
        }
    }
}

// ── Protocols ────────────────────────────────────────────────────────────────

/// Remote call types a peer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Forward,
    Backward,
    Inference,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "rpc_forward",
            Self::Backward => "rpc_backward",
            Self::Inference => "rpc_inference",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a tensor is sent to a peer or returned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    Input,
    Output,
}

// ── Request Metadata ─────────────────────────────────────────────────────────

/// Per-call metadata. Built fresh for every hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub protocol: Protocol,
    /// Schema the caller expects the peer to accept.
    pub schema: TensorDescriptor,
    /// Encoding of the tensors sent with this request.
    pub input_compression: CompressionType,
    /// Encoding the peer must use for its reply.
    pub output_compression: CompressionType,
    pub session_id: Option<String>,
    pub step_id: Option<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_discriminants() {
        for v in 0..=2u8 {
            let c = CompressionType::from_u8(v).unwrap();
            assert_eq!(c as u8, v);
        }
        assert!(CompressionType::from_u8(3).is_none());
        assert!(!CompressionType::None.is_lossy());
        assert!(CompressionType::Float16.is_lossy());
    }

    #[test]
    fn descriptor_matches_trailing_shape() {
        let desc = TensorDescriptor::new(vec![16]);
        assert!(desc.matches(&Tensor::zeros(&[2, 3, 16])));
        assert!(!desc.matches(&Tensor::zeros(&[2, 3, 8])));
        assert!(!TensorDescriptor::new(vec![4, 16]).matches(&Tensor::zeros(&[16])));
    }

    #[test]
    fn protocol_names() {
        assert_eq!(Protocol::Forward.to_string(), "rpc_forward");
        assert_eq!(Protocol::Backward.as_str(), "rpc_backward");
        assert_eq!(Protocol::Inference.as_str(), "rpc_inference");
    }

    #[test]
    fn metadata_serde() {
        let meta = RequestMetadata {
            protocol: Protocol::Forward,
            schema: TensorDescriptor::new(vec![64]).with_compression(CompressionType::Float16),
            input_compression: CompressionType::Float16,
            output_compression: CompressionType::Blockwise8Bit,
            session_id: Some("sess-1".into()),
            step_id: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let round: RequestMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(round, meta);
    }
}

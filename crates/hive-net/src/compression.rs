//! Tensor wire encodings.
//!
//! Every tensor crossing the block-RPC protocol travels as a [`WireTensor`]:
//! its shape, the [`CompressionType`] used, and the encoded payload.
//!
//! | compression     | payload layout                                         |
//! |-----------------|--------------------------------------------------------|
//! | `None`          | `f32` little-endian per element                        |
//! | `Float16`       | IEEE half little-endian per element                    |
//! | `Blockwise8Bit` | per block of 64 values: `f32` absmax LE, then 64 × `i8` |

use half::f16;
use serde::{Deserialize, Serialize};

use hive_types::{CompressionType, Tensor};

use crate::error::{NetError, Result};

/// Values per quantization block for [`CompressionType::Blockwise8Bit`].
pub const QUANT_BLOCK_SIZE: usize = 64;

const I8_LEVELS: f32 = 127.0;

/// Encoded tensor as carried inside block-RPC messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub shape: Vec<u32>,
    pub compression: CompressionType,
    pub payload: Vec<u8>,
}

impl WireTensor {
    /// Element count, or `None` if the shape does not fit in `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
    }

    fn expected_payload_len(&self) -> Option<(usize, usize)> {
        let numel = self.numel()?;
        let bytes = match self.compression {
            CompressionType::None => numel.checked_mul(4)?,
            CompressionType::Float16 => numel.checked_mul(2)?,
            CompressionType::Blockwise8Bit => numel
                .div_ceil(QUANT_BLOCK_SIZE)
                .checked_mul(4)
                .and_then(|scales| scales.checked_add(numel))?,
        };
        Some((numel, bytes))
    }
}

/// Encode `tensor` with the requested compression.
pub fn serialize_tensor(tensor: &Tensor, compression: CompressionType) -> WireTensor {
    let data = tensor.data();
    let payload = match compression {
        CompressionType::None => data.iter().flat_map(|x| x.to_le_bytes()).collect(),
        CompressionType::Float16 => data
            .iter()
            .flat_map(|&x| f16::from_f32(x).to_le_bytes())
            .collect(),
        CompressionType::Blockwise8Bit => quantize_blockwise(data),
    };
    WireTensor {
        shape: tensor.shape().iter().map(|&d| d as u32).collect(),
        compression,
        payload,
    }
}

/// Decode a [`WireTensor`], validating the payload length.
pub fn deserialize_tensor(wire: &WireTensor) -> Result<Tensor> {
    let (numel, expected) = wire.expected_payload_len().ok_or_else(|| {
        NetError::Serialization(format!("shape {:?} overflows the address space", wire.shape))
    })?;
    if wire.payload.len() != expected {
        return Err(NetError::Serialization(format!(
            "{:?} payload for shape {:?}: expected {expected} bytes, got {}",
            wire.compression,
            wire.shape,
            wire.payload.len()
        )));
    }

    let data = match wire.compression {
        CompressionType::None => wire
            .payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        CompressionType::Float16 => wire
            .payload
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        CompressionType::Blockwise8Bit => dequantize_blockwise(&wire.payload, numel),
    };
    let shape = wire.shape.iter().map(|&d| d as usize).collect();
    Ok(Tensor::new(shape, data)?)
}

fn quantize_blockwise(data: &[f32]) -> Vec<u8> {
    let n_blocks = data.len().div_ceil(QUANT_BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + n_blocks * 4);
    for block in data.chunks(QUANT_BLOCK_SIZE) {
        let absmax = block.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        out.extend_from_slice(&absmax.to_le_bytes());
        for &x in block {
            let q = if absmax > 0.0 {
                (x / absmax * I8_LEVELS).round().clamp(-I8_LEVELS, I8_LEVELS) as i8
            } else {
                0
            };
            out.push(q as u8);
        }
    }
    out
}

fn dequantize_blockwise(payload: &[u8], numel: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(numel);
    let mut offset = 0;
    while data.len() < numel {
        let absmax = f32::from_le_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]);
        offset += 4;
        let len = QUANT_BLOCK_SIZE.min(numel - data.len());
        for &q in &payload[offset..offset + len] {
            data.push(f32::from(q as i8) / I8_LEVELS * absmax);
        }
        offset += len;
    }
    data
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = shape.iter().product();
        let data = (0..n).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
        Tensor::new(shape.to_vec(), data).unwrap()
    }

    #[test]
    fn uncompressed_is_exact() {
        let t = random_tensor(&[2, 3, 16], 1);
        let wire = serialize_tensor(&t, CompressionType::None);
        assert_eq!(wire.payload.len(), t.numel() * 4);
        assert_eq!(deserialize_tensor(&wire).unwrap(), t);
    }

    #[test]
    fn float16_error_is_bounded() {
        let t = random_tensor(&[4, 8, 32], 2);
        let wire = serialize_tensor(&t, CompressionType::Float16);
        assert_eq!(wire.payload.len(), t.numel() * 2);
        let back = deserialize_tensor(&wire).unwrap();
        let max = back.max_abs_diff(&t).unwrap();
        assert!(max > 0.0, "float16 must be lossy on random data");
        // |x| < 2 → half precision spacing is at most 2^-10.
        assert!(max <= 1e-3, "max error {max}");
    }

    #[test]
    fn blockwise_error_is_bounded() {
        // 100 elements → one full block and one partial block.
        let t = random_tensor(&[100], 3);
        let wire = serialize_tensor(&t, CompressionType::Blockwise8Bit);
        assert_eq!(wire.payload.len(), 100 + 2 * 4);
        let back = deserialize_tensor(&wire).unwrap();
        let max = back.max_abs_diff(&t).unwrap();
        assert!(max > 0.0);
        // Half a quantization step of the largest block absmax (< 2).
        assert!(max <= 2.0 / 127.0 / 2.0 + 1e-6, "max error {max}");
    }

    #[test]
    fn blockwise_all_zero_block() {
        let t = Tensor::zeros(&[70]);
        let back = deserialize_tensor(&serialize_tensor(&t, CompressionType::Blockwise8Bit)).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn truncated_payload_rejected() {
        let t = random_tensor(&[8], 4);
        let mut wire = serialize_tensor(&t, CompressionType::Float16);
        wire.payload.pop();
        assert!(matches!(
            deserialize_tensor(&wire),
            Err(NetError::Serialization(_))
        ));
    }

    #[test]
    fn oversized_shape_is_rejected() {
        for compression in [
            CompressionType::None,
            CompressionType::Float16,
            CompressionType::Blockwise8Bit,
        ] {
            let wire = WireTensor { shape: vec![u32::MAX; 3], compression, payload: vec![0; 16] };
            assert_eq!(wire.numel(), None);
            assert!(
                matches!(deserialize_tensor(&wire), Err(NetError::Serialization(_))),
                "{compression:?}"
            );
        }
    }
}

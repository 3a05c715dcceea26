// Minimal dense tensor used as the payload of block calls.
//
// Row-major `f32` storage plus a shape. Only the operations the routing layer
// needs are provided: slicing and concatenation along a dimension (span
// histories, prompt slices) and prefix injection (per-block prompts).

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| HiveError::Tensor(format!("shape {shape:?} overflows usize")))?;
        if numel != data.len() {
            return Err(HiveError::Tensor(format!(
                "shape {shape:?} needs {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![0.0; numel] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Size of dimension `dim`.
    pub fn size(&self, dim: usize) -> Result<usize> {
        self.shape
            .get(dim)
            .copied()
            .ok_or_else(|| HiveError::Tensor(format!("dim {dim} out of range for {:?}", self.shape)))
    }

    /// `(outer, mid, inner)` extents around `dim`.
    fn split_at(&self, dim: usize) -> Result<(usize, usize, usize)> {
        let mid = self.size(dim)?;
        let outer = self.shape[..dim].iter().product();
        let inner = self.shape[dim + 1..].iter().product();
        Ok((outer, mid, inner))
    }

    /// Copy of `len` entries along `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        let (outer, mid, inner) = self.split_at(dim)?;
        if start + len > mid {
            return Err(HiveError::Tensor(format!(
                "narrow {start}..{} exceeds dim {dim} of size {mid}",
                start + len
            )));
        }
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * mid + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Tensor { shape, data })
    }

    /// Concatenate along `dim`. All other dimensions must agree.
    pub fn cat(tensors: &[Tensor], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| HiveError::Tensor("cat of zero tensors".into()))?;
        let (outer, _, inner) = first.split_at(dim)?;
        let mut total = 0;
        for t in tensors {
            let same_rank = t.ndim() == first.ndim();
            let same_rest = same_rank
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !same_rest {
                return Err(HiveError::Tensor(format!(
                    "cat along {dim}: shape {:?} incompatible with {:?}",
                    t.shape, first.shape
                )));
            }
            total += t.shape[dim];
        }
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let mid = t.shape[dim];
                let base = o * mid * inner;
                data.extend_from_slice(&t.data[base..base + mid * inner]);
            }
        }
        let mut shape = first.shape.clone();
        shape[dim] = total;
        Ok(Tensor { shape, data })
    }

    /// Entry `index` of the leading dimension, with that dimension removed.
    pub fn select(&self, index: usize) -> Result<Tensor> {
        let lead = self.size(0)?;
        if index >= lead {
            return Err(HiveError::Tensor(format!("select {index} out of {lead}")));
        }
        let inner: usize = self.shape[1..].iter().product();
        Ok(Tensor {
            shape: self.shape[1..].to_vec(),
            data: self.data[index * inner..(index + 1) * inner].to_vec(),
        })
    }

    /// Stack equally shaped tensors along a new leading dimension.
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| HiveError::Tensor("stack of zero tensors".into()))?;
        let mut data = Vec::with_capacity(first.numel() * tensors.len());
        for t in tensors {
            if t.shape != first.shape {
                return Err(HiveError::Tensor(format!(
                    "stack: shape {:?} differs from {:?}",
                    t.shape, first.shape
                )));
            }
            data.extend_from_slice(&t.data);
        }
        let mut shape = vec![tensors.len()];
        shape.extend_from_slice(&first.shape);
        Ok(Tensor { shape, data })
    }

    /// Add `prefix` onto the leading `prefix.size(dim)` entries along `dim`.
    pub fn add_prefix(&mut self, dim: usize, prefix: &Tensor) -> Result<()> {
        let (outer, mid, inner) = self.split_at(dim)?;
        let (p_outer, p_mid, p_inner) = prefix.split_at(dim)?;
        if p_outer != outer || p_inner != inner || p_mid > mid {
            return Err(HiveError::Tensor(format!(
                "prefix {:?} does not fit into {:?} along dim {dim}",
                prefix.shape, self.shape
            )));
        }
        for o in 0..outer {
            let dst = o * mid * inner;
            let src = o * p_mid * inner;
            for i in 0..p_mid * inner {
                self.data[dst + i] += prefix.data[src + i];
            }
        }
        Ok(())
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor { shape: self.shape.clone(), data: self.data.iter().map(|&x| f(x)).collect() }
    }

    /// Elementwise sum with an equally shaped tensor.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Ok(Tensor { shape: self.shape.clone(), data })
    }

    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        self.check_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    pub fn mean_abs_diff(&self, other: &Tensor) -> Result<f32> {
        self.check_same_shape(other)?;
        if self.data.is_empty() {
            return Ok(0.0);
        }
        let sum: f64 = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| f64::from((a - b).abs()))
            .sum();
        Ok((sum / self.data.len() as f64) as f32)
    }

    /// Largest absolute value, 0 for an empty tensor.
    pub fn abs_max(&self) -> f32 {
        self.data.iter().fold(0.0, |m, x| m.max(x.abs()))
    }

    /// Same shape and every element within `atol`.
    pub fn allclose(&self, other: &Tensor, atol: f32) -> bool {
        matches!(self.max_abs_diff(other), Ok(d) if d <= atol)
    }

    fn check_same_shape(&self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(HiveError::Tensor(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

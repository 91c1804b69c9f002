use loupe_core::{Backend, DType, LoupeError, Result, Tensor};
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::tensor::CpuTensor;

/// CPU backend for the caption decoder.
///
/// All data lives in host memory as `Vec<f32>` wrapped in `Arc`.
/// Uses `ndarray` GEMM for matrix multiplication; all other ops are plain loops.
#[derive(Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(LoupeError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data_len],
        });
    }
    Ok(())
}

fn validate_same_shape(a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(LoupeError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

fn last_dim(x: &CpuTensor) -> Result<usize> {
    x.shape()
        .last()
        .copied()
        .filter(|&c| c > 0)
        .ok_or_else(|| LoupeError::InvalidArgument("expected a non-empty last dimension".into()))
}

fn view2(data: &[f32], rows: usize, cols: usize) -> Result<ArrayView2<'_, f32>> {
    ArrayView2::from_shape((rows, cols), data)
        .map_err(|e| LoupeError::InvalidArgument(format!("matmul view: {e}")))
}

/// Exact GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`, evaluated in f64.
#[inline]
fn gelu_f32(v: f32) -> f32 {
    let x = v as f64;
    (0.5 * x * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))) as f32
}

impl CpuBackend {
    fn gemm(
        &self,
        a: &CpuTensor,
        b: &CpuTensor,
        transpose_b: bool,
    ) -> Result<CpuTensor> {
        let a_shape = a.shape();
        let b_shape = b.shape();
        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(LoupeError::InvalidArgument(
                "matmul requires 2D tensors".into(),
            ));
        }
        let m = a_shape[0];
        let k = a_shape[1];
        let (b_k, n) = if transpose_b {
            (b_shape[1], b_shape[0])
        } else {
            (b_shape[0], b_shape[1])
        };
        if b_k != k {
            return Err(LoupeError::ShapeMismatch {
                expected: if transpose_b { vec![n, k] } else { vec![k, n] },
                got: b_shape.to_vec(),
            });
        }

        let a_view = view2(a.data(), m, k)?;
        let b_view = view2(b.data(), b_shape[0], b_shape[1])?;
        let mut c = vec![0.0f32; m * n];
        {
            let mut c_view = ArrayViewMut2::from_shape((m, n), &mut c[..])
                .map_err(|e| LoupeError::InvalidArgument(format!("matmul output: {e}")))?;
            if transpose_b {
                general_mat_mul(1.0, &a_view, &b_view.t(), 0.0, &mut c_view);
            } else {
                general_mat_mul(1.0, &a_view, &b_view, 0.0, &mut c_view);
            }
        }
        Ok(CpuTensor::new(c, vec![m, n]))
    }
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    // ── Allocation ──────────────────────────────────────────────

    fn allocate_zeros(&self, shape: &[usize], _dtype: DType) -> Result<CpuTensor> {
        // Everything is stored as f32 regardless of the requested dtype.
        let numel: usize = shape.iter().product();
        Ok(CpuTensor::new(vec![0.0; numel], shape.to_vec()))
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        Ok(CpuTensor::new(data.to_vec(), shape.to_vec()))
    }

    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::new(f32_data, shape.to_vec()))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    // ── Synchronization ─────────────────────────────────────────

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    // ── Compute ops ────────────────────────────────────────────

    fn matmul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        self.gemm(a, b, false)
    }

    fn matmul_transposed(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        self.gemm(a, b, true)
    }

    fn add(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(a, b)?;
        let data: Vec<f32> = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| x + y)
            .collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn add_bias(&self, x: &CpuTensor, bias: &CpuTensor) -> Result<CpuTensor> {
        let cols = last_dim(x)?;
        if bias.len() != cols {
            return Err(LoupeError::ShapeMismatch {
                expected: vec![cols],
                got: bias.shape().to_vec(),
            });
        }
        let b = bias.data();
        let data: Vec<f32> = x
            .data()
            .chunks_exact(cols)
            .flat_map(|row| row.iter().zip(b.iter()).map(|(v, bv)| v + bv))
            .collect();
        Ok(CpuTensor::new(data, x.shape().to_vec()))
    }

    fn mul_scalar(&self, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|x| x * scalar).collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn gelu(&self, a: &CpuTensor) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|&x| gelu_f32(x)).collect();
        Ok(CpuTensor::new(data, a.shape().to_vec()))
    }

    fn layer_norm(
        &self,
        x: &CpuTensor,
        weight: &CpuTensor,
        bias: &CpuTensor,
        eps: f32,
    ) -> Result<CpuTensor> {
        let cols = last_dim(x)?;
        if weight.len() != cols || bias.len() != cols {
            return Err(LoupeError::ShapeMismatch {
                expected: vec![cols],
                got: weight.shape().to_vec(),
            });
        }
        let rows = x.len() / cols;
        let src = x.data();
        let w = weight.data();
        let b = bias.data();
        let mut out = vec![0.0f32; rows * cols];
        for row in 0..rows {
            let row_data = &src[row * cols..(row + 1) * cols];
            let mean = row_data.iter().sum::<f32>() / cols as f32;
            let var = row_data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
            let inv_std = (var + eps).sqrt().recip();
            for col in 0..cols {
                out[row * cols + col] = (row_data[col] - mean) * inv_std * w[col] + b[col];
            }
        }
        Ok(CpuTensor::new(out, x.shape().to_vec()))
    }

    fn softmax(&self, x: &CpuTensor, dim: i32) -> Result<CpuTensor> {
        let shape = x.shape();
        let ndim = shape.len() as i32;
        let normalized_dim = if dim < 0 { ndim + dim } else { dim };
        if normalized_dim != ndim - 1 {
            return Err(LoupeError::InvalidArgument(format!(
                "softmax only supports last dimension (got dim={dim}, ndim={ndim})"
            )));
        }
        let cols = last_dim(x)?;
        let rows = x.len() / cols;
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for row in 0..rows {
            let row_data = &src[row * cols..(row + 1) * cols];
            let max_val = row_data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if max_val == f32::NEG_INFINITY {
                // Fully masked row: leave zeros.
                continue;
            }
            let mut sum = 0.0f32;
            for col in 0..cols {
                let v = (row_data[col] - max_val).exp();
                out[row * cols + col] = v;
                sum += v;
            }
            for col in 0..cols {
                out[row * cols + col] /= sum;
            }
        }
        Ok(CpuTensor::new(out, shape.to_vec()))
    }

    fn embedding(&self, weight: &CpuTensor, indices: &[u32]) -> Result<CpuTensor> {
        let w_shape = weight.shape();
        if w_shape.len() != 2 {
            return Err(LoupeError::InvalidArgument(
                "embedding weight must be 2D [vocab_size, embedding_dim]".into(),
            ));
        }
        let vocab_size = w_shape[0];
        let dim = w_shape[1];
        let mut out = Vec::with_capacity(indices.len() * dim);
        for &idx in indices {
            if idx as usize >= vocab_size {
                return Err(LoupeError::InvalidArgument(format!(
                    "embedding index {idx} out of range (vocab_size={vocab_size})"
                )));
            }
            out.extend_from_slice(weight.row(idx as usize));
        }
        Ok(CpuTensor::new(out, vec![indices.len(), dim]))
    }

    fn reshape(&self, x: &CpuTensor, shape: &[usize]) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        if numel != x.len() {
            return Err(LoupeError::ShapeMismatch {
                expected: shape.to_vec(),
                got: x.shape().to_vec(),
            });
        }
        Ok(CpuTensor {
            data: x.data.clone(),
            shape: shape.to_vec(),
            dtype: x.dtype,
        })
    }

    fn transpose(&self, x: &CpuTensor, dim0: usize, dim1: usize) -> Result<CpuTensor> {
        let shape = x.shape();
        if shape.len() != 2 || !((dim0 == 0 && dim1 == 1) || (dim0 == 1 && dim1 == 0)) {
            return Err(LoupeError::InvalidArgument(
                "transpose currently only supports 2D tensors with dims (0,1)".into(),
            ));
        }
        let rows = shape[0];
        let cols = shape[1];
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Ok(CpuTensor::new(out, vec![cols, rows]))
    }

    fn cat(&self, tensors: &[&CpuTensor], dim: usize) -> Result<CpuTensor> {
        if tensors.is_empty() {
            return Err(LoupeError::InvalidArgument("empty tensor list".into()));
        }
        if dim != 0 {
            return Err(LoupeError::InvalidArgument(
                "cat currently only supports dim=0".into(),
            ));
        }
        let first = tensors[0].shape();
        for t in tensors.iter().skip(1) {
            if t.shape().len() != first.len() || t.shape()[1..] != first[1..] {
                return Err(LoupeError::ShapeMismatch {
                    expected: first.to_vec(),
                    got: t.shape().to_vec(),
                });
            }
        }
        let total_len: usize = tensors.iter().map(|t| t.len()).sum();
        let mut all_data = Vec::with_capacity(total_len);
        let mut total_first_dim = 0;
        for t in tensors {
            total_first_dim += t.shape()[0];
            all_data.extend_from_slice(t.data());
        }
        let mut out_shape = first.to_vec();
        out_shape[0] = total_first_dim;
        Ok(CpuTensor::new(all_data, out_shape))
    }

    fn cast(&self, x: &CpuTensor, _dtype: DType) -> Result<CpuTensor> {
        // Stored as f32 internally, so cast is a no-op.
        Ok(x.clone())
    }

    fn slice_rows(
        &self,
        tensor: &CpuTensor,
        start_row: usize,
        num_rows: usize,
    ) -> Result<CpuTensor> {
        let shape = tensor.shape();
        let cols: usize = if shape.len() > 1 {
            shape[1..].iter().product()
        } else {
            1
        };
        let offset = start_row * cols;
        let len = num_rows * cols;
        if offset + len > tensor.len() {
            return Err(LoupeError::InvalidArgument(format!(
                "rows {start_row}..{} out of range for shape {shape:?}",
                start_row + num_rows
            )));
        }
        let data = tensor.data()[offset..offset + len].to_vec();
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        Ok(CpuTensor::new(data, out_shape))
    }

    fn multi_head_attention(
        &self,
        q: &CpuTensor,
        k: &CpuTensor,
        v: &CpuTensor,
        num_heads: usize,
        head_dim: usize,
        scale: f32,
        mask: Option<&CpuTensor>,
    ) -> Result<CpuTensor> {
        let width = num_heads * head_dim;
        let seq_len = q.len() / width;
        let kv_len = k.len() / width;
        if q.len() != seq_len * width || k.len() != kv_len * width || v.len() != k.len() {
            return Err(LoupeError::ShapeMismatch {
                expected: vec![kv_len, width],
                got: v.shape().to_vec(),
            });
        }
        if let Some(mask) = mask {
            if mask.shape() != [seq_len, kv_len] {
                return Err(LoupeError::ShapeMismatch {
                    expected: vec![seq_len, kv_len],
                    got: mask.shape().to_vec(),
                });
            }
        }

        let (qd, kd, vd) = (q.data(), k.data(), v.data());
        let mut out = vec![0.0f32; seq_len * width];
        let mut scores = vec![0.0f32; kv_len];
        for h in 0..num_heads {
            let off = h * head_dim;
            for t in 0..seq_len {
                let q_row = &qd[t * width + off..t * width + off + head_dim];
                let mut max_val = f32::NEG_INFINITY;
                for (s, score) in scores.iter_mut().enumerate() {
                    let k_row = &kd[s * width + off..s * width + off + head_dim];
                    let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                    let bias = mask.map_or(0.0, |m| m.data()[t * kv_len + s]);
                    *score = dot * scale + bias;
                    max_val = max_val.max(*score);
                }
                if max_val == f32::NEG_INFINITY {
                    continue;
                }
                let mut sum = 0.0f32;
                for score in scores.iter_mut() {
                    *score = (*score - max_val).exp();
                    sum += *score;
                }
                let out_row = &mut out[t * width + off..t * width + off + head_dim];
                for (s, &w) in scores.iter().enumerate() {
                    let w = w / sum;
                    let v_row = &vd[s * width + off..s * width + off + head_dim];
                    for (o, &vv) in out_row.iter_mut().zip(v_row) {
                        *o += w * vv;
                    }
                }
            }
        }
        Ok(CpuTensor::new(out, vec![seq_len, width]))
    }
}

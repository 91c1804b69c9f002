use crate::tensor::Tensor;
use crate::{DType, Result};

pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;

    // Allocation
    fn allocate_zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    // Data transfer
    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    // Synchronization
    fn synchronize(&self) -> Result<()>;

    // Core ops
    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// `a @ b^T` without materializing the transpose of `b`.
    ///
    /// Used with weights stored `[out, in]` that must stay shared, such as
    /// the tied output projection.
    fn matmul_transposed(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor> {
        let b_t = self.transpose(b, 0, 1)?;
        self.matmul(a, &b_t)
    }

    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Broadcast-add a `[cols]` bias to every row of `[rows, cols]`.
    fn add_bias(&self, x: &Self::Tensor, bias: &Self::Tensor) -> Result<Self::Tensor>;

    fn mul_scalar(&self, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;
    fn gelu(&self, a: &Self::Tensor) -> Result<Self::Tensor>;

    /// LayerNorm over the last dimension with affine `weight` and `bias`.
    fn layer_norm(
        &self,
        x: &Self::Tensor,
        weight: &Self::Tensor,
        bias: &Self::Tensor,
        eps: f32,
    ) -> Result<Self::Tensor>;

    fn softmax(&self, x: &Self::Tensor, dim: i32) -> Result<Self::Tensor>;
    fn embedding(&self, weight: &Self::Tensor, indices: &[u32]) -> Result<Self::Tensor>;
    fn reshape(&self, x: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor>;
    fn transpose(&self, x: &Self::Tensor, dim0: usize, dim1: usize) -> Result<Self::Tensor>;
    fn cat(&self, tensors: &[&Self::Tensor], dim: usize) -> Result<Self::Tensor>;

    /// Cast a tensor to a different dtype. Returns the input unchanged if already the target dtype.
    fn cast(&self, x: &Self::Tensor, dtype: DType) -> Result<Self::Tensor>;

    /// Multi-head scaled dot-product attention.
    ///
    /// Q: [seq_len, num_heads * head_dim]
    /// K: [kv_len, num_heads * head_dim]
    /// V: [kv_len, num_heads * head_dim]
    /// mask: optional additive `[seq_len, kv_len]` (0 or -inf)
    ///
    /// Returns: [seq_len, num_heads * head_dim]
    ///
    /// Default impl: per-head loop (extract_head -> matmul -> softmax -> interleave).
    #[allow(clippy::too_many_arguments)]
    fn multi_head_attention(
        &self,
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        num_heads: usize,
        head_dim: usize,
        scale: f32,
        mask: Option<&Self::Tensor>,
    ) -> Result<Self::Tensor> {
        let seq_len = q.shape()[0];
        let kv_len = k.shape()[0];

        let mut head_outputs = Vec::with_capacity(num_heads);
        for h in 0..num_heads {
            let q_head = self.extract_head(q, seq_len, num_heads, head_dim, h)?;
            let k_head = self.extract_head(k, kv_len, num_heads, head_dim, h)?;
            let v_head = self.extract_head(v, kv_len, num_heads, head_dim, h)?;

            let scores = self.matmul_transposed(&q_head, &k_head)?;
            let scores = self.mul_scalar(&scores, scale)?;
            let scores = match mask {
                Some(mask) => self.add(&scores, mask)?,
                None => scores,
            };

            let attn = self.softmax(&scores, -1)?;
            head_outputs.push(self.matmul(&attn, &v_head)?);
        }

        let refs: Vec<&Self::Tensor> = head_outputs.iter().collect();
        self.interleave_heads(&refs, seq_len, head_dim)
    }

    // ── Attention helpers ───────────────────────────────────────
    // Default impls go through host memory.

    /// Extract head `head` from `[seq_len, num_heads * head_dim]` layout → `[seq_len, head_dim]`.
    fn extract_head(
        &self,
        tensor: &Self::Tensor,
        seq_len: usize,
        num_heads: usize,
        head_dim: usize,
        head: usize,
    ) -> Result<Self::Tensor> {
        let data = self.copy_to_host_f32(tensor)?;
        let stride = num_heads * head_dim;
        let mut out = Vec::with_capacity(seq_len * head_dim);
        for t in 0..seq_len {
            let start = t * stride + head * head_dim;
            out.extend_from_slice(&data[start..start + head_dim]);
        }
        self.copy_from_host_f32(&out, &[seq_len, head_dim])
    }

    /// Extract rows `[start_row..start_row+num_rows]` from a tensor.
    /// Input: `[total_rows, cols...]`, Output: `[num_rows, cols...]`.
    fn slice_rows(
        &self,
        tensor: &Self::Tensor,
        start_row: usize,
        num_rows: usize,
    ) -> Result<Self::Tensor> {
        let shape = tensor.shape();
        let cols: usize = if shape.len() > 1 {
            shape[1..].iter().product()
        } else {
            1
        };
        let data = self.copy_to_host_f32(tensor)?;
        let offset = start_row * cols;
        let len = num_rows * cols;
        let mut out_shape = shape.to_vec();
        out_shape[0] = num_rows;
        self.copy_from_host_f32(&data[offset..offset + len], &out_shape)
    }

    /// Interleave per-head `[seq_len, head_dim]` outputs → `[seq_len, num_heads * head_dim]`.
    fn interleave_heads(
        &self,
        heads: &[&Self::Tensor],
        seq_len: usize,
        head_dim: usize,
    ) -> Result<Self::Tensor> {
        let num_heads = heads.len();
        let mut head_data: Vec<Vec<f32>> = Vec::with_capacity(num_heads);
        for h in heads {
            head_data.push(self.copy_to_host_f32(h)?);
        }
        let mut result = Vec::with_capacity(seq_len * num_heads * head_dim);
        for t in 0..seq_len {
            for data in &head_data {
                let offset = t * head_dim;
                result.extend_from_slice(&data[offset..offset + head_dim]);
            }
        }
        self.copy_from_host_f32(&result, &[seq_len, num_heads * head_dim])
    }
}

use loupe_core::{Backend, CaptionerConfig, Result, Tensor};

/// Affine projection with the weight stored `[in_features, out_features]`.
pub struct Linear<B: Backend> {
    weight: B::Tensor,
    bias: Option<B::Tensor>,
}

impl<B: Backend> Linear<B> {
    pub fn new(weight: B::Tensor, bias: Option<B::Tensor>) -> Self {
        Self { weight, bias }
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let y = backend.matmul(x, &self.weight)?;
        match &self.bias {
            Some(bias) => backend.add_bias(&y, bias),
            None => Ok(y),
        }
    }
}

/// Layer normalization with learned scale and shift.
pub struct LayerNorm<B: Backend> {
    weight: B::Tensor,
    bias: B::Tensor,
    eps: f32,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(weight: B::Tensor, bias: B::Tensor, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        backend.layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

/// Position-wise MLP: linear -> GELU -> linear.
pub struct FeedForward<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(fc1: Linear<B>, fc2: Linear<B>) -> Self {
        Self { fc1, fc2 }
    }

    pub fn forward(&self, x: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let h = self.fc1.forward(x, backend)?;
        let h = backend.gelu(&h)?;
        self.fc2.forward(&h, backend)
    }
}

/// Cross-attention keys and values for one block, projected once from memory.
pub struct MemoryKv<B: Backend> {
    pub k: B::Tensor,
    pub v: B::Tensor,
}

/// Multi-head attention used both causally over the token prefix and
/// unrestricted over image memory.
pub struct MultiHeadAttention<B: Backend> {
    wq: Linear<B>,
    wk: Linear<B>,
    wv: Linear<B>,
    out_proj: Linear<B>,
    num_heads: usize,
    head_dim: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn new(
        wq: Linear<B>,
        wk: Linear<B>,
        wv: Linear<B>,
        out_proj: Linear<B>,
        config: &CaptionerConfig,
    ) -> Self {
        Self {
            wq,
            wk,
            wv,
            out_proj,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        }
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Causal self-attention.
    ///
    /// Input `x`: [batch * seq_len, hidden], rows grouped by candidate.
    /// `mask`: additive [seq_len, seq_len].
    /// Output: [batch * seq_len, hidden]
    pub fn forward_self(
        &self,
        x: &B::Tensor,
        batch: usize,
        seq_len: usize,
        mask: &B::Tensor,
        backend: &B,
    ) -> Result<B::Tensor> {
        let q = self.wq.forward(x, backend)?;
        let k = self.wk.forward(x, backend)?;
        let v = self.wv.forward(x, backend)?;

        // Each candidate attends only within its own prefix.
        let mut rows = Vec::with_capacity(batch);
        for b in 0..batch {
            let start = b * seq_len;
            let qb = backend.slice_rows(&q, start, seq_len)?;
            let kb = backend.slice_rows(&k, start, seq_len)?;
            let vb = backend.slice_rows(&v, start, seq_len)?;
            rows.push(backend.multi_head_attention(
                &qb,
                &kb,
                &vb,
                self.num_heads,
                self.head_dim,
                self.scale(),
                Some(mask),
            )?);
        }
        let refs: Vec<&B::Tensor> = rows.iter().collect();
        let attn_out = backend.cat(&refs, 0)?;
        self.out_proj.forward(&attn_out, backend)
    }

    /// Project memory `[patches, hidden]` into this block's keys and values.
    pub fn project_memory(&self, memory: &B::Tensor, backend: &B) -> Result<MemoryKv<B>> {
        Ok(MemoryKv {
            k: self.wk.forward(memory, backend)?,
            v: self.wv.forward(memory, backend)?,
        })
    }

    /// Cross-attention from every query row to the shared memory keys/values.
    ///
    /// Memory is identical for all candidates of one image, so the whole
    /// `[batch * seq_len, hidden]` query block attends in one call.
    pub fn forward_cross(
        &self,
        x: &B::Tensor,
        memory_kv: &MemoryKv<B>,
        backend: &B,
    ) -> Result<B::Tensor> {
        let q = self.wq.forward(x, backend)?;
        let attn_out = backend.multi_head_attention(
            &q,
            &memory_kv.k,
            &memory_kv.v,
            self.num_heads,
            self.head_dim,
            self.scale(),
            None,
        )?;
        self.out_proj.forward(&attn_out, backend)
    }
}

/// One pre-norm decoder block: causal self-attention, cross-attention to
/// memory, feed-forward; each sub-layer wrapped in a residual add.
pub struct DecoderBlock<B: Backend> {
    norm1: LayerNorm<B>,
    self_attn: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    cross_attn: MultiHeadAttention<B>,
    norm3: LayerNorm<B>,
    mlp: FeedForward<B>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(
        norm1: LayerNorm<B>,
        self_attn: MultiHeadAttention<B>,
        norm2: LayerNorm<B>,
        cross_attn: MultiHeadAttention<B>,
        norm3: LayerNorm<B>,
        mlp: FeedForward<B>,
    ) -> Self {
        Self {
            norm1,
            self_attn,
            norm2,
            cross_attn,
            norm3,
            mlp,
        }
    }

    pub fn project_memory(&self, memory: &B::Tensor, backend: &B) -> Result<MemoryKv<B>> {
        self.cross_attn.project_memory(memory, backend)
    }

    pub fn forward(
        &self,
        x: &B::Tensor,
        batch: usize,
        seq_len: usize,
        mask: &B::Tensor,
        memory_kv: &MemoryKv<B>,
        backend: &B,
    ) -> Result<B::Tensor> {
        let normed = self.norm1.forward(x, backend)?;
        let attn_out = self
            .self_attn
            .forward_self(&normed, batch, seq_len, mask, backend)?;
        let x = backend.add(x, &attn_out)?;

        let normed = self.norm2.forward(&x, backend)?;
        let cross_out = self.cross_attn.forward_cross(&normed, memory_kv, backend)?;
        let x = backend.add(&x, &cross_out)?;

        let normed = self.norm3.forward(&x, backend)?;
        let mlp_out = self.mlp.forward(&normed, backend)?;
        backend.add(&x, &mlp_out)
    }
}

use loupe_core::{
    Backend, CaptionModel, CaptionerConfig, LoupeError, ModelOutput, Result, Tensor,
};
use tracing::trace;

use crate::layers::{DecoderBlock, Linear, MemoryKv};
use crate::mask::CausalMask;
use crate::projector::MemoryProjector;

/// Frozen token and position tables borrowed from the external text encoder.
pub struct TextEmbeddings<B: Backend> {
    /// [vocab_size, hidden_dim]
    token_embedding: B::Tensor,
    /// [max_positions, hidden_dim]
    position_embedding: B::Tensor,
}

impl<B: Backend> TextEmbeddings<B> {
    pub fn new(token_embedding: B::Tensor, position_embedding: B::Tensor) -> Self {
        Self {
            token_embedding,
            position_embedding,
        }
    }

    pub fn token_embedding(&self) -> &B::Tensor {
        &self.token_embedding
    }

    pub fn max_positions(&self) -> usize {
        self.position_embedding.shape()[0]
    }

    /// Token + position embeddings for equally long prefixes, packed as
    /// `[batch * seq_len, hidden_dim]`.
    pub fn forward(&self, prefixes: &[&[u32]], seq_len: usize, backend: &B) -> Result<B::Tensor> {
        let ids: Vec<u32> = prefixes.iter().flat_map(|p| p.iter().copied()).collect();
        let tokens = backend.embedding(&self.token_embedding, &ids)?;

        let positions: Vec<u32> = (0..prefixes.len())
            .flat_map(|_| 0..seq_len as u32)
            .collect();
        let positions = backend.embedding(&self.position_embedding, &positions)?;
        backend.add(&tokens, &positions)
    }
}

/// Hidden-state to vocabulary logits, tied to the frozen token table.
///
/// Holds a second handle to the same tensor as [`TextEmbeddings`]; the
/// weight is never copied or written.
pub struct OutputProjection<B: Backend> {
    weight: B::Tensor,
}

impl<B: Backend> OutputProjection<B> {
    pub fn tied(token_embedding: &B::Tensor) -> Self {
        Self {
            weight: token_embedding.clone(),
        }
    }

    pub fn weight(&self) -> &B::Tensor {
        &self.weight
    }

    /// `[rows, hidden_dim]` -> `[rows, vocab_size]`
    pub fn forward(&self, hidden: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        backend.matmul_transposed(hidden, &self.weight)
    }
}

/// Projected image memory plus each block's cross-attention keys/values.
pub struct CliptionMemory<B: Backend> {
    /// [patches, hidden_dim]
    pub memory: B::Tensor,
    kv: Vec<MemoryKv<B>>,
}

pub struct CliptionModel<B: Backend> {
    config: CaptionerConfig,
    projector: MemoryProjector<B>,
    blocks: Vec<DecoderBlock<B>>,
    text: TextEmbeddings<B>,
    output_projection: OutputProjection<B>,
    text_projection: Linear<B>,
    causal_mask: CausalMask,
    backend: B,
}

impl<B: Backend> CliptionModel<B> {
    pub fn new(
        config: CaptionerConfig,
        projector: MemoryProjector<B>,
        blocks: Vec<DecoderBlock<B>>,
        text: TextEmbeddings<B>,
        text_projection: Linear<B>,
        backend: B,
    ) -> Result<Self> {
        if blocks.len() != config.num_blocks {
            return Err(LoupeError::ModelLoad(format!(
                "expected {} decoder blocks, got {}",
                config.num_blocks,
                blocks.len()
            )));
        }
        if text.max_positions() < config.max_length {
            return Err(LoupeError::ModelLoad(format!(
                "position table covers {} positions, max_length is {}",
                text.max_positions(),
                config.max_length
            )));
        }
        let vocab = text.token_embedding().shape();
        if vocab != [config.vocab_size, config.hidden_dim] {
            return Err(LoupeError::ShapeMismatch {
                expected: vec![config.vocab_size, config.hidden_dim],
                got: vocab.to_vec(),
            });
        }

        let output_projection = OutputProjection::tied(text.token_embedding());
        let causal_mask = CausalMask::new(config.max_length);
        Ok(Self {
            config,
            projector,
            blocks,
            text,
            output_projection,
            text_projection,
            causal_mask,
            backend,
        })
    }

    pub fn text_embeddings(&self) -> &TextEmbeddings<B> {
        &self.text
    }

    pub fn output_projection(&self) -> &OutputProjection<B> {
        &self.output_projection
    }

    /// Projection of pooled text features into the joint embedding space.
    /// Loaded from its own checkpoint key; not used while decoding.
    pub fn text_projection(&self) -> &Linear<B> {
        &self.text_projection
    }

    pub fn causal_mask(&self) -> &CausalMask {
        &self.causal_mask
    }

    /// Full decoder stack over equally long prefixes.
    ///
    /// Returns hidden states `[batch * seq_len, hidden_dim]`.
    pub fn decode_hidden(
        &self,
        prefixes: &[&[u32]],
        memory: &CliptionMemory<B>,
    ) -> Result<B::Tensor> {
        let batch = prefixes.len();
        let seq_len = prefixes.first().map_or(0, |p| p.len());
        if batch == 0 || seq_len == 0 {
            return Err(LoupeError::InvalidArgument(
                "decoder needs at least one non-empty prefix".into(),
            ));
        }
        if prefixes.iter().any(|p| p.len() != seq_len) {
            return Err(LoupeError::InvalidArgument(
                "all prefixes in a batch must have the same length".into(),
            ));
        }

        let mask = self.causal_mask.slice(seq_len, &self.backend)?;
        let mut hidden = self.text.forward(prefixes, seq_len, &self.backend)?;
        for (block, kv) in self.blocks.iter().zip(memory.kv.iter()) {
            hidden = block.forward(&hidden, batch, seq_len, &mask, kv, &self.backend)?;
        }
        Ok(hidden)
    }
}

impl<B: Backend> CaptionModel for CliptionModel<B> {
    type T = B::Tensor;
    type Memory = CliptionMemory<B>;

    fn prepare_memory(&self, features: &B::Tensor) -> Result<CliptionMemory<B>> {
        let memory = self.projector.forward(features, &self.backend)?;
        let kv = self
            .blocks
            .iter()
            .map(|block| block.project_memory(&memory, &self.backend))
            .collect::<Result<Vec<_>>>()?;
        Ok(CliptionMemory { memory, kv })
    }

    fn forward(
        &self,
        prefixes: &[&[u32]],
        memory: &CliptionMemory<B>,
    ) -> Result<ModelOutput<B::Tensor>> {
        let seq_len = prefixes.first().map_or(0, |p| p.len());
        trace!(rows = prefixes.len(), seq_len, "decoder step");
        let hidden = self.decode_hidden(prefixes, memory)?;

        // Only the last position of each row feeds the next-token logits.
        let mut last = Vec::with_capacity(prefixes.len());
        for b in 0..prefixes.len() {
            last.push(
                self.backend
                    .slice_rows(&hidden, b * seq_len + seq_len - 1, 1)?,
            );
        }
        let refs: Vec<&B::Tensor> = last.iter().collect();
        let last = self.backend.cat(&refs, 0)?;

        let logits = self.output_projection.forward(&last, &self.backend)?;
        Ok(ModelOutput { logits })
    }

    fn config(&self) -> &CaptionerConfig {
        &self.config
    }
}

use loupe_core::{Backend, LoupeError, Result, Tensor};

use crate::layers::Linear;

/// Maps per-patch vision features into decoder width and adds the learned
/// per-patch positional table.
pub struct MemoryProjector<B: Backend> {
    projection: Linear<B>,
    /// [memory_len, hidden_dim]
    pos_embedding: B::Tensor,
}

impl<B: Backend> MemoryProjector<B> {
    pub fn new(projection: Linear<B>, pos_embedding: B::Tensor) -> Self {
        Self {
            projection,
            pos_embedding,
        }
    }

    pub fn memory_len(&self) -> usize {
        self.pos_embedding.shape()[0]
    }

    /// `[patches, vision_embed_dim]` -> `[patches, hidden_dim]`.
    pub fn forward(&self, features: &B::Tensor, backend: &B) -> Result<B::Tensor> {
        let shape = features.shape();
        if shape.len() != 2 || shape[0] != self.memory_len() {
            return Err(LoupeError::ShapeMismatch {
                expected: vec![self.memory_len(), shape.last().copied().unwrap_or(0)],
                got: shape.to_vec(),
            });
        }
        let projected = self.projection.forward(features, backend)?;
        backend.add(&projected, &self.pos_embedding)
    }
}

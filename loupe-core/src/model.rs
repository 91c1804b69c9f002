use crate::tensor::Tensor;
use crate::{CaptionerConfig, Result};

pub struct ModelOutput<T: Tensor> {
    /// Last-position logits with shape [batch, vocab_size].
    pub logits: T,
}

/// A decoder that cross-attends to image memory and scores the next token.
///
/// Implementations hold only read-only weights; all per-call state lives in
/// `Self::Memory` and the caller's token buffers.
pub trait CaptionModel: Send + Sync {
    type T: Tensor;
    /// Image memory prepared once per generate call.
    type Memory;

    /// Project per-patch features `[patches, vision_embed_dim]` into memory.
    fn prepare_memory(&self, features: &Self::T) -> Result<Self::Memory>;

    /// Run the decoder over each row's token prefix and return logits for the
    /// last position of every row. All rows share one prefix length.
    fn forward(&self, prefixes: &[&[u32]], memory: &Self::Memory)
        -> Result<ModelOutput<Self::T>>;

    fn config(&self) -> &CaptionerConfig;
}

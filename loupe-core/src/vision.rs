use crate::{Backend, Result};

/// Output of the frozen vision encoder for one image.
#[derive(Debug, Clone)]
pub struct ImageEmbeddings<T> {
    /// Per-patch features, `[patches, vision_embed_dim]`.
    pub features: T,
    /// L2-normalized global image embedding, `[embed_dim]`.
    pub embedding: T,
}

/// A frozen encoder turning an image reference into decoder inputs.
pub trait VisionEmbeddingExtractor<B: Backend>: Send + Sync {
    fn extract(&self, image: &str, backend: &B) -> Result<ImageEmbeddings<B::Tensor>>;
}

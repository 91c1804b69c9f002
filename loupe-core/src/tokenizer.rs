use crate::{Result, SpecialTokens};

/// Text side of the external vocabulary: ids to caption text.
pub trait CaptionTokenizer: Send + Sync {
    fn special_tokens(&self) -> SpecialTokens;

    fn vocab_size(&self) -> usize;

    /// Decode ids, dropping special tokens and normalizing whitespace.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

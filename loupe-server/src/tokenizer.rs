use std::path::Path;

use loupe_core::{CaptionTokenizer, LoupeError, Result, SpecialTokens};
use tokenizers::Tokenizer as HfTokenizer;

const BOS_TOKEN: &str = "<|startoftext|>";
const EOS_TOKEN: &str = "<|endoftext|>";

/// CLIP BPE vocabulary loaded from a HF `tokenizer.json`.
pub struct ClipTokenizer {
    inner: HfTokenizer,
    special: SpecialTokens,
}

impl ClipTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoupeError::NotFound(format!(
                "tokenizer not found: {}",
                path.display()
            )));
        }
        let inner =
            HfTokenizer::from_file(path).map_err(|e| LoupeError::Tokenizer(e.to_string()))?;
        Self::from_inner(inner)
    }

    /// Wrap an already-built tokenizer. Its vocabulary must contain the CLIP
    /// start and end markers.
    pub fn from_inner(inner: HfTokenizer) -> Result<Self> {
        let lookup = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| LoupeError::Tokenizer(format!("vocabulary has no {token}")))
        };
        let special = SpecialTokens {
            bos: lookup(BOS_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
        };
        Ok(Self { inner, special })
    }
}

impl CaptionTokenizer for ClipTokenizer {
    fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let content: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| id != self.special.bos && id != self.special.eos)
            .collect();
        let text = self
            .inner
            .decode(&content, true)
            .map_err(|e| LoupeError::Tokenizer(e.to_string()))?;
        Ok(collapse_whitespace(&text))
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::collapse_whitespace;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a  red\n apple "), "a red apple");
        assert_eq!(collapse_whitespace(" \t "), "");
    }
}

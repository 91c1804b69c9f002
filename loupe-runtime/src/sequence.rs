use loupe_core::{FinishReason, LoupeError, Result, SpecialTokens};

/// Token buffer for one candidate row.
///
/// Starts as `[BOS, EOS, EOS, ...]`; the decode loop overwrites one position
/// per step. Owned by a single generate call and never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceBuffer {
    tokens: Vec<u32>,
    eos: u32,
}

impl SequenceBuffer {
    pub fn new(max_length: usize, special: SpecialTokens) -> Self {
        let mut tokens = vec![special.eos; max_length];
        if let Some(first) = tokens.first_mut() {
            *first = special.bos;
        }
        Self {
            tokens,
            eos: special.eos,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<u32> {
        self.tokens.get(pos).copied()
    }

    /// Write a generated token. Position 0 holds BOS and is not writable.
    pub fn set(&mut self, pos: usize, token: u32) -> Result<()> {
        if pos == 0 || pos >= self.tokens.len() {
            return Err(LoupeError::InvalidArgument(format!(
                "position {pos} is not writable in a buffer of length {}",
                self.tokens.len()
            )));
        }
        self.tokens[pos] = token;
        Ok(())
    }

    /// The first `len` tokens.
    pub fn prefix(&self, len: usize) -> &[u32] {
        &self.tokens[..len.min(self.tokens.len())]
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<u32> {
        self.tokens
    }

    fn first_eos(&self) -> usize {
        self.tokens
            .iter()
            .skip(1)
            .position(|&t| t == self.eos)
            .map_or(self.tokens.len(), |p| p + 1)
    }

    /// Tokens between BOS and the first EOS.
    pub fn generated_len(&self) -> usize {
        self.first_eos().saturating_sub(1)
    }

    /// `EosToken` when the row chose EOS before the final position; the final
    /// position is EOS from the initial fill and does not count.
    pub fn finish_reason(&self) -> FinishReason {
        if self.first_eos() + 1 < self.tokens.len() {
            FinishReason::EosToken
        } else {
            FinishReason::MaxLength
        }
    }

    /// Number of positions that were actually scored: the generated tokens
    /// plus the EOS that ended them, if the row chose one.
    pub fn scored_len(&self) -> usize {
        match self.finish_reason() {
            FinishReason::EosToken => self.generated_len() + 1,
            FinishReason::MaxLength => self.generated_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECIAL: SpecialTokens = SpecialTokens { bos: 5, eos: 9 };

    #[test]
    fn test_new_buffer_is_bos_then_eos() {
        let buf = SequenceBuffer::new(4, SPECIAL);
        assert_eq!(buf.tokens(), &[5, 9, 9, 9]);
        assert_eq!(buf.generated_len(), 0);
        assert_eq!(buf.finish_reason(), FinishReason::EosToken);
        assert_eq!(buf.scored_len(), 1);
    }

    #[test]
    fn test_set_and_prefix() {
        let mut buf = SequenceBuffer::new(5, SPECIAL);
        buf.set(1, 2).unwrap();
        buf.set(2, 3).unwrap();
        assert_eq!(buf.prefix(3), &[5, 2, 3]);
        assert_eq!(buf.get(2), Some(3));
        assert_eq!(buf.get(5), None);
        assert_eq!(buf.generated_len(), 2);
        assert_eq!(buf.finish_reason(), FinishReason::EosToken);

        assert!(buf.set(0, 1).is_err());
        assert!(buf.set(5, 1).is_err());
    }

    #[test]
    fn test_full_buffer_hits_max_length() {
        let mut buf = SequenceBuffer::new(4, SPECIAL);
        buf.set(1, 1).unwrap();
        buf.set(2, 1).unwrap();
        assert_eq!(buf.generated_len(), 2);
        assert_eq!(buf.finish_reason(), FinishReason::MaxLength);
        assert_eq!(buf.scored_len(), 2);
        assert_eq!(buf.into_tokens(), vec![5, 1, 1, 9]);
    }
}

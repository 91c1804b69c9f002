//! Loupe runtime: decode loops, logit processing, and sampling.

pub mod engine;
pub mod sampling;
pub mod sequence;

pub use engine::{
    select, BeamSearchEngine, Candidate, Hypothesis, SamplingEngine, SelectionPolicy,
};
pub use sequence::SequenceBuffer;

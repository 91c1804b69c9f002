//! Loupe core types, traits, and error definitions.

pub mod backend;
pub mod error;
pub mod model;
pub mod sampling;
pub mod tensor;
pub mod tokenizer;
pub mod types;
pub mod vision;

pub use backend::Backend;
pub use error::{LoupeError, Result};
pub use model::{CaptionModel, ModelOutput};
pub use sampling::SampleResult;
pub use tensor::Tensor;
pub use tokenizer::CaptionTokenizer;
pub use types::*;
pub use vision::{ImageEmbeddings, VisionEmbeddingExtractor};

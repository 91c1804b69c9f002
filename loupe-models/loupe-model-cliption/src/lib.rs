//! CLIPtion caption decoder: a pre-norm transformer that cross-attends to
//! frozen CLIP patch features and scores tokens against the CLIP vocabulary.

pub mod layers;
pub mod loader;
pub mod mask;
pub mod model;
pub mod projector;

pub use loader::load_cliption_model;
pub use mask::CausalMask;
pub use model::{CliptionMemory, CliptionModel, OutputProjection, TextEmbeddings};
pub use projector::MemoryProjector;

use std::path::PathBuf;

use loupe_core::{
    Backend, ImageEmbeddings, LoupeError, Result, Tensor, VisionEmbeddingExtractor,
};
use loupe_loader::SafeTensorsLoader;
use tracing::debug;

const FEATURES_KEY: &str = "image_features";
const EMBEDS_KEY: &str = "image_embeds";

/// Reads frozen-encoder outputs precomputed for each image.
///
/// The image reference is either the feature file itself (`*.safetensors`) or
/// an image path whose features live next to it as `<image>.safetensors`.
/// The file holds `image_features` `[patches, dim]` (an optional leading batch
/// axis of 1 is dropped) and `image_embeds` `[dim]`.
#[derive(Debug, Default, Clone)]
pub struct FeatureFileExtractor {
    root: Option<PathBuf>,
}

impl FeatureFileExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative image references against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn feature_path(&self, image: &str) -> PathBuf {
        let path = match &self.root {
            Some(root) => root.join(image),
            None => PathBuf::from(image),
        };
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            path
        } else {
            let mut name = path.into_os_string();
            name.push(".safetensors");
            PathBuf::from(name)
        }
    }
}

impl<B: Backend> VisionEmbeddingExtractor<B> for FeatureFileExtractor {
    fn extract(&self, image: &str, backend: &B) -> Result<ImageEmbeddings<B::Tensor>> {
        let path = self.feature_path(image);
        if !path.is_file() {
            return Err(LoupeError::NotFound(format!("image not found: {image}")));
        }
        debug!(image, path = %path.display(), "reading image features");
        let loader = SafeTensorsLoader::new(&path)?;

        let features = loader.load_tensor(FEATURES_KEY, backend)?;
        let features = drop_batch_axis(features, backend)?;

        let embeds = loader.load_tensor(EMBEDS_KEY, backend)?;
        let mut embedding = backend.copy_to_host_f32(&embeds)?;
        l2_normalize(&mut embedding);
        let len = embedding.len();
        let embedding = backend.copy_from_host_f32(&embedding, &[len])?;

        Ok(ImageEmbeddings {
            features,
            embedding,
        })
    }
}

fn drop_batch_axis<B: Backend>(features: B::Tensor, backend: &B) -> Result<B::Tensor> {
    let shape = features.shape().to_vec();
    match shape.as_slice() {
        [_, _] => Ok(features),
        [1, patches, dim] => backend.reshape(&features, &[*patches, *dim]),
        other => Err(LoupeError::InvalidArgument(format!(
            "{FEATURES_KEY} must be [patches, dim] or [1, patches, dim], got {other:?}"
        ))),
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

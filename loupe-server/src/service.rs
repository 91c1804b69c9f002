//! Request handling shared by the single-shot and interactive modes.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use loupe_core::{
    Backend, CaptionModel, CaptionTokenizer, GenerationConfig, LoupeError, Result,
    VisionEmbeddingExtractor,
};
use loupe_runtime::{select, BeamSearchEngine, SamplingEngine, SelectionPolicy};

/// One caption request. Optional fields fall back to the service defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptionRequest {
    pub image: String,
    #[serde(default)]
    pub beam_search: Option<bool>,
    #[serde(default)]
    pub beam_width: Option<usize>,
    #[serde(default)]
    pub best_of: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub ramble: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub caption: String,
    /// Seconds from request start to decoded text.
    pub latency: f64,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Caption(CaptionResponse),
    Error(ErrorResponse),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Anything that turns a request into a reply. Failures are part of the reply.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &CaptionRequest) -> Reply;
}

/// Process-wide decode settings from the command line.
#[derive(Debug, Clone, Default)]
pub struct ServiceDefaults {
    pub beam_search: bool,
    pub generation: GenerationConfig,
    pub selection: SelectionPolicy,
}

/// Image reference in, caption text out.
pub struct CaptionService<M, B: Backend> {
    sampler: SamplingEngine<M, B>,
    beams: BeamSearchEngine<M, B>,
    backend: B,
    extractor: Arc<dyn VisionEmbeddingExtractor<B>>,
    tokenizer: Arc<dyn CaptionTokenizer>,
    defaults: ServiceDefaults,
}

impl<M, B> CaptionService<M, B>
where
    B: Backend + Clone,
    M: CaptionModel<T = B::Tensor>,
{
    pub fn new(
        model: Arc<M>,
        backend: B,
        extractor: Arc<dyn VisionEmbeddingExtractor<B>>,
        tokenizer: Arc<dyn CaptionTokenizer>,
        defaults: ServiceDefaults,
    ) -> Self {
        let special = tokenizer.special_tokens();
        Self {
            sampler: SamplingEngine::new(model.clone(), backend.clone(), special),
            beams: BeamSearchEngine::new(model, backend.clone(), special),
            backend,
            extractor,
            tokenizer,
            defaults,
        }
    }

    /// Service defaults overlaid with the request's own settings.
    pub fn generation_config(&self, request: &CaptionRequest) -> GenerationConfig {
        let base = &self.defaults.generation;
        GenerationConfig {
            temperature: request.temperature.unwrap_or(base.temperature),
            best_of: request.best_of.unwrap_or(base.best_of),
            beam_width: request.beam_width.unwrap_or(base.beam_width),
            ramble: request.ramble.unwrap_or(base.ramble),
            seed: request.seed.unwrap_or(base.seed),
            ..base.clone()
        }
    }

    pub fn caption(&self, request: &CaptionRequest) -> Result<CaptionResponse> {
        let start = Instant::now();
        let config = self.generation_config(request);
        let embeddings = self.extractor.extract(&request.image, &self.backend)?;

        let tokens = if request.beam_search.unwrap_or(self.defaults.beam_search) {
            let hypotheses = self.beams.search(&embeddings.features, &config)?;
            hypotheses.into_iter().next().map(|h| h.tokens)
        } else {
            let candidates = self.sampler.generate(&embeddings.features, &config)?;
            select(&candidates, self.defaults.selection).map(|c| c.tokens.clone())
        };
        let tokens =
            tokens.ok_or_else(|| LoupeError::Internal("decoder returned no caption".into()))?;

        let caption = self.tokenizer.decode(&tokens)?;
        let latency = start.elapsed().as_secs_f64();
        info!(
            image = %request.image,
            latency_ms = (latency * 1000.0) as u64,
            "caption ready"
        );
        Ok(CaptionResponse {
            caption,
            latency,
            image: request.image.clone(),
        })
    }
}

impl<M, B> RequestHandler for CaptionService<M, B>
where
    B: Backend + Clone,
    M: CaptionModel<T = B::Tensor> + 'static,
{
    fn handle(&self, request: &CaptionRequest) -> Reply {
        match self.caption(request) {
            Ok(response) => Reply::Caption(response),
            Err(e) => {
                warn!(
                    image = %request.image,
                    not_found = e.is_not_found(),
                    error = %e,
                    "caption request failed"
                );
                Reply::Error(ErrorResponse {
                    error: e.to_string(),
                })
            }
        }
    }
}

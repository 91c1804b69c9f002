use loupe_core::{Backend, CaptionerConfig, LoupeError, Result, Tensor};
use loupe_loader::SafeTensorsLoader;
use tracing::info;

use crate::layers::{DecoderBlock, FeedForward, LayerNorm, Linear, MultiHeadAttention};
use crate::model::{CliptionModel, TextEmbeddings};
use crate::projector::MemoryProjector;

const TOKEN_EMBEDDING_KEY: &str = "text_model.embeddings.token_embedding.weight";
const POSITION_EMBEDDING_KEY: &str = "text_model.embeddings.position_embedding.weight";
const TEXT_PROJECTION_KEY: &str = "text_projection.weight";

/// Load the captioner from its checkpoint plus the frozen text-encoder
/// embeddings it shares with CLIP.
///
/// PyTorch stores linear weights as `[out_features, in_features]`.
/// `matmul(x, W)` needs `[in_features, out_features]`, so decoder weights are
/// transposed at load time. The token table is kept as stored because the
/// output projection multiplies by its transpose directly.
pub fn load_cliption_model<B: Backend + Clone>(
    checkpoint: &SafeTensorsLoader,
    text_encoder: &SafeTensorsLoader,
    config: CaptionerConfig,
    backend: &B,
) -> Result<CliptionModel<B>> {
    config.validate()?;
    let projection = load_linear(checkpoint, "projection", backend)?;
    let pos = checkpoint.load_tensor("memory_pos_embedding", backend)?;
    let pos_numel = pos.numel();
    if pos_numel != config.memory_len * config.hidden_dim {
        return Err(LoupeError::ShapeMismatch {
            expected: vec![1, config.memory_len, config.hidden_dim],
            got: pos.shape().to_vec(),
        });
    }
    let pos = backend.reshape(&pos, &[config.memory_len, config.hidden_dim])?;
    let projector = MemoryProjector::new(projection, pos);

    let mut blocks = Vec::with_capacity(config.num_blocks);
    for i in 0..config.num_blocks {
        let prefix = format!("layers.{i}");
        blocks.push(load_decoder_block(checkpoint, &prefix, &config, backend)?);
    }

    // Stored separately from the decoder blocks in the checkpoint.
    let text_projection = Linear::new(
        transposed(checkpoint, TEXT_PROJECTION_KEY, backend)?,
        None,
    );

    let token_embedding = text_encoder.load_tensor(TOKEN_EMBEDDING_KEY, backend)?;
    let position_embedding = text_encoder.load_tensor(POSITION_EMBEDDING_KEY, backend)?;
    let text = TextEmbeddings::new(token_embedding, position_embedding);

    info!(
        blocks = config.num_blocks,
        hidden = config.hidden_dim,
        vocab = config.vocab_size,
        "CLIPtion decoder weights loaded"
    );
    CliptionModel::new(
        config,
        projector,
        blocks,
        text,
        text_projection,
        backend.clone(),
    )
}

/// Load and transpose a linear weight: [out, in] -> [in, out].
fn transposed<B: Backend>(loader: &SafeTensorsLoader, name: &str, backend: &B) -> Result<B::Tensor> {
    let raw = loader.load_tensor(name, backend)?;
    backend.transpose(&raw, 0, 1)
}

fn load_linear<B: Backend>(
    loader: &SafeTensorsLoader,
    prefix: &str,
    backend: &B,
) -> Result<Linear<B>> {
    let weight = transposed(loader, &format!("{prefix}.weight"), backend)?;
    let bias = loader.load_tensor(&format!("{prefix}.bias"), backend)?;
    Ok(Linear::new(weight, Some(bias)))
}

fn load_layer_norm<B: Backend>(
    loader: &SafeTensorsLoader,
    prefix: &str,
    eps: f32,
    backend: &B,
) -> Result<LayerNorm<B>> {
    let weight = loader.load_tensor(&format!("{prefix}.weight"), backend)?;
    let bias = loader.load_tensor(&format!("{prefix}.bias"), backend)?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Unpack `in_proj_weight` [3H, H] / `in_proj_bias` [3H] into q, k, v.
fn load_attention<B: Backend>(
    loader: &SafeTensorsLoader,
    prefix: &str,
    config: &CaptionerConfig,
    backend: &B,
) -> Result<MultiHeadAttention<B>> {
    let h = config.hidden_dim;
    let in_w = loader.load_tensor(&format!("{prefix}.in_proj_weight"), backend)?;
    let in_b = loader.load_tensor(&format!("{prefix}.in_proj_bias"), backend)?;
    if in_w.shape() != [3 * h, h] || in_b.numel() != 3 * h {
        return Err(LoupeError::ShapeMismatch {
            expected: vec![3 * h, h],
            got: in_w.shape().to_vec(),
        });
    }

    let part = |i: usize| -> Result<Linear<B>> {
        let w = backend.slice_rows(&in_w, i * h, h)?;
        let b = backend.slice_rows(&in_b, i * h, h)?;
        Ok(Linear::new(backend.transpose(&w, 0, 1)?, Some(b)))
    };
    let (wq, wk, wv) = (part(0)?, part(1)?, part(2)?);
    let out_proj = load_linear(loader, &format!("{prefix}.out_proj"), backend)?;
    Ok(MultiHeadAttention::new(wq, wk, wv, out_proj, config))
}

fn load_decoder_block<B: Backend>(
    loader: &SafeTensorsLoader,
    prefix: &str,
    config: &CaptionerConfig,
    backend: &B,
) -> Result<DecoderBlock<B>> {
    let eps = config.layer_norm_eps;
    let norm1 = load_layer_norm(loader, &format!("{prefix}.norm1"), eps, backend)?;
    let self_attn = load_attention(loader, &format!("{prefix}.self_attn"), config, backend)?;
    let norm2 = load_layer_norm(loader, &format!("{prefix}.norm2"), eps, backend)?;
    let cross_attn = load_attention(loader, &format!("{prefix}.cross_attn"), config, backend)?;
    let norm3 = load_layer_norm(loader, &format!("{prefix}.norm3"), eps, backend)?;

    // mlp.1 is the parameter-free GELU; mlp.2 is absent in the checkpoint.
    let fc1 = load_linear(loader, &format!("{prefix}.mlp.0"), backend)?;
    let fc2 = load_linear(loader, &format!("{prefix}.mlp.3"), backend)?;
    let mlp = FeedForward::new(fc1, fc2);

    Ok(DecoderBlock::new(norm1, self_attn, norm2, cross_attn, norm3, mlp))
}

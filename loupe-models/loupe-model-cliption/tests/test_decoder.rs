//! Numeric properties of the CLIPtion decoder on a tiny deterministic
//! instance, built both directly and through the checkpoint loader.

use std::collections::BTreeMap;
use std::path::Path;

use loupe_backend_cpu::{CpuBackend, CpuTensor};
use loupe_core::{Backend, CaptionModel, CaptionerConfig, DType, LoupeError, Tensor};
use loupe_loader::SafeTensorsLoader;
use loupe_model_cliption::layers::{
    DecoderBlock, FeedForward, LayerNorm, Linear, MultiHeadAttention,
};
use loupe_model_cliption::{
    load_cliption_model, CausalMask, CliptionModel, MemoryProjector, TextEmbeddings,
};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

fn tiny_config() -> CaptionerConfig {
    CaptionerConfig {
        hidden_dim: 8,
        num_heads: 2,
        num_blocks: 2,
        max_length: 6,
        vision_embed_dim: 4,
        memory_len: 3,
        vocab_size: 6,
        layer_norm_eps: 1e-5,
        dtype: DType::F32,
    }
}

/// PyTorch-layout parameters keyed by checkpoint name.
type Params = BTreeMap<String, (Vec<usize>, Vec<f32>)>;

fn pseudo(n: usize, salt: usize) -> Vec<f32> {
    (0..n)
        .map(|i| ((((i + 1) * (salt + 7) * 37) % 101) as f32 / 101.0 - 0.5) * 0.8)
        .collect()
}

fn tiny_params(config: &CaptionerConfig) -> (Params, Params) {
    let h = config.hidden_dim;
    let mut salt = 0;
    let mut next = |shape: Vec<usize>| {
        salt += 1;
        let n = shape.iter().product();
        (shape, pseudo(n, salt))
    };

    let mut ckpt = Params::new();
    ckpt.insert("projection.weight".into(), next(vec![h, config.vision_embed_dim]));
    ckpt.insert("projection.bias".into(), next(vec![h]));
    ckpt.insert("memory_pos_embedding".into(), next(vec![1, config.memory_len, h]));
    for i in 0..config.num_blocks {
        for norm in ["norm1", "norm2", "norm3"] {
            ckpt.insert(format!("layers.{i}.{norm}.weight"), (vec![h], vec![1.0; h]));
            ckpt.insert(format!("layers.{i}.{norm}.bias"), next(vec![h]));
        }
        for attn in ["self_attn", "cross_attn"] {
            ckpt.insert(format!("layers.{i}.{attn}.in_proj_weight"), next(vec![3 * h, h]));
            ckpt.insert(format!("layers.{i}.{attn}.in_proj_bias"), next(vec![3 * h]));
            ckpt.insert(format!("layers.{i}.{attn}.out_proj.weight"), next(vec![h, h]));
            ckpt.insert(format!("layers.{i}.{attn}.out_proj.bias"), next(vec![h]));
        }
        ckpt.insert(format!("layers.{i}.mlp.0.weight"), next(vec![4 * h, h]));
        ckpt.insert(format!("layers.{i}.mlp.0.bias"), next(vec![4 * h]));
        ckpt.insert(format!("layers.{i}.mlp.3.weight"), next(vec![h, 4 * h]));
        ckpt.insert(format!("layers.{i}.mlp.3.bias"), next(vec![h]));
    }
    ckpt.insert("text_projection.weight".into(), next(vec![h, h]));

    let mut clip = Params::new();
    clip.insert(
        "text_model.embeddings.token_embedding.weight".into(),
        next(vec![config.vocab_size, h]),
    );
    clip.insert(
        "text_model.embeddings.position_embedding.weight".into(),
        next(vec![config.max_length, h]),
    );
    (ckpt, clip)
}

fn tensor(backend: &CpuBackend, params: &Params, name: &str) -> CpuTensor {
    let (shape, data) = &params[name];
    backend.copy_from_host_f32(data, shape).unwrap()
}

fn linear_t(backend: &CpuBackend, w: &[f32], out: usize, inp: usize, b: Option<Vec<f32>>) -> Linear<CpuBackend> {
    let w = backend.copy_from_host_f32(w, &[out, inp]).unwrap();
    let w = backend.transpose(&w, 0, 1).unwrap();
    let b = b.map(|b| backend.copy_from_host_f32(&b, &[out]).unwrap());
    Linear::new(w, b)
}

/// Build the model by hand from PyTorch-layout parameters.
fn build_direct(backend: &CpuBackend, config: &CaptionerConfig, ckpt: &Params, clip: &Params) -> CliptionModel<CpuBackend> {
    let h = config.hidden_dim;
    let p = |name: &str| ckpt[name].1.clone();

    let projection = linear_t(backend, &p("projection.weight"), h, config.vision_embed_dim, Some(p("projection.bias")));
    let pos = backend
        .copy_from_host_f32(&p("memory_pos_embedding"), &[config.memory_len, h])
        .unwrap();
    let projector = MemoryProjector::new(projection, pos);

    let mut blocks = Vec::new();
    for i in 0..config.num_blocks {
        let norm = |n: &str| {
            LayerNorm::new(
                tensor(backend, ckpt, &format!("layers.{i}.{n}.weight")),
                tensor(backend, ckpt, &format!("layers.{i}.{n}.bias")),
                config.layer_norm_eps,
            )
        };
        let attn = |a: &str| {
            let w = p(&format!("layers.{i}.{a}.in_proj_weight"));
            let b = p(&format!("layers.{i}.{a}.in_proj_bias"));
            let part = |j: usize| {
                linear_t(backend, &w[j * h * h..(j + 1) * h * h], h, h, Some(b[j * h..(j + 1) * h].to_vec()))
            };
            let out = linear_t(
                backend,
                &p(&format!("layers.{i}.{a}.out_proj.weight")),
                h,
                h,
                Some(p(&format!("layers.{i}.{a}.out_proj.bias"))),
            );
            MultiHeadAttention::new(part(0), part(1), part(2), out, config)
        };
        let mlp = FeedForward::new(
            linear_t(backend, &p(&format!("layers.{i}.mlp.0.weight")), 4 * h, h, Some(p(&format!("layers.{i}.mlp.0.bias")))),
            linear_t(backend, &p(&format!("layers.{i}.mlp.3.weight")), h, 4 * h, Some(p(&format!("layers.{i}.mlp.3.bias")))),
        );
        blocks.push(DecoderBlock::new(
            norm("norm1"),
            attn("self_attn"),
            norm("norm2"),
            attn("cross_attn"),
            norm("norm3"),
            mlp,
        ));
    }

    let text = TextEmbeddings::new(
        tensor(backend, clip, "text_model.embeddings.token_embedding.weight"),
        tensor(backend, clip, "text_model.embeddings.position_embedding.weight"),
    );
    let text_projection = linear_t(backend, &p("text_projection.weight"), h, h, None);
    CliptionModel::new(config.clone(), projector, blocks, text, text_projection, backend.clone()).unwrap()
}

fn write_params(path: &Path, params: &Params) {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = params
        .iter()
        .map(|(k, (shape, data))| {
            (k.clone(), shape.clone(), data.iter().flat_map(|v| v.to_le_bytes()).collect())
        })
        .collect();
    let views: Vec<(String, TensorView<'_>)> = bytes
        .iter()
        .map(|(k, shape, b)| (k.clone(), TensorView::new(Dtype::F32, shape.clone(), b).unwrap()))
        .collect();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

fn features(backend: &CpuBackend, config: &CaptionerConfig) -> CpuTensor {
    let n = config.memory_len * config.vision_embed_dim;
    backend
        .copy_from_host_f32(&pseudo(n, 99), &[config.memory_len, config.vision_embed_dim])
        .unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
    }
}

#[test]
fn test_causal_mask_slice() {
    let backend = CpuBackend::new();
    let mask = CausalMask::new(5);
    assert_eq!(mask.size(), 5);
    assert_eq!(mask.get(4, 4), 0.0);
    assert_eq!(mask.get(1, 2), f32::NEG_INFINITY);
    let s = mask.slice(3, &backend).unwrap();
    assert_eq!(s.shape(), &[3, 3]);
    let data = backend.copy_to_host_f32(&s).unwrap();
    for i in 0..3 {
        for j in 0..3 {
            let v = data[i * 3 + j];
            if j <= i {
                assert_eq!(v, 0.0);
            } else {
                assert_eq!(v, f32::NEG_INFINITY);
            }
        }
    }
    assert!(mask.slice(0, &backend).is_err());
    assert!(mask.slice(6, &backend).is_err());
}

#[test]
fn test_projector_rejects_wrong_patch_count() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);
    let model = build_direct(&backend, &config, &ckpt, &clip);

    let bad = backend.copy_from_host_f32(&[0.0; 8], &[2, 4]).unwrap();
    assert!(model.prepare_memory(&bad).is_err());

    let memory = model.prepare_memory(&features(&backend, &config)).unwrap();
    assert_eq!(memory.memory.shape(), &[config.memory_len, config.hidden_dim]);
}

#[test]
fn test_output_projection_is_tied_to_token_table() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);
    let model = build_direct(&backend, &config, &ckpt, &clip);

    let table = model.text_embeddings().token_embedding();
    assert!(model.output_projection().weight().shares_storage(table));

    let h = backend.copy_from_host_f32(&pseudo(8, 3), &[1, 8]).unwrap();
    let logits = model.output_projection().forward(&h, &backend).unwrap();
    assert_eq!(logits.shape(), &[1, config.vocab_size]);
    let logits = backend.copy_to_host_f32(&logits).unwrap();
    for (v, logit) in logits.iter().enumerate() {
        let expected: f32 = table.row(v).iter().zip(h.data()).map(|(a, b)| a * b).sum();
        assert!((logit - expected).abs() < 1e-5);
    }
}

#[test]
fn test_future_tokens_do_not_change_earlier_positions() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);
    let model = build_direct(&backend, &config, &ckpt, &clip);
    let memory = model.prepare_memory(&features(&backend, &config)).unwrap();

    let a = model.decode_hidden(&[&[0, 1, 2]], &memory).unwrap();
    let b = model.decode_hidden(&[&[0, 1, 5]], &memory).unwrap();
    let a = backend.copy_to_host_f32(&a).unwrap();
    let b = backend.copy_to_host_f32(&b).unwrap();
    let h = config.hidden_dim;
    assert_close(&a[..2 * h], &b[..2 * h], 1e-5);
    assert!(a[2 * h..].iter().zip(&b[2 * h..]).any(|(x, y)| (x - y).abs() > 1e-6));
}

#[test]
fn test_batched_rows_match_single_rows() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);
    let model = build_direct(&backend, &config, &ckpt, &clip);
    let memory = model.prepare_memory(&features(&backend, &config)).unwrap();

    let rows: [&[u32]; 2] = [&[0, 3, 4], &[0, 2, 2]];
    let batched = model.forward(&rows, &memory).unwrap();
    assert_eq!(batched.logits.shape(), &[2, config.vocab_size]);
    let batched = backend.copy_to_host_f32(&batched.logits).unwrap();

    for (i, row) in rows.iter().enumerate() {
        let single = model.forward(&[*row], &memory).unwrap();
        let single = backend.copy_to_host_f32(&single.logits).unwrap();
        assert_close(&batched[i * 6..(i + 1) * 6], &single, 1e-5);
    }
}

#[test]
fn test_forward_rejects_ragged_or_oversized_prefixes() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);
    let model = build_direct(&backend, &config, &ckpt, &clip);
    let memory = model.prepare_memory(&features(&backend, &config)).unwrap();

    let ragged: [&[u32]; 2] = [&[0, 1], &[0]];
    assert!(model.forward(&ragged, &memory).is_err());
    assert!(model.forward(&[], &memory).is_err());
    let too_long: [&[u32]; 1] = [&[0; 7]];
    assert!(model.forward(&too_long, &memory).is_err());
}

#[test]
fn test_loaded_checkpoint_matches_direct_construction() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);

    let dir = tempfile::tempdir().unwrap();
    let ckpt_path = dir.path().join("CLIPtion_tiny.safetensors");
    let clip_path = dir.path().join("clip_text.safetensors");
    write_params(&ckpt_path, &ckpt);
    write_params(&clip_path, &clip);

    let ckpt_loader = SafeTensorsLoader::new(&ckpt_path).unwrap();
    let clip_loader = SafeTensorsLoader::new(&clip_path).unwrap();
    let loaded = load_cliption_model(&ckpt_loader, &clip_loader, config.clone(), &backend).unwrap();
    let direct = build_direct(&backend, &config, &ckpt, &clip);

    let feats = features(&backend, &config);
    let prefix: [&[u32]; 1] = [&[0, 4, 1, 3]];
    let a = loaded.forward(&prefix, &loaded.prepare_memory(&feats).unwrap()).unwrap();
    let b = direct.forward(&prefix, &direct.prepare_memory(&feats).unwrap()).unwrap();
    assert_close(
        &backend.copy_to_host_f32(&a.logits).unwrap(),
        &backend.copy_to_host_f32(&b.logits).unwrap(),
        1e-5,
    );

    let x = backend.copy_from_host_f32(&pseudo(8, 5), &[1, 8]).unwrap();
    let pa = loaded.text_projection().forward(&x, &backend).unwrap();
    let pb = direct.text_projection().forward(&x, &backend).unwrap();
    assert_close(pa.data(), pb.data(), 1e-6);
}

#[test]
fn test_missing_checkpoint_key_fails_load() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (mut ckpt, clip) = tiny_params(&config);
    ckpt.remove("text_projection.weight");

    let dir = tempfile::tempdir().unwrap();
    let ckpt_path = dir.path().join("ckpt.safetensors");
    let clip_path = dir.path().join("clip.safetensors");
    write_params(&ckpt_path, &ckpt);
    write_params(&clip_path, &clip);

    let result = load_cliption_model(
        &SafeTensorsLoader::new(&ckpt_path).unwrap(),
        &SafeTensorsLoader::new(&clip_path).unwrap(),
        config,
        &backend,
    );
    assert!(result.is_err());
}

#[test]
fn test_zero_heads_is_a_load_error() {
    let backend = CpuBackend::new();
    let config = tiny_config();
    let (ckpt, clip) = tiny_params(&config);

    let dir = tempfile::tempdir().unwrap();
    let ckpt_path = dir.path().join("ckpt.safetensors");
    let clip_path = dir.path().join("clip.safetensors");
    write_params(&ckpt_path, &ckpt);
    write_params(&clip_path, &clip);

    let broken = CaptionerConfig {
        num_heads: 0,
        ..config
    };
    let result = load_cliption_model(
        &SafeTensorsLoader::new(&ckpt_path).unwrap(),
        &SafeTensorsLoader::new(&clip_path).unwrap(),
        broken,
        &backend,
    );
    assert!(matches!(result, Err(LoupeError::InvalidConfig(_))));
}

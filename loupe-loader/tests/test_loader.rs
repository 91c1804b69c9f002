use std::path::Path;

use loupe_backend_cpu::CpuBackend;
use loupe_core::{Backend, LoupeError, Tensor};
use loupe_loader::{CaptionerFileConfig, SafeTensorsLoader};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

fn write_tensors(path: &Path, tensors: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) {
    let views: Vec<(String, TensorView<'_>)> = tensors
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            (
                name.to_string(),
                TensorView::new(*dtype, shape.clone(), bytes).unwrap(),
            )
        })
        .collect();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

fn f32_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f16_bytes(data: &[f32]) -> Vec<u8> {
    data.iter()
        .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
        .collect()
}

#[test]
fn test_load_f32_and_f16_tensors() {
    let dir = tempfile::tempdir().unwrap();
    write_tensors(
        &dir.path().join("weights.safetensors"),
        &[
            ("a.weight", Dtype::F32, vec![2, 2], f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
            ("b.bias", Dtype::F16, vec![3], f16_bytes(&[0.5, -1.0, 2.0])),
        ],
    );

    let backend = CpuBackend::new();
    let loader = SafeTensorsLoader::new(dir.path()).unwrap();
    assert!(loader.contains("a.weight"));
    assert_eq!(loader.tensor_names().len(), 2);

    let a = loader.load_tensor("a.weight", &backend).unwrap();
    assert_eq!(a.shape(), &[2, 2]);
    assert_eq!(backend.copy_to_host_f32(&a).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let b = loader.load_tensor("b.bias", &backend).unwrap();
    assert_eq!(backend.copy_to_host_f32(&b).unwrap(), vec![0.5, -1.0, 2.0]);
}

#[test]
fn test_open_single_file_and_missing_tensor() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("only.safetensors");
    write_tensors(&file, &[("x", Dtype::F32, vec![1], f32_bytes(&[7.0]))]);

    let backend = CpuBackend::new();
    let loader = SafeTensorsLoader::new(&file).unwrap();
    assert!(loader.load_tensor("x", &backend).is_ok());
    assert!(matches!(
        loader.load_tensor("y", &backend),
        Err(LoupeError::ModelLoad(_))
    ));
}

#[test]
fn test_shards_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    write_tensors(
        &dir.path().join("part-0.safetensors"),
        &[("a", Dtype::F32, vec![1], f32_bytes(&[1.0]))],
    );
    write_tensors(
        &dir.path().join("part-1.safetensors"),
        &[("b", Dtype::F32, vec![1], f32_bytes(&[2.0]))],
    );
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let backend = CpuBackend::new();
    let loader = SafeTensorsLoader::new(dir.path()).unwrap();
    let mut names = loader.tensor_names();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    let b = loader.load_tensor("b", &backend).unwrap();
    assert_eq!(backend.copy_to_host_f32(&b).unwrap(), vec![2.0]);
}

#[test]
fn test_duplicate_tensor_across_shards_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_tensors(
        &dir.path().join("old.safetensors"),
        &[("layers.0.fc1.weight", Dtype::F32, vec![1], f32_bytes(&[1.0]))],
    );
    write_tensors(
        &dir.path().join("new.safetensors"),
        &[("layers.0.fc1.weight", Dtype::F32, vec![1], f32_bytes(&[2.0]))],
    );

    match SafeTensorsLoader::new(dir.path()) {
        Err(LoupeError::ModelLoad(msg)) => assert!(msg.contains("layers.0.fc1.weight")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("duplicate tensor names were merged"),
    }
}

#[test]
fn test_missing_checkpoint_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = SafeTensorsLoader::new(&dir.path().join("nope.safetensors"))
        .err()
        .unwrap();
    assert!(err.is_not_found());

    // Directory without any checkpoint
    let err = SafeTensorsLoader::new(dir.path()).err().unwrap();
    assert!(err.is_not_found());
}

#[test]
fn test_config_defaults() {
    let config: CaptionerFileConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.hidden_dim, 768);
    assert_eq!(config.num_heads, 8);
    assert_eq!(config.num_blocks, 6);
    assert_eq!(config.max_length, 77);
    assert_eq!(config.vision_embed_dim, 1024);
    assert_eq!(config.memory_len, 257);
    assert!((config.layer_norm_eps - 1e-5).abs() < 1e-10);
}

#[test]
fn test_config_overrides_and_vocab() {
    let json = r#"{"hidden_dim": 512, "num_heads": 4, "max_length": 50}"#;
    let config: CaptionerFileConfig = serde_json::from_str(json).unwrap();
    let mc = config.to_captioner_config(49408).unwrap();
    assert_eq!(mc.hidden_dim, 512);
    assert_eq!(mc.head_dim(), 128);
    assert_eq!(mc.ffn_dim(), 2048);
    assert_eq!(mc.max_length, 50);
    assert_eq!(mc.num_blocks, 6);
    assert_eq!(mc.vocab_size, 49408);
}

#[test]
fn test_broken_architecture_is_rejected() {
    for json in [
        r#"{"num_heads": 0}"#,
        r#"{"hidden_dim": 768, "num_heads": 7}"#,
        r#"{"max_length": 1}"#,
        r#"{"num_blocks": 0}"#,
        r#"{"memory_len": 0}"#,
    ] {
        let config: CaptionerFileConfig = serde_json::from_str(json).unwrap();
        let err = config.to_captioner_config(49408).unwrap_err();
        assert!(
            matches!(err, LoupeError::InvalidConfig(_)),
            "{json}: {err:?}"
        );
    }

    let config: CaptionerFileConfig = serde_json::from_str("{}").unwrap();
    assert!(matches!(
        config.to_captioner_config(0),
        Err(LoupeError::InvalidConfig(_))
    ));
}

#[test]
fn test_zero_heads_config_file_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), r#"{"num_heads": 0}"#).unwrap();
    let config = CaptionerFileConfig::load_or_default(dir.path()).unwrap();
    assert!(config.to_captioner_config(10).is_err());
}

#[test]
fn test_config_file_is_optional() {
    let dir = tempfile::tempdir().unwrap();
    let config = CaptionerFileConfig::load_or_default(dir.path()).unwrap();
    assert_eq!(config.hidden_dim, 768);

    std::fs::write(dir.path().join("config.json"), r#"{"num_blocks": 2}"#).unwrap();
    let config = CaptionerFileConfig::load_or_default(dir.path()).unwrap();
    assert_eq!(config.num_blocks, 2);
}

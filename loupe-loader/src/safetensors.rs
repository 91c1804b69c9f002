use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use loupe_core::{Backend, LoupeError, Result};
use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::debug;

/// Memory-mapped view over one or more `.safetensors` files, keyed by
/// dotted parameter name.
pub struct SafeTensorsLoader {
    mmaps: Vec<Mmap>,
    /// Maps tensor name -> mmap index for O(1) lookup.
    tensor_index: HashMap<String, usize>,
}

impl SafeTensorsLoader {
    /// Open a single `.safetensors` file, or every `.safetensors` file in a
    /// directory as shards of one checkpoint. Shards must not share names.
    pub fn new(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoupeError::NotFound(format!(
                "checkpoint path {} does not exist",
                path.display()
            )));
        }
        if path.is_file() {
            return Self::from_files(&[path.to_path_buf()]);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(LoupeError::NotFound(format!(
                "no .safetensors files found in {}",
                path.display()
            )));
        }
        Self::from_files(&files)
    }

    pub fn from_files(files: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(files.len());
        for path in files {
            let file = std::fs::File::open(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LoupeError::NotFound(format!("could not find {}", path.display()))
                } else {
                    LoupeError::Io(e)
                }
            })?;
            // SAFETY: the file is opened read-only and kept mapped for the
            // loader's lifetime; weights are never written through the map.
            mmaps.push(unsafe { Mmap::map(&file) }?);
        }

        // Build tensor name -> file index mapping
        let mut tensor_index = HashMap::new();
        for (idx, mmap) in mmaps.iter().enumerate() {
            let tensors = SafeTensors::deserialize(mmap)
                .map_err(|e| LoupeError::ModelLoad(e.to_string()))?;
            for name in tensors.names() {
                if let Some(prev) = tensor_index.insert(name.to_string(), idx) {
                    return Err(LoupeError::ModelLoad(format!(
                        "tensor '{}' appears in both {} and {}",
                        name,
                        files[prev].display(),
                        files[idx].display()
                    )));
                }
            }
        }
        debug!(files = files.len(), tensors = tensor_index.len(), "indexed safetensors");

        Ok(Self {
            mmaps,
            tensor_index,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensor_index.contains_key(name)
    }

    /// Load a specific tensor by name.
    pub fn load_tensor<B: Backend>(&self, name: &str, backend: &B) -> Result<B::Tensor> {
        let idx = self.tensor_index.get(name).ok_or_else(|| {
            LoupeError::ModelLoad(format!("Tensor '{}' not found", name))
        })?;
        let tensors = SafeTensors::deserialize(&self.mmaps[*idx])
            .map_err(|e| LoupeError::ModelLoad(e.to_string()))?;
        let view = tensors
            .tensor(name)
            .map_err(|e| LoupeError::ModelLoad(e.to_string()))?;
        let shape: Vec<usize> = view.shape().to_vec();
        view_to_tensor(name, view, &shape, backend)
    }

    /// List all tensor names across all files.
    pub fn tensor_names(&self) -> Vec<String> {
        self.tensor_index.keys().cloned().collect()
    }
}

/// Reinterpret raw little-endian bytes, copying only when the mapped slice
/// is not aligned for `T`.
fn cast_or_copy<T: Pod>(data: &[u8]) -> Cow<'_, [T]> {
    match bytemuck::try_cast_slice(data) {
        Ok(slice) => Cow::Borrowed(slice),
        Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(data)),
    }
}

fn view_to_tensor<B: Backend>(
    name: &str,
    view: safetensors::tensor::TensorView<'_>,
    shape: &[usize],
    backend: &B,
) -> Result<B::Tensor> {
    let data = view.data();
    match view.dtype() {
        safetensors::Dtype::F16 => backend.copy_from_host_f16(&cast_or_copy::<half::f16>(data), shape),
        safetensors::Dtype::BF16 => {
            backend.copy_from_host_bf16(&cast_or_copy::<half::bf16>(data), shape)
        }
        safetensors::Dtype::F32 => backend.copy_from_host_f32(&cast_or_copy::<f32>(data), shape),
        other => Err(LoupeError::ModelLoad(format!(
            "Unsupported safetensors dtype {:?} for '{}'",
            other, name
        ))),
    }
}

use loupe_core::{Backend, LoupeError, Result};

/// Square additive mask: 0 on and below the diagonal, -inf above.
///
/// Built once for the model's `max_length` and sliced to the live prefix at
/// every decode step.
#[derive(Debug, Clone)]
pub struct CausalMask {
    data: Vec<f32>,
    size: usize,
}

impl CausalMask {
    pub fn new(size: usize) -> Self {
        let mut data = vec![0.0f32; size * size];
        for i in 0..size {
            for j in (i + 1)..size {
                data[i * size + j] = f32::NEG_INFINITY;
            }
        }
        Self { data, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.size + j]
    }

    /// Top-left `[t, t]` block as a backend tensor.
    pub fn slice<B: Backend>(&self, t: usize, backend: &B) -> Result<B::Tensor> {
        if t == 0 || t > self.size {
            return Err(LoupeError::InvalidArgument(format!(
                "prefix length {t} outside causal mask of size {}",
                self.size
            )));
        }
        let mut out = Vec::with_capacity(t * t);
        for i in 0..t {
            out.extend_from_slice(&self.data[i * self.size..i * self.size + t]);
        }
        backend.copy_from_host_f32(&out, &[t, t])
    }
}

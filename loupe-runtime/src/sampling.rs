use rand::rngs::StdRng;
use rand::Rng;

use loupe_core::{GenerationConfig, LoupeError, Result, SampleResult};

/// Logit processor pipeline: EOS masking followed by temperature scaling.
///
/// Masked entries are `-inf`, which temperature leaves untouched, so the
/// order only decides which logits set the row maximum. Masking works on the
/// row's previous token only, so once a row emits EOS every later position is
/// EOS as well.
pub struct LogitProcessorPipeline {
    temperature: f32,
    eos: u32,
    ramble: bool,
}

impl LogitProcessorPipeline {
    pub fn new(temperature: f32, eos: u32, ramble: bool) -> Self {
        Self {
            temperature,
            eos,
            ramble,
        }
    }

    pub fn from_config(config: &GenerationConfig, eos: u32) -> Self {
        Self::new(config.temperature, eos, config.ramble)
    }

    /// Apply all logit processors in order. Modifies `logits` in place.
    pub fn apply(&self, logits: &mut [f32], prev_token: u32) {
        self.apply_eos_mask(logits, prev_token);
        self.apply_temperature(logits);
    }

    /// Computes `(x - max) / T`, which leaves the distribution unchanged and
    /// cannot overflow however small `T` gets.
    fn apply_temperature(&self, logits: &mut [f32]) {
        if (self.temperature - 1.0).abs() < f32::EPSILON {
            return;
        }
        let max = logits
            .iter()
            .copied()
            .filter(|x| x.is_finite())
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            return;
        }
        for logit in logits.iter_mut() {
            *logit = (*logit - max) / self.temperature;
        }
    }

    /// A finished row may only repeat EOS. In ramble mode a live row may
    /// never produce it.
    pub fn apply_eos_mask(&self, logits: &mut [f32], prev_token: u32) {
        let eos = self.eos as usize;
        if eos >= logits.len() {
            return;
        }
        if prev_token == self.eos {
            logits.fill(f32::NEG_INFINITY);
            logits[eos] = 0.0;
        } else if self.ramble {
            logits[eos] = f32::NEG_INFINITY;
        }
    }
}

/// CPU-based sampler over host logits.
pub struct CpuSampler;

impl CpuSampler {
    /// Draw one token from `softmax(logits)` using the caller's RNG.
    pub fn sample(&self, logits: &[f32], rng: &mut StdRng) -> Result<SampleResult> {
        let probs = softmax(logits)?;
        self.multinomial(&probs, rng)
    }

    /// Arg-max token with its log-probability under `softmax(logits)`.
    pub fn greedy(&self, logits: &[f32]) -> Result<SampleResult> {
        let logprobs = log_softmax(logits)?;
        let (token_id, logprob) = logprobs
            .iter()
            .copied()
            .enumerate()
            .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
            .ok_or_else(|| LoupeError::InvalidArgument("empty logits".into()))?;
        Ok(SampleResult {
            token_id: token_id as u32,
            logprob,
        })
    }

    /// The `k` most likely tokens, best first. Masked tokens are never returned.
    pub fn top_k(&self, logits: &[f32], k: usize) -> Result<Vec<SampleResult>> {
        let logprobs = log_softmax(logits)?;
        let mut indexed: Vec<(usize, f32)> = logprobs
            .into_iter()
            .enumerate()
            .filter(|(_, lp)| lp.is_finite())
            .collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
        Ok(indexed
            .into_iter()
            .map(|(i, logprob)| SampleResult {
                token_id: i as u32,
                logprob,
            })
            .collect())
    }

    fn multinomial(&self, probs: &[f32], rng: &mut StdRng) -> Result<SampleResult> {
        let r: f32 = rng.gen();
        let mut cumulative = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if p > 0.0 && cumulative >= r {
                return Ok(SampleResult {
                    token_id: i as u32,
                    logprob: p.ln(),
                });
            }
        }

        // Rounding left `r` above the total; take the last reachable token.
        let (last, p) = probs
            .iter()
            .copied()
            .enumerate()
            .rfind(|(_, p)| *p > 0.0)
            .ok_or_else(|| LoupeError::Numeric("all probabilities are zero".into()))?;
        Ok(SampleResult {
            token_id: last as u32,
            logprob: p.ln(),
        })
    }
}

fn max_logit(logits: &[f32]) -> Result<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY || max.is_nan() {
        return Err(LoupeError::Numeric(
            "no finite logit left after masking".into(),
        ));
    }
    Ok(max)
}

pub fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let max = max_logit(logits)?;
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

pub fn log_softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let max = max_logit(logits)?;
    let log_sum = logits
        .iter()
        .map(|&x| (x - max).exp())
        .sum::<f32>()
        .ln();
    Ok(logits.iter().map(|&x| x - max - log_sum).collect())
}

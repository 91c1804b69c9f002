//! Decode loops: seeded sampling with best-of rows, greedy decoding and beam
//! search, all driven one position at a time against prepared image memory.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use loupe_core::{
    Backend, CaptionModel, FinishReason, GenerationConfig, LoupeError, Result, SampleResult,
    SpecialTokens,
};

use crate::sampling::{CpuSampler, LogitProcessorPipeline};
use crate::sequence::SequenceBuffer;

/// One finished row of a sampling call.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Full buffer, `max_length` ids starting with BOS.
    pub tokens: Vec<u32>,
    /// Sum of per-step log-probabilities of the drawn tokens.
    pub logprob: f32,
    pub generated_len: usize,
    pub finish_reason: FinishReason,
    scored_len: usize,
}

impl Candidate {
    fn from_buffer(buffer: SequenceBuffer, logprob: f32) -> Self {
        Self {
            generated_len: buffer.generated_len(),
            finish_reason: buffer.finish_reason(),
            scored_len: buffer.scored_len(),
            tokens: buffer.into_tokens(),
            logprob,
        }
    }

    /// Log-probability per scored position.
    pub fn normalized_logprob(&self) -> f32 {
        self.logprob / self.scored_len.max(1) as f32
    }
}

/// One beam-search result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    /// Cumulative log-probability of the chosen tokens.
    pub logprob: f32,
    /// `logprob / len^length_penalty`; hypotheses are ranked by this.
    pub score: f32,
    pub generated_len: usize,
    pub finish_reason: FinishReason,
}

/// How to pick the caption from a set of best-of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    First,
    #[default]
    HighestLikelihood,
    LengthNormalized,
}

/// Pick one candidate. Ties keep the earlier row.
pub fn select(candidates: &[Candidate], policy: SelectionPolicy) -> Option<&Candidate> {
    let key = |c: &Candidate| match policy {
        SelectionPolicy::First => 0.0,
        SelectionPolicy::HighestLikelihood => c.logprob,
        SelectionPolicy::LengthNormalized => c.normalized_logprob(),
    };
    candidates
        .iter()
        .reduce(|best, c| if key(c) > key(best) { c } else { best })
}

/// Per-row token choice for one decode step.
enum Strategy<'a> {
    Sample(&'a mut [StdRng]),
    Greedy,
}

/// Run the model on every buffer's prefix of length `t` and return host
/// logits, one `vocab`-wide row per buffer.
fn step_logits<M, B>(
    model: &M,
    backend: &B,
    buffers: &[&SequenceBuffer],
    t: usize,
    memory: &M::Memory,
) -> Result<Vec<Vec<f32>>>
where
    B: Backend,
    M: CaptionModel<T = B::Tensor>,
{
    let prefixes: Vec<&[u32]> = buffers.iter().map(|b| b.prefix(t)).collect();
    let output = model.forward(&prefixes, memory)?;
    backend.synchronize()?;
    let host = backend.copy_to_host_f32(&output.logits)?;

    let vocab = model.config().vocab_size;
    if host.len() != buffers.len() * vocab {
        return Err(LoupeError::Internal(format!(
            "expected {} logits for {} rows, got {}",
            buffers.len() * vocab,
            buffers.len(),
            host.len()
        )));
    }
    Ok(host.chunks_exact(vocab).map(<[f32]>::to_vec).collect())
}

/// Sampling decoder: `best_of` independent rows per image, one shared memory.
pub struct SamplingEngine<M, B> {
    model: Arc<M>,
    backend: B,
    special: SpecialTokens,
    sampler: CpuSampler,
}

impl<M, B> SamplingEngine<M, B>
where
    B: Backend,
    M: CaptionModel<T = B::Tensor>,
{
    pub fn new(model: Arc<M>, backend: B, special: SpecialTokens) -> Self {
        Self {
            model,
            backend,
            special,
            sampler: CpuSampler,
        }
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    /// Sample `best_of` rows for one image. Row `r` draws from its own RNG
    /// seeded with `config.seed + r`.
    pub fn generate(&self, features: &B::Tensor, config: &GenerationConfig) -> Result<Vec<Candidate>> {
        let max_length = config.validate(self.model.config().max_length)?;
        let memory = self.model.prepare_memory(features)?;
        self.generate_with_memory(&memory, config, max_length, config.seed)
    }

    /// Arg-max decode with the same masking as [`generate`](Self::generate).
    /// Temperature does not change the arg-max and is not applied.
    pub fn greedy(&self, features: &B::Tensor, config: &GenerationConfig) -> Result<Candidate> {
        let max_length = config.validate(self.model.config().max_length)?;
        let memory = self.model.prepare_memory(features)?;
        let pipeline = LogitProcessorPipeline::new(1.0, self.special.eos, config.ramble);
        let mut rows = self.decode(&memory, 1, max_length, &pipeline, config.ramble, Strategy::Greedy)?;
        rows.pop()
            .ok_or_else(|| LoupeError::Internal("greedy decode produced no row".into()))
    }

    /// Sample several images in turn. Image `i` uses base seed
    /// `config.seed + i`.
    pub fn caption_batch(
        &self,
        features: &[B::Tensor],
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<Candidate>>> {
        let max_length = config.validate(self.model.config().max_length)?;
        features
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let memory = self.model.prepare_memory(f)?;
                let seed = config.seed.wrapping_add(i as u64);
                self.generate_with_memory(&memory, config, max_length, seed)
            })
            .collect()
    }

    fn generate_with_memory(
        &self,
        memory: &M::Memory,
        config: &GenerationConfig,
        max_length: usize,
        seed: u64,
    ) -> Result<Vec<Candidate>> {
        let mut rngs: Vec<StdRng> = (0..config.best_of)
            .map(|r| StdRng::seed_from_u64(seed.wrapping_add(r as u64)))
            .collect();
        let pipeline = LogitProcessorPipeline::from_config(config, self.special.eos);
        self.decode(
            memory,
            config.best_of,
            max_length,
            &pipeline,
            config.ramble,
            Strategy::Sample(&mut rngs[..]),
        )
    }

    fn decode(
        &self,
        memory: &M::Memory,
        rows: usize,
        max_length: usize,
        pipeline: &LogitProcessorPipeline,
        ramble: bool,
        mut strategy: Strategy<'_>,
    ) -> Result<Vec<Candidate>> {
        let eos = self.special.eos;
        let mut buffers: Vec<SequenceBuffer> = (0..rows)
            .map(|_| SequenceBuffer::new(max_length, self.special))
            .collect();
        let mut logprobs = vec![0.0f32; rows];

        // The last position keeps its EOS fill.
        for t in 1..max_length - 1 {
            let refs: Vec<&SequenceBuffer> = buffers.iter().collect();
            let logits = step_logits(self.model.as_ref(), &self.backend, &refs, t, memory)?;

            let mut all_eos = true;
            for (r, (buffer, mut row)) in buffers.iter_mut().zip(logits).enumerate() {
                let prev = buffer.get(t - 1).unwrap_or(eos);
                pipeline.apply(&mut row, prev);
                let sample = match &mut strategy {
                    Strategy::Sample(rngs) => self.sampler.sample(&row, &mut rngs[r])?,
                    Strategy::Greedy => self.sampler.greedy(&row)?,
                };
                buffer.set(t, sample.token_id)?;
                logprobs[r] += sample.logprob;
                all_eos &= sample.token_id == eos;
            }
            trace!(step = t, rows, "decode step");

            if all_eos && !ramble {
                debug!(step = t, rows, "every row reached EOS");
                break;
            }
        }

        Ok(buffers
            .into_iter()
            .zip(logprobs)
            .map(|(buffer, logprob)| Candidate::from_buffer(buffer, logprob))
            .collect())
    }
}

/// Beam-search decoder over one image.
pub struct BeamSearchEngine<M, B> {
    model: Arc<M>,
    backend: B,
    special: SpecialTokens,
    sampler: CpuSampler,
}

struct Beam {
    buffer: SequenceBuffer,
    logprob: f32,
}

impl<M, B> BeamSearchEngine<M, B>
where
    B: Backend,
    M: CaptionModel<T = B::Tensor>,
{
    pub fn new(model: Arc<M>, backend: B, special: SpecialTokens) -> Self {
        Self {
            model,
            backend,
            special,
            sampler: CpuSampler,
        }
    }

    /// Keep the `beam_width` best partial hypotheses at each step, freeze
    /// those that emit EOS, and return up to `beam_width` results ordered by
    /// length-normalized score, best first.
    pub fn search(&self, features: &B::Tensor, config: &GenerationConfig) -> Result<Vec<Hypothesis>> {
        let max_length = config.validate(self.model.config().max_length)?;
        let memory = self.model.prepare_memory(features)?;
        let width = config.beam_width;
        let eos = self.special.eos;
        let pipeline = LogitProcessorPipeline::new(1.0, eos, config.ramble);

        let mut live = vec![Beam {
            buffer: SequenceBuffer::new(max_length, self.special),
            logprob: 0.0,
        }];
        let mut finished: Vec<Beam> = Vec::new();

        for t in 1..max_length - 1 {
            if live.is_empty() {
                break;
            }
            let refs: Vec<&SequenceBuffer> = live.iter().map(|b| &b.buffer).collect();
            let logits = step_logits(self.model.as_ref(), &self.backend, &refs, t, &memory)?;

            let mut expansions: Vec<(usize, SampleResult, f32)> = Vec::new();
            for (i, (beam, mut row)) in live.iter().zip(logits).enumerate() {
                let prev = beam.buffer.get(t - 1).unwrap_or(eos);
                pipeline.apply(&mut row, prev);
                for next in self.sampler.top_k(&row, width)? {
                    expansions.push((i, next, beam.logprob + next.logprob));
                }
            }
            expansions.sort_by(|a, b| b.2.total_cmp(&a.2));
            expansions.truncate(width);

            let mut next_live = Vec::with_capacity(width);
            for (i, next, logprob) in expansions {
                let mut buffer = live[i].buffer.clone();
                buffer.set(t, next.token_id)?;
                let beam = Beam { buffer, logprob };
                if next.token_id == eos {
                    finished.push(beam);
                } else {
                    next_live.push(beam);
                }
            }
            trace!(step = t, live = next_live.len(), finished = finished.len(), "beam step");
            live = next_live;
        }

        let mut hypotheses: Vec<Hypothesis> = finished
            .into_iter()
            .chain(live)
            .map(|beam| {
                let len = beam.buffer.scored_len().max(1) as f32;
                Hypothesis {
                    score: beam.logprob / len.powf(config.length_penalty),
                    logprob: beam.logprob,
                    generated_len: beam.buffer.generated_len(),
                    finish_reason: beam.buffer.finish_reason(),
                    tokens: beam.buffer.into_tokens(),
                }
            })
            .collect();
        hypotheses.sort_by(|a, b| b.score.total_cmp(&a.score));
        hypotheses.truncate(width);
        debug!(width, returned = hypotheses.len(), "beam search finished");
        Ok(hypotheses)
    }
}

/// One drawn token and its log-probability under the distribution it was
/// drawn from (after temperature and masking).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleResult {
    pub token_id: u32,
    pub logprob: f32,
}

use super::BatchInputs;
use candle_core::Tensor;

/// Raw result of a single forward pass. Padding positions are zero.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, seq, vocab)`, `None` for models without a language-modeling head
    pub logits: Option<Tensor>,
    /// `(batch, seq, hidden)`
    pub last_hidden_state: Tensor,
}

/// The pretrained model behind an adapter.
pub trait ConditionalGeneration {
    /// Puts the model in inference state, dropping anything cached by a previous call.
    fn eval(&mut self);

    fn forward(&mut self, inputs: &BatchInputs) -> anyhow::Result<ModelOutput>;

    /// Returns, per batch row, the input row (padding included) followed by
    /// at most `max_new_tokens` generated ids. Models that cannot generate
    /// return an error.
    fn generate(
        &mut self,
        inputs: &BatchInputs,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>>;
}

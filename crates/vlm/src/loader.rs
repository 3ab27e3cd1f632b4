use crate::{ConditionalGeneration, Processor, QuantizationMode};
use tokenizers::Tokenizer;

/// Everything loaded for one checkpoint, owned by a single adapter.
pub struct ModelBundle<M, P> {
    pub model: M,
    /// Set when the tokenizer is loaded on its own; the processor carries its own copy.
    pub tokenizer: Option<Tokenizer>,
    pub processor: P,
}

/// Loads a model family's artifacts in its fixed order.
pub trait PretrainedLoader {
    type Model: ConditionalGeneration;
    type Processor: Processor;

    fn load(
        &self,
        mode: QuantizationMode,
    ) -> anyhow::Result<ModelBundle<Self::Model, Self::Processor>>;
}

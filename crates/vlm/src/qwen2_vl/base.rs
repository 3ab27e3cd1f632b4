use super::{model::Qwen2VLModel, Qwen2VLLoader, Qwen2VLProcessor};
use crate::{
    Accelerator, ConditionalGeneration, ModelAdapter, ModelBundle, ModelOutput, PretrainedLoader,
    Processor, QuantizationMode,
};
use anyhow::bail;
use candle_core::Device;
use image::DynamicImage;
use tokenizers::Tokenizer;

/// The headless Qwen2-VL model behind [`ModelAdapter`]. `process` yields
/// hidden states only, and generation is unsupported.
pub struct Qwen2VLBase<M = Qwen2VLModel, P = Qwen2VLProcessor, A = Device> {
    model: M,
    tokenizer: Option<Tokenizer>,
    processor: P,
    accelerator: A,
}

impl Qwen2VLBase {
    pub fn new(mode: QuantizationMode) -> anyhow::Result<Self> {
        Self::with_loader(&Qwen2VLLoader::from_env()?, mode)
    }

    pub fn with_loader(
        loader: &Qwen2VLLoader<Qwen2VLModel>,
        mode: QuantizationMode,
    ) -> anyhow::Result<Self> {
        let bundle = loader.load(mode)?;
        let device = bundle.model.device().clone();
        Ok(Self::from_bundle(bundle, device))
    }
}

impl<M, P, A> Qwen2VLBase<M, P, A>
where
    M: ConditionalGeneration,
    P: Processor,
    A: Accelerator,
{
    pub fn from_bundle(bundle: ModelBundle<M, P>, accelerator: A) -> Self {
        Self {
            model: bundle.model,
            tokenizer: bundle.tokenizer,
            processor: bundle.processor,
            accelerator,
        }
    }

    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M, P, A> ModelAdapter for Qwen2VLBase<M, P, A>
where
    M: ConditionalGeneration,
    P: Processor,
    A: Accelerator,
{
    type Processor = P;

    #[tracing::instrument(name = "Qwen2VLBase::process", err(Debug), skip_all, fields(batch_size = texts.len()))]
    fn process(&mut self, texts: &[String], images: &[DynamicImage]) -> anyhow::Result<ModelOutput> {
        let inputs = self.processor.encode(texts, images, &[])?;
        let inputs = self.accelerator.move_batch(inputs)?;
        self.model.forward(&inputs)
    }

    fn generate(&mut self, _texts: &[String], _images: &[DynamicImage]) -> anyhow::Result<Vec<String>> {
        bail!("Qwen2VLBase has no language-modeling head, use Qwen2VL to generate")
    }

    fn get_processor(&self) -> &P {
        &self.processor
    }
}

mod base;
mod loader;
pub mod model;
pub mod processor;
mod vision_info;

pub use base::Qwen2VLBase;
pub use loader::Qwen2VLLoader;
pub use model::{GenerationConfig, Qwen2VLForConditionalGeneration, Qwen2VLModel};
pub use processor::Qwen2VLProcessor;
pub use vision_info::process_vision_info;

use crate::{
    Accelerator, BatchInputs, ConditionalGeneration, ContentBlock, Conversation, DecodeOptions,
    ImageQueryModel, ImageSource, Message, ModelAdapter, ModelBundle, ModelOutput,
    PretrainedLoader, Processor, QuantizationMode, Query,
};
use anyhow::bail;
use candle_core::Device;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::debug;

pub const MODEL_ID: &str = "Qwen/Qwen2-VL-2B-Instruct";
pub const MODEL_NAME: &str = "qwen2";

pub const INSTRUCTION: &str = "Answer briefly.";
pub const RESIZED_WIDTH: u32 = 420;
pub const RESIZED_HEIGHT: u32 = 280;

pub const GENERATE_MAX_NEW_TOKENS: usize = 64;
pub const PIPELINE_MAX_NEW_TOKENS: usize = 128;

const DECODE_OPTIONS: DecodeOptions = DecodeOptions {
    skip_special_tokens: true,
    clean_up_tokenization_spaces: false,
};

/// Qwen2-VL behind [`ModelAdapter`] and [`ImageQueryModel`].
pub struct Qwen2VL<M = Qwen2VLForConditionalGeneration, P = Qwen2VLProcessor, A = Device> {
    model: M,
    tokenizer: Option<Tokenizer>,
    processor: P,
    accelerator: A,
}

impl Qwen2VL {
    /// Loads `Qwen/Qwen2-VL-2B-Instruct` with settings from the environment.
    pub fn new(mode: QuantizationMode) -> anyhow::Result<Self> {
        Self::with_loader(&Qwen2VLLoader::from_env()?, mode)
    }

    pub fn with_loader(loader: &Qwen2VLLoader, mode: QuantizationMode) -> anyhow::Result<Self> {
        let bundle = loader.load(mode)?;
        let device = bundle.model.device().clone();
        Ok(Self::from_bundle(bundle, device))
    }
}

impl<M, P, A> Qwen2VL<M, P, A>
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

    fn encode(
        &self,
        texts: &[String],
        images: &[DynamicImage],
        videos: &[Vec<DynamicImage>],
    ) -> anyhow::Result<BatchInputs> {
        let inputs = self.processor.encode(texts, images, videos)?;
        self.accelerator.move_batch(inputs)
    }

    /// Generates, strips each row's prompt and decodes.
    fn generate_trimmed(
        &mut self,
        inputs: &BatchInputs,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<String>> {
        let input_rows = inputs.input_rows()?;
        let outputs = self.model.generate(inputs, max_new_tokens)?;
        if outputs.len() != input_rows.len() {
            bail!(
                "model returned {} rows for a batch of {}",
                outputs.len(),
                input_rows.len()
            );
        }
        let trimmed: Vec<&[u32]> = input_rows
            .iter()
            .zip(&outputs)
            .map(|(input, output)| &output[input.len().min(output.len())..])
            .collect();
        debug!(
            "new tokens per row: {:?}",
            trimmed.iter().map(|t| t.len()).collect::<Vec<_>>()
        );
        self.processor.batch_decode(&trimmed, DECODE_OPTIONS)
    }

    /// Renders, encodes and answers one conversation per batch item.
    #[tracing::instrument(name = "Qwen2VL::process_generate", err(Debug), skip_all, fields(batch_size = conversations.len()))]
    pub fn process_generate(&mut self, conversations: &[Conversation]) -> anyhow::Result<Vec<String>> {
        self.model.eval();
        self.accelerator.empty_cache();

        let texts = conversations
            .iter()
            .map(|conversation| self.processor.apply_chat_template(conversation, true))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let (images, videos) = process_vision_info(conversations)?;
        let inputs = self.encode(&texts, &images, &videos)?;
        self.generate_trimmed(&inputs, PIPELINE_MAX_NEW_TOKENS)
    }
}

/// One single-message conversation per image/query pair: the instruction,
/// the first frame resized to 420x280, then the English query.
pub fn image_query_conversations(
    images: &[Vec<ImageSource>],
    queries: &[Query],
) -> anyhow::Result<Vec<Conversation>> {
    if images.len() != queries.len() {
        bail!(
            "got {} image batches but {} queries",
            images.len(),
            queries.len()
        );
    }
    images
        .iter()
        .zip(queries)
        .enumerate()
        .map(|(idx, (frames, query))| -> anyhow::Result<Conversation> {
            let Some(image) = frames.first() else {
                bail!("no frame given for batch item {}", idx);
            };
            Ok(vec![Message::user(vec![
                ContentBlock::text(INSTRUCTION),
                ContentBlock::resized_image(image.clone(), RESIZED_WIDTH, RESIZED_HEIGHT),
                ContentBlock::text(query.english()?),
            ])])
        })
        .collect()
}

impl<M, P, A> ModelAdapter for Qwen2VL<M, P, A>
where
    M: ConditionalGeneration,
    P: Processor,
    A: Accelerator,
{
    type Processor = P;

    #[tracing::instrument(name = "Qwen2VL::process", err(Debug), skip_all, fields(batch_size = texts.len()))]
    fn process(&mut self, texts: &[String], images: &[DynamicImage]) -> anyhow::Result<ModelOutput> {
        let inputs = self.encode(texts, images, &[])?;
        self.model.forward(&inputs)
    }

    #[tracing::instrument(name = "Qwen2VL::generate", err(Debug), skip_all, fields(batch_size = texts.len()))]
    fn generate(&mut self, texts: &[String], images: &[DynamicImage]) -> anyhow::Result<Vec<String>> {
        let inputs = self.encode(texts, images, &[])?;
        self.generate_trimmed(&inputs, GENERATE_MAX_NEW_TOKENS)
    }

    fn get_processor(&self) -> &P {
        &self.processor
    }
}

impl<M, P, A> ImageQueryModel for Qwen2VL<M, P, A>
where
    M: ConditionalGeneration,
    P: Processor,
    A: Accelerator,
{
    fn get_model_name(&self) -> &str {
        MODEL_NAME
    }

    fn process_image_queries(
        &mut self,
        images: &[Vec<ImageSource>],
        queries: &[Query],
    ) -> anyhow::Result<Vec<String>> {
        let conversations = image_query_conversations(images, queries)?;
        self.process_generate(&conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_message_per_pair_in_block_order() {
        let images = vec![vec!["a.jpg".into(), "b.jpg".into()], vec!["c.jpg".into()]];
        let queries = vec![
            Query::en("What color is the car?").with("zh", "车是什么颜色的？"),
            Query::en("How many people?"),
        ];
        let conversations = image_query_conversations(&images, &queries).unwrap();
        assert_eq!(conversations.len(), 2);

        let value = serde_json::to_value(&conversations[0]).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Answer briefly."},
                    {"type": "image", "image": "a.jpg", "resized_height": 280, "resized_width": 420},
                    {"type": "text", "text": "What color is the car?"},
                ]
            }])
        );
    }

    #[test]
    fn mismatched_or_empty_inputs_fail() {
        let queries = vec![Query::en("q")];
        assert!(image_query_conversations(&[], &queries).is_err());
        assert!(image_query_conversations(&[vec![]], &queries).is_err());
        assert!(image_query_conversations(&[vec!["a.jpg".into()]], &[Query::new().with("zh", "q")]).is_err());
    }
}

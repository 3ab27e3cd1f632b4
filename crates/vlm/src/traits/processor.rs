use super::BatchInputs;
use crate::Message;
use image::DynamicImage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    pub skip_special_tokens: bool,
    pub clean_up_tokenization_spaces: bool,
}

/// Text and image preprocessing paired with one checkpoint.
pub trait Processor {
    /// Renders one conversation into the prompt format the model was trained on.
    /// Nothing is tokenized here.
    fn apply_chat_template(
        &self,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String>;

    /// Tokenizes and pads `texts`, turning `images` and `videos` into patch
    /// tensors. Media are matched to the placeholders in the texts in order.
    fn encode(
        &self,
        texts: &[String],
        images: &[DynamicImage],
        videos: &[Vec<DynamicImage>],
    ) -> anyhow::Result<BatchInputs>;

    fn batch_decode(
        &self,
        sequences: &[&[u32]],
        options: DecodeOptions,
    ) -> anyhow::Result<Vec<String>>;
}

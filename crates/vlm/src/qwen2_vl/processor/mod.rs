mod chat_template;
mod image_processor;

pub use chat_template::{ChatTemplate, QWEN2_VL_CHAT_TEMPLATE};
pub use image_processor::{smart_resize, ImageProcessor, IMAGE_FACTOR, MAX_RATIO};

use crate::{BatchInputs, DecodeOptions, GridThw, Message, Processor};
use anyhow::{anyhow, bail};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use serde::Deserialize;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::debug;

pub const IMAGE_TOKEN: &str = "<|image_pad|>";
pub const VIDEO_TOKEN: &str = "<|video_pad|>";
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    #[default]
    Left,
    Right,
}

/// `pad_token` is either the bare token or an added-token object.
#[derive(Deserialize)]
#[serde(untagged)]
enum PadToken {
    Text(String),
    Added { content: String },
}

impl PadToken {
    fn content(&self) -> &str {
        match self {
            PadToken::Text(content) | PadToken::Added { content } => content,
        }
    }
}

#[derive(Deserialize, Default)]
struct TokenizerConfig {
    #[serde(default)]
    padding_side: Option<PaddingSide>,
    #[serde(default)]
    pad_token: Option<PadToken>,
}

/// Chat template, image processor and tokenizer of one Qwen2-VL checkpoint.
#[derive(Clone)]
pub struct Qwen2VLProcessor {
    tokenizer: Tokenizer,
    image_processor: ImageProcessor,
    chat_template: ChatTemplate,
    pad_token_id: u32,
    padding_side: PaddingSide,
}

impl Qwen2VLProcessor {
    pub fn new(
        tokenizer: Tokenizer,
        image_processor: ImageProcessor,
        chat_template: ChatTemplate,
        pad_token: &str,
        padding_side: PaddingSide,
    ) -> anyhow::Result<Self> {
        let pad_token_id = tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| anyhow!("pad token {} is not in the vocabulary", pad_token))?;
        Ok(Self {
            tokenizer,
            image_processor,
            chat_template,
            pad_token_id,
            padding_side,
        })
    }

    /// Reads padding settings from `tokenizer_config.json` and the chat template
    /// from `chat_template.json` or, failing that, `tokenizer_config.json`.
    pub fn from_files(
        tokenizer: Tokenizer,
        preprocessor_config: &Path,
        tokenizer_config: Option<&Path>,
        chat_template: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let image_processor = ImageProcessor::from_file(preprocessor_config)?;
        let config: TokenizerConfig = match tokenizer_config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => TokenizerConfig::default(),
        };
        let chat_template = ChatTemplate::from_files(chat_template, tokenizer_config)?;
        Self::new(
            tokenizer,
            image_processor,
            chat_template,
            config.pad_token.as_ref().map_or(DEFAULT_PAD_TOKEN, PadToken::content),
            config.padding_side.unwrap_or_default(),
        )
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn image_processor(&self) -> &ImageProcessor {
        &self.image_processor
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn preprocess_all<'a>(
        &self,
        media: impl Iterator<Item = &'a [DynamicImage]>,
    ) -> anyhow::Result<(Option<Tensor>, Vec<GridThw>)> {
        let mut patches = vec![];
        let mut grids = vec![];
        for frames in media {
            let (p, grid) = self.image_processor.preprocess(frames)?;
            patches.push(p);
            grids.push(grid);
        }
        if patches.is_empty() {
            return Ok((None, grids));
        }
        Ok((Some(Tensor::cat(&patches, 0)?), grids))
    }
}

/// Repeats each media placeholder once per merged token of its grid.
/// Grids are consumed in order across all texts.
fn expand_placeholders<'a>(
    text: &str,
    image_grids: &mut impl Iterator<Item = &'a GridThw>,
    video_grids: &mut impl Iterator<Item = &'a GridThw>,
    merge_size: usize,
) -> anyhow::Result<String> {
    let mut expanded = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let next_image = rest.find(IMAGE_TOKEN);
        let next_video = rest.find(VIDEO_TOKEN);
        let (at, token, grid) = match (next_image, next_video) {
            (None, None) => break,
            (Some(i), Some(v)) if v < i => (v, VIDEO_TOKEN, video_grids.next()),
            (Some(i), _) => (i, IMAGE_TOKEN, image_grids.next()),
            (None, Some(v)) => (v, VIDEO_TOKEN, video_grids.next()),
        };
        let Some(grid) = grid else {
            bail!("more {} placeholders than media", token);
        };
        expanded.push_str(&rest[..at]);
        expanded.push_str(&token.repeat(grid.num_merged_tokens(merge_size)));
        rest = &rest[at + token.len()..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

fn clean_up_tokenization(text: &str) -> String {
    text.replace(" .", ".")
        .replace(" ?", "?")
        .replace(" !", "!")
        .replace(" ,", ",")
        .replace(" ' ", "'")
        .replace(" n't", "n't")
        .replace(" 'm", "'m")
        .replace(" 's", "'s")
        .replace(" 've", "'ve")
        .replace(" 're", "'re")
}

impl Processor for Qwen2VLProcessor {
    fn apply_chat_template(
        &self,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String> {
        self.chat_template.render(conversation, add_generation_prompt)
    }

    fn encode(
        &self,
        texts: &[String],
        images: &[DynamicImage],
        videos: &[Vec<DynamicImage>],
    ) -> anyhow::Result<BatchInputs> {
        if texts.is_empty() {
            bail!("cannot encode an empty batch");
        }

        let (pixel_values, image_grid_thw) =
            self.preprocess_all(images.iter().map(std::slice::from_ref))?;
        let (pixel_values_videos, video_grid_thw) =
            self.preprocess_all(videos.iter().map(|v| v.as_slice()))?;

        let merge_size = self.image_processor.merge_size;
        let mut image_grids = image_grid_thw.iter();
        let mut video_grids = video_grid_thw.iter();
        let expanded = texts
            .iter()
            .map(|text| expand_placeholders(text, &mut image_grids, &mut video_grids, merge_size))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if image_grids.next().is_some() || video_grids.next().is_some() {
            bail!(
                "{} images and {} videos given, but the texts hold fewer placeholders",
                images.len(),
                videos.len()
            );
        }

        let encodings = self
            .tokenizer
            .encode_batch(expanded, true)
            .map_err(|e| anyhow!(e))?;
        let max_len = encodings.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut input_ids: Vec<u32> = Vec::with_capacity(texts.len() * max_len);
        let mut attention_mask: Vec<u32> = Vec::with_capacity(texts.len() * max_len);
        for encoding in &encodings {
            let ids = encoding.get_ids();
            let pad = max_len - ids.len();
            let (pad_ids, pad_mask) = (vec![self.pad_token_id; pad], vec![0u32; pad]);
            let mask = vec![1u32; ids.len()];
            match self.padding_side {
                PaddingSide::Left => {
                    input_ids.extend(pad_ids.iter().chain(ids));
                    attention_mask.extend(pad_mask.iter().chain(&mask));
                }
                PaddingSide::Right => {
                    input_ids.extend(ids.iter().chain(&pad_ids));
                    attention_mask.extend(mask.iter().chain(&pad_mask));
                }
            }
        }
        debug!(
            "encoded {} texts, {} images, {} videos into {} tokens per row",
            texts.len(),
            images.len(),
            videos.len(),
            max_len
        );

        let shape = (texts.len(), max_len);
        Ok(BatchInputs {
            input_ids: Tensor::from_vec(input_ids, shape, &Device::Cpu)?,
            attention_mask: Tensor::from_vec(attention_mask, shape, &Device::Cpu)?,
            pixel_values,
            image_grid_thw,
            pixel_values_videos,
            video_grid_thw,
        })
    }

    fn batch_decode(
        &self,
        sequences: &[&[u32]],
        options: DecodeOptions,
    ) -> anyhow::Result<Vec<String>> {
        let texts = self
            .tokenizer
            .decode_batch(sequences, options.skip_special_tokens)
            .map_err(|e| anyhow!(e))?;
        Ok(if options.clean_up_tokenization_spaces {
            texts.iter().map(|t| clean_up_tokenization(t)).collect()
        } else {
            texts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace, AddedToken};

    fn test_tokenizer() -> Tokenizer {
        let words = [
            "<unk>", "<|endoftext|>", "<|image_pad|>", "<|video_pad|>", "<|vision_start|>",
            "<|vision_end|>", "describe", "this", "and", "that", ".", "hello",
        ];
        let vocab = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer.add_special_tokens(
            &words[1..6]
                .iter()
                .map(|w| AddedToken::from(w.to_string(), true))
                .collect::<Vec<_>>(),
        );
        tokenizer
    }

    fn processor(padding_side: PaddingSide) -> Qwen2VLProcessor {
        Qwen2VLProcessor::new(
            test_tokenizer(),
            ImageProcessor::default(),
            ChatTemplate::default(),
            "<|endoftext|>",
            padding_side,
        )
        .unwrap()
    }

    #[test]
    fn placeholders_expand_to_merged_token_count() {
        let grids = [GridThw::new(1, 4, 6), GridThw::new(1, 2, 2)];
        let mut images = grids.iter();
        let text = expand_placeholders(
            "a <|image_pad|> b <|image_pad|>",
            &mut images,
            &mut [].iter(),
            2,
        )
        .unwrap();
        assert_eq!(text.matches(IMAGE_TOKEN).count(), 6 + 1);
        assert!(text.starts_with("a <|image_pad|><|image_pad|>"));
        assert!(images.next().is_none());
    }

    #[test]
    fn more_placeholders_than_media_fail() {
        assert!(expand_placeholders("<|video_pad|>", &mut [].iter(), &mut [].iter(), 2).is_err());
    }

    #[test]
    fn encode_pads_on_the_left_by_default() {
        let processor = processor(PaddingSide::Left);
        let inputs = processor
            .encode(&["hello".to_string(), "describe this and that".to_string()], &[], &[])
            .unwrap();
        assert_eq!(inputs.input_rows().unwrap(), vec![vec![1, 1, 1, 11], vec![6, 7, 8, 9]]);
        assert_eq!(inputs.mask_rows().unwrap(), vec![vec![0, 0, 0, 1], vec![1, 1, 1, 1]]);
        assert!(inputs.pixel_values.is_none());
    }

    #[test]
    fn encode_pads_on_the_right_when_configured() {
        let processor = processor(PaddingSide::Right);
        let inputs = processor
            .encode(&["hello".to_string(), "this that".to_string()], &[], &[])
            .unwrap();
        assert_eq!(inputs.input_rows().unwrap(), vec![vec![11, 1], vec![7, 9]]);
        assert_eq!(inputs.mask_rows().unwrap(), vec![vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn encode_images_in_prompt_order() {
        let processor = processor(PaddingSide::Left);
        let texts = vec![
            "<|vision_start|><|image_pad|><|vision_end|> describe".to_string(),
            "<|vision_start|><|image_pad|><|vision_end|> that".to_string(),
        ];
        let images = vec![DynamicImage::new_rgb8(56, 56), DynamicImage::new_rgb8(112, 56)];
        let inputs = processor.encode(&texts, &images, &[]).unwrap();

        assert_eq!(inputs.image_grid_thw, vec![GridThw::new(1, 4, 4), GridThw::new(1, 4, 8)]);
        assert_eq!(inputs.pixel_values.as_ref().unwrap().dims(), &[16 + 32, 1176]);
        let rows = inputs.input_rows().unwrap();
        assert_eq!(rows[0].iter().filter(|&&id| id == 2).count(), 4);
        assert_eq!(rows[1].iter().filter(|&&id| id == 2).count(), 8);
    }

    #[test]
    fn unused_media_fail() {
        let processor = processor(PaddingSide::Left);
        let result = processor.encode(&["hello".to_string()], &[DynamicImage::new_rgb8(56, 56)], &[]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_batch_fails() {
        assert!(processor(PaddingSide::Left).encode(&[], &[], &[]).is_err());
    }

    #[test]
    fn decode_skips_special_tokens() {
        let processor = processor(PaddingSide::Left);
        let decoded = processor
            .batch_decode(
                &[&[6, 7, 10, 1], &[1, 11]],
                DecodeOptions {
                    skip_special_tokens: true,
                    clean_up_tokenization_spaces: true,
                },
            )
            .unwrap();
        assert_eq!(decoded, vec!["describe this.".to_string(), "hello".to_string()]);
    }

    #[test]
    fn loads_padding_from_tokenizer_config() {
        let dir = tempfile::tempdir().unwrap();
        let preprocessor = dir.path().join("preprocessor_config.json");
        let tokenizer_config = dir.path().join("tokenizer_config.json");
        std::fs::write(&preprocessor, r#"{"min_pixels": 3136, "max_pixels": 12845056, "patch_size": 14}"#).unwrap();
        std::fs::write(&tokenizer_config, r#"{"padding_side": "right", "pad_token": "<|endoftext|>"}"#).unwrap();

        let processor =
            Qwen2VLProcessor::from_files(test_tokenizer(), &preprocessor, Some(&tokenizer_config), None)
                .unwrap();
        assert_eq!(processor.padding_side, PaddingSide::Right);
        assert_eq!(processor.pad_token_id(), 1);
        assert_eq!(processor.chat_template.source(), QWEN2_VL_CHAT_TEMPLATE);
    }

    #[test_log::test]
    fn pad_token_may_be_an_added_token_object() {
        let dir = tempfile::tempdir().unwrap();
        let preprocessor = dir.path().join("preprocessor_config.json");
        let tokenizer_config = dir.path().join("tokenizer_config.json");
        std::fs::write(&preprocessor, r#"{"min_pixels": 3136, "max_pixels": 12845056, "patch_size": 14}"#).unwrap();
        std::fs::write(
            &tokenizer_config,
            r#"{"pad_token": {"content": "<|vision_end|>", "lstrip": false, "normalized": false, "rstrip": false, "single_word": false, "special": true}}"#,
        )
        .unwrap();

        let processor =
            Qwen2VLProcessor::from_files(test_tokenizer(), &preprocessor, Some(&tokenizer_config), None)
                .unwrap();
        assert_eq!(processor.pad_token_id(), 5);
        assert_eq!(processor.padding_side, PaddingSide::Left);
    }

    #[test_log::test]
    fn missing_pad_token_falls_back_to_endoftext() {
        let config: TokenizerConfig = serde_json::from_str(r#"{"model_max_length": 32768}"#).unwrap();
        assert!(config.pad_token.is_none());
        let config: TokenizerConfig = serde_json::from_str(r#"{"pad_token": "<|endoftext|>"}"#).unwrap();
        assert_eq!(config.pad_token.unwrap().content(), DEFAULT_PAD_TOKEN);
    }
}

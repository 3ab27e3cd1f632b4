mod config;
mod linear;
mod rope;
mod text;
mod vision;

pub use config::{Config, GenerationConfig, RopeScaling, VisionConfig};
pub use linear::QLinear;
pub use rope::{get_rope_index, RopeIndex};

use crate::{BatchInputs, ConditionalGeneration, GridThw, ModelOutput, QuantizationConfig};
use anyhow::bail;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use text::TextModel;
use tracing::debug;
use vision::VisionTransformer;

/// Models that can be built from the weights of a Qwen2-VL checkpoint.
pub trait FromCheckpoint: ConditionalGeneration + Sized {
    fn from_checkpoint(
        config: Config,
        generation_config: GenerationConfig,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> anyhow::Result<Self>;

    fn device(&self) -> &Device;
}

/// Vision tower features of one batch, handed out to rows in prompt order.
struct VisionFeatures<'g> {
    features: Option<Tensor>,
    offset: usize,
    grids: std::slice::Iter<'g, GridThw>,
}

impl<'g> VisionFeatures<'g> {
    fn take(&mut self, count: usize) -> anyhow::Result<Option<Tensor>> {
        if count == 0 {
            return Ok(None);
        }
        let Some(features) = &self.features else {
            bail!("prompt holds {} vision tokens but no pixel values were given", count);
        };
        if self.offset + count > features.dim(0)? {
            bail!(
                "prompt holds more vision tokens than the {} encoded",
                features.dim(0)?
            );
        }
        let slice = features.narrow(0, self.offset, count)?;
        self.offset += count;
        Ok(Some(slice))
    }
}

/// Vision tower and decoder, without a language-modeling head.
pub struct Qwen2VLModel {
    visual: VisionTransformer,
    text: TextModel,
    config: Config,
}

impl Qwen2VLModel {
    /// Reads `visual.*` and `model.*`; decoder projections are block-quantized
    /// when `quantization` is set.
    pub fn new(
        config: Config,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        let visual = VisionTransformer::new(&config.vision_config, vb.pp("visual"))?;
        let text = TextModel::new(&config, quantization, vb)?;
        Ok(Self {
            visual,
            text,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.text.device()
    }

    fn vision_features<'g>(
        &self,
        inputs: &'g BatchInputs,
    ) -> anyhow::Result<(VisionFeatures<'g>, VisionFeatures<'g>)> {
        let images = match &inputs.pixel_values {
            Some(pixels) => Some(self.visual.forward(pixels, &inputs.image_grid_thw)?),
            None => None,
        };
        let videos = match &inputs.pixel_values_videos {
            Some(pixels) => Some(self.visual.forward(pixels, &inputs.video_grid_thw)?),
            None => None,
        };
        Ok((
            VisionFeatures {
                features: images,
                offset: 0,
                grids: inputs.image_grid_thw.iter(),
            },
            VisionFeatures {
                features: videos,
                offset: 0,
                grids: inputs.video_grid_thw.iter(),
            },
        ))
    }

    /// Embeds one unpadded row, swapping vision placeholders for their
    /// features, and runs it through the decoder on an empty cache.
    fn prefill<'g>(
        &mut self,
        ids: &[u32],
        images: &mut VisionFeatures<'g>,
        videos: &mut VisionFeatures<'g>,
    ) -> anyhow::Result<(Tensor, RopeIndex)> {
        let index = get_rope_index(ids, &self.config, &mut images.grids, &mut videos.grids)?;

        let device = self.text.device().clone();
        let embeds = self.text.embed(&Tensor::new(ids, &device)?)?;
        let image_count = ids.iter().filter(|&&id| id == self.config.image_token_id).count();
        let video_count = ids.iter().filter(|&&id| id == self.config.video_token_id).count();
        let image_feats = images.take(image_count)?;
        let video_feats = videos.take(video_count)?;

        let embeds = if image_feats.is_none() && video_feats.is_none() {
            embeds
        } else {
            let mut gather = Vec::with_capacity(ids.len());
            let (mut next_image, mut next_video) = (ids.len(), ids.len() + image_count);
            for (pos, &id) in ids.iter().enumerate() {
                if id == self.config.image_token_id {
                    gather.push(next_image as u32);
                    next_image += 1;
                } else if id == self.config.video_token_id {
                    gather.push(next_video as u32);
                    next_video += 1;
                } else {
                    gather.push(pos as u32);
                }
            }
            let mut pool = vec![embeds];
            pool.extend(image_feats);
            pool.extend(video_feats);
            let pool = Tensor::cat(&pool, 0)?;
            pool.index_select(&Tensor::new(gather, &device)?, 0)?
        };

        self.text.clear_kv_cache();
        let hidden = self.text.forward_embeds(&embeds.unsqueeze(0)?, &index.positions)?;
        Ok((hidden, index))
    }

    /// Feeds one generated token after the cached prompt.
    fn step(&mut self, token: u32, index: &RopeIndex) -> anyhow::Result<Tensor> {
        let position = index.position_after(self.text.cache_len());
        let positions = [vec![position], vec![position], vec![position]];
        let embeds = self.text.embed(&Tensor::new(&[token], self.text.device())?)?;
        Ok(self.text.forward_embeds(&embeds.unsqueeze(0)?, &positions)?)
    }

    /// Hidden states `(1, len, hidden)` of every row run without its padding,
    /// each with the padded-position slots of its tokens.
    fn forward_rows(
        &mut self,
        inputs: &BatchInputs,
    ) -> anyhow::Result<Vec<(Tensor, Vec<Option<usize>>)>> {
        let (mut images, mut videos) = self.vision_features(inputs)?;
        let mut rows = vec![];
        for (row, mask) in inputs.input_rows()?.iter().zip(inputs.mask_rows()?) {
            let (ids, slots) = unpadded(row, &mask);
            if ids.is_empty() {
                bail!("batch row holds only padding");
            }
            let (hidden, _) = self.prefill(&ids, &mut images, &mut videos)?;
            rows.push((hidden, slots));
        }
        self.text.clear_kv_cache();
        Ok(rows)
    }
}

impl ConditionalGeneration for Qwen2VLModel {
    fn eval(&mut self) {
        self.text.clear_kv_cache();
    }

    fn forward(&mut self, inputs: &BatchInputs) -> anyhow::Result<ModelOutput> {
        let hidden_states = self
            .forward_rows(inputs)?
            .iter()
            .map(|(hidden, slots)| scatter_padded(hidden, slots))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(ModelOutput {
            logits: None,
            last_hidden_state: Tensor::stack(&hidden_states, 0)?,
        })
    }

    fn generate(
        &mut self,
        _inputs: &BatchInputs,
        _max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        bail!("Qwen2VLModel has no language-modeling head, load Qwen2VLForConditionalGeneration to generate")
    }
}

impl FromCheckpoint for Qwen2VLModel {
    fn from_checkpoint(
        config: Config,
        _generation_config: GenerationConfig,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        Self::new(config, quantization, vb)
    }

    fn device(&self) -> &Device {
        self.text.device()
    }
}

/// [`Qwen2VLModel`] with the language-modeling head on top.
pub struct Qwen2VLForConditionalGeneration {
    model: Qwen2VLModel,
    lm_head: Linear,
    generation_config: GenerationConfig,
}

impl Qwen2VLForConditionalGeneration {
    /// The vision tower and the LM head stay in `vb`'s dtype when quantizing.
    pub fn new(
        config: Config,
        generation_config: GenerationConfig,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        let (tied, hidden_size, vocab_size) =
            (config.tie_word_embeddings, config.hidden_size, config.vocab_size);
        let model = Qwen2VLModel::new(config, quantization, vb.clone())?;
        let lm_head = if tied {
            Linear::new(model.text.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(hidden_size, vocab_size, vb.pp("lm_head"))?
        };
        Ok(Self {
            model,
            lm_head,
            generation_config,
        })
    }

    pub fn config(&self) -> &Config {
        self.model.config()
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    fn logits_processor(&self) -> LogitsProcessor {
        let config = &self.generation_config;
        let temperature = if config.do_sample {
            config.temperature.unwrap_or(1.0)
        } else {
            0.
        };
        let sampling = if temperature <= 0. {
            Sampling::ArgMax
        } else {
            match (config.top_k, config.top_p) {
                (None, None) => Sampling::All { temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            }
        };
        LogitsProcessor::from_sampling(config.seed.unwrap_or(rand::random()), sampling)
    }

    /// `context` is the prompt followed by everything generated so far.
    fn sample(
        &self,
        logits_processor: &mut LogitsProcessor,
        hidden: &Tensor,
        context: &[u32],
    ) -> anyhow::Result<u32> {
        let last = hidden.dim(1)? - 1;
        let logits = self
            .lm_head
            .forward(&hidden.narrow(1, last, 1)?)?
            .squeeze(0)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        let logits = apply_repeat_penalty(logits, &self.generation_config, context)?;
        Ok(logits_processor.sample(&logits)?)
    }
}

fn apply_repeat_penalty(
    logits: Tensor,
    config: &GenerationConfig,
    context: &[u32],
) -> candle_core::Result<Tensor> {
    if config.repetition_penalty == 1. {
        return Ok(logits);
    }
    let start_at = config
        .repeat_last_n
        .map(|n| context.len().saturating_sub(n))
        .unwrap_or(0);
    candle_transformers::utils::apply_repeat_penalty(
        &logits,
        config.repetition_penalty,
        &context[start_at..],
    )
}

fn unpadded(row: &[u32], mask: &[u32]) -> (Vec<u32>, Vec<Option<usize>>) {
    let mut ids = Vec::with_capacity(row.len());
    let mut slots = Vec::with_capacity(row.len());
    for (&id, &m) in row.iter().zip(mask) {
        if m == 0 {
            slots.push(None);
        } else {
            slots.push(Some(ids.len()));
            ids.push(id);
        }
    }
    (ids, slots)
}

/// Places `(1, seq, dim)` row values back into a padded `(len, dim)` layout,
/// zeros at padding.
fn scatter_padded(values: &Tensor, slots: &[Option<usize>]) -> candle_core::Result<Tensor> {
    let values = values.squeeze(0)?;
    let dim = values.dim(D::Minus1)?;
    let zeros = Tensor::zeros((1, dim), values.dtype(), values.device())?;
    let pool = Tensor::cat(&[&zeros, &values], 0)?;
    let index: Vec<u32> = slots
        .iter()
        .map(|slot| slot.map(|i| i as u32 + 1).unwrap_or(0))
        .collect();
    pool.index_select(&Tensor::new(index, values.device())?, 0)
}

impl ConditionalGeneration for Qwen2VLForConditionalGeneration {
    fn eval(&mut self) {
        self.model.eval();
    }

    fn forward(&mut self, inputs: &BatchInputs) -> anyhow::Result<ModelOutput> {
        let mut logits = vec![];
        let mut hidden_states = vec![];
        for (hidden, slots) in self.model.forward_rows(inputs)? {
            logits.push(scatter_padded(&self.lm_head.forward(&hidden)?, &slots)?);
            hidden_states.push(scatter_padded(&hidden, &slots)?);
        }
        Ok(ModelOutput {
            logits: Some(Tensor::stack(&logits, 0)?),
            last_hidden_state: Tensor::stack(&hidden_states, 0)?,
        })
    }

    fn generate(
        &mut self,
        inputs: &BatchInputs,
        max_new_tokens: usize,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let (mut images, mut videos) = self.model.vision_features(inputs)?;

        let mut outputs = vec![];
        for (row, mask) in inputs.input_rows()?.iter().zip(inputs.mask_rows()?) {
            let (ids, _) = unpadded(row, &mask);
            if ids.is_empty() {
                bail!("batch row holds only padding");
            }
            let mut output = row.clone();
            if max_new_tokens == 0 {
                outputs.push(output);
                continue;
            }

            let mut logits_processor = self.logits_processor();
            let (mut hidden, index) = self.model.prefill(&ids, &mut images, &mut videos)?;
            let prompt_len = ids.len();
            let mut context = ids;
            loop {
                let next_token = self.sample(&mut logits_processor, &hidden, &context)?;
                context.push(next_token);
                if self.generation_config.is_eos(next_token)
                    || context.len() - prompt_len >= max_new_tokens
                {
                    break;
                }
                hidden = self.model.step(next_token, &index)?;
            }
            debug!(
                "generated {} tokens for a {} token prompt",
                context.len() - prompt_len,
                prompt_len
            );
            output.extend_from_slice(&context[prompt_len..]);
            outputs.push(output);
        }
        self.model.text.clear_kv_cache();

        Ok(outputs)
    }
}

impl FromCheckpoint for Qwen2VLForConditionalGeneration {
    fn from_checkpoint(
        config: Config,
        generation_config: GenerationConfig,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        Self::new(config, generation_config, quantization, vb)
    }

    fn device(&self) -> &Device {
        self.model.device()
    }
}

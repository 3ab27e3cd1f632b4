use super::{
    model::{Config, FromCheckpoint, GenerationConfig, Qwen2VLForConditionalGeneration},
    processor::Qwen2VLProcessor,
    MODEL_ID,
};
use crate::{
    native_dtype, resolve_quantization, select_device, ModelBundle, PretrainedLoader,
    QuantizationMode, Settings,
};
use anyhow::{anyhow, Context};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use model_hub::{setup_cache_dir, HubRepo, HubRepoConfig};
use std::marker::PhantomData;
use tokenizers::Tokenizer;
use tracing::info;

/// Loads a Qwen2-VL checkpoint from the hub cache or a local directory, as
/// `M`: the full generation model or the headless [`super::model::Qwen2VLModel`].
pub struct Qwen2VLLoader<M = Qwen2VLForConditionalGeneration> {
    model_id: String,
    settings: Settings,
    model: PhantomData<fn() -> M>,
}

impl<M> Default for Qwen2VLLoader<M> {
    fn default() -> Self {
        Self::new(MODEL_ID, Settings::default())
    }
}

impl<M> Qwen2VLLoader<M> {
    pub fn new(model_id: impl Into<String>, settings: Settings) -> Self {
        Self {
            model_id: model_id.into(),
            settings,
            model: PhantomData,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(MODEL_ID, Settings::from_env()?))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Activation dtype. Quantized layers keep the compute dtype off the CPU;
/// the CPU always runs in f32.
fn load_dtype(device: &Device, compute_dtype: Option<DType>) -> DType {
    match (device, compute_dtype) {
        (Device::Cpu, _) => DType::F32,
        (_, Some(dtype)) => dtype,
        (_, None) => native_dtype(device),
    }
}

impl<M: FromCheckpoint> PretrainedLoader for Qwen2VLLoader<M> {
    type Model = M;
    type Processor = Qwen2VLProcessor;

    #[tracing::instrument(level = "info", name = "Qwen2VLLoader::load", err(Debug), skip(self), fields(model_id = %self.model_id))]
    fn load(
        &self,
        mode: QuantizationMode,
    ) -> anyhow::Result<ModelBundle<Self::Model, Self::Processor>> {
        let quantization = resolve_quantization(mode);

        let cache_dir = setup_cache_dir()?;
        let repo = HubRepo::new(HubRepoConfig {
            model_id: self.model_id.clone(),
            revision: self.settings.revision.clone(),
            cache_dir,
            token: self.settings.hf_token.clone(),
        })?;

        let tokenizer_path = repo.get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {}", tokenizer_path.display(), e))?;
        info!("tokenizer loaded");

        let config = Config::from_file(repo.get("config.json")?)?;
        let generation_config = match repo.get_optional("generation_config.json")? {
            Some(path) => GenerationConfig::from_file(path)?,
            None => GenerationConfig::default(),
        };
        info!("config loaded");

        let device = select_device(self.settings.device)?;
        let dtype = load_dtype(
            &device,
            quantization.as_ref().and_then(|q| q.compute_dtype),
        );
        let weights = repo.safetensors_files()?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device) }
            .with_context(|| format!("failed to map weights of {}", self.model_id))?;
        let model = match &quantization {
            Some(quantization) => {
                info!("quantizing decoder to {:?}", quantization.weight_dtype());
                M::from_checkpoint(config, generation_config, Some(quantization), vb)?
            }
            None => M::from_checkpoint(config, generation_config, None, vb)?,
        };
        info!("model loaded on {:?} as {:?}", device, dtype);

        let processor = Qwen2VLProcessor::from_files(
            tokenizer.clone(),
            &repo.get("preprocessor_config.json")?,
            repo.get_optional("tokenizer_config.json")?.as_deref(),
            repo.get_optional("chat_template.json")?.as_deref(),
        )?;
        info!("processor loaded");

        Ok(ModelBundle {
            model,
            tokenizer: Some(tokenizer),
            processor,
        })
    }
}

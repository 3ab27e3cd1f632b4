use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_vision_heads")]
    pub num_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_in_chans", alias = "in_channels")]
    pub in_chans: usize,
    /// Output width of the patch merger, the language model's hidden size.
    pub hidden_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    pub temporal_patch_size: usize,
    #[serde(default = "default_spatial_merge_size")]
    pub spatial_merge_size: usize,
}

fn default_depth() -> usize {
    32
}

fn default_embed_dim() -> usize {
    1280
}

fn default_vision_heads() -> usize {
    16
}

fn default_mlp_ratio() -> f64 {
    4.0
}

fn default_in_chans() -> usize {
    3
}

fn default_patch_size() -> usize {
    14
}

fn default_temporal_patch_size() -> usize {
    2
}

fn default_spatial_merge_size() -> usize {
    2
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden_size(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// `C * T * P * P`, the flattened width of one patch.
    pub fn patch_input_dim(&self) -> usize {
        self.in_chans * self.temporal_patch_size * self.patch_size * self.patch_size
    }

    pub fn merger_input_dim(&self) -> usize {
        self.embed_dim * self.spatial_merge_size * self.spatial_merge_size
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    pub mrope_section: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    pub rope_scaling: RopeScaling,
    pub vision_config: VisionConfig,
    #[serde(default = "default_image_token_id")]
    pub image_token_id: u32,
    #[serde(default = "default_video_token_id")]
    pub video_token_id: u32,
    #[serde(default = "default_vision_start_token_id")]
    pub vision_start_token_id: u32,
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_image_token_id() -> u32 {
    151655
}

fn default_video_token_id() -> u32 {
    151656
}

fn default_vision_start_token_id() -> u32 {
    151652
}

impl Config {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Decoding defaults shipped with the checkpoint in `generation_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, deserialize_with = "one_or_many")]
    pub eos_token_id: Vec<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// Penalize only the last `n` ids of prompt plus output; all of them when unset.
    #[serde(default)]
    pub repeat_last_n: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_repetition_penalty() -> f32 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            eos_token_id: vec![151645, 151643],
            pad_token_id: Some(151643),
            do_sample: false,
            temperature: None,
            top_k: None,
            top_p: None,
            repetition_penalty: default_repetition_penalty(),
            repeat_last_n: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_id.contains(&token)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
        None => vec![],
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "vocab_size": 64,
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "max_position_embeddings": 512,
            "tie_word_embeddings": true,
            "rope_scaling": { "type": "mrope", "mrope_section": [2, 3, 3] },
            "image_token_id": 60,
            "video_token_id": 61,
            "vision_start_token_id": 58,
            "vision_config": {
                "depth": 1,
                "embed_dim": 16,
                "num_heads": 2,
                "mlp_ratio": 2,
                "in_chans": 3,
                "hidden_size": 32,
                "patch_size": 2,
                "temporal_patch_size": 2,
                "spatial_merge_size": 2
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_checkpoint_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "architectures": ["Qwen2VLForConditionalGeneration"],
                "bos_token_id": 151643,
                "eos_token_id": 151645,
                "vision_start_token_id": 151652,
                "vision_end_token_id": 151653,
                "vision_token_id": 151654,
                "image_token_id": 151655,
                "video_token_id": 151656,
                "hidden_act": "silu",
                "hidden_size": 1536,
                "intermediate_size": 8960,
                "max_position_embeddings": 32768,
                "model_type": "qwen2_vl",
                "num_attention_heads": 12,
                "num_hidden_layers": 28,
                "num_key_value_heads": 2,
                "rms_norm_eps": 1e-06,
                "rope_theta": 1000000.0,
                "tie_word_embeddings": true,
                "torch_dtype": "bfloat16",
                "vision_config": {
                    "depth": 32, "embed_dim": 1280, "mlp_ratio": 4, "num_heads": 16,
                    "in_chans": 3, "hidden_size": 1536, "patch_size": 14,
                    "spatial_merge_size": 2, "spatial_patch_size": 14, "temporal_patch_size": 2
                },
                "rope_scaling": { "type": "mrope", "mrope_section": [16, 24, 24] },
                "vocab_size": 151936
            }"#,
        )
        .unwrap();

        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.rope_scaling.mrope_section.iter().sum::<usize>(), 64);
        assert_eq!(config.vision_config.head_dim(), 80);
        assert_eq!(config.vision_config.patch_input_dim(), 1176);
        assert_eq!(config.vision_config.merger_input_dim(), 5120);
        assert_eq!(config.vision_config.mlp_hidden_size(), 5120);
        assert_eq!(config.image_token_id, 151655);
    }

    #[test]
    fn generation_config_accepts_single_or_many_eos() {
        let single: GenerationConfig = serde_json::from_str(r#"{"eos_token_id": 7}"#).unwrap();
        assert_eq!(single.eos_token_id, vec![7]);
        assert!(!single.do_sample);
        assert_eq!(single.repetition_penalty, 1.0);

        let many: GenerationConfig = serde_json::from_str(
            r#"{"bos_token_id": 151643, "pad_token_id": 151643, "do_sample": true,
                "eos_token_id": [151645, 151643], "repetition_penalty": 1.05,
                "temperature": 0.01, "top_k": 1, "top_p": 0.001}"#,
        )
        .unwrap();
        assert!(many.is_eos(151643));
        assert!(many.is_eos(151645));
        assert_eq!(many.top_k, Some(1));
    }
}

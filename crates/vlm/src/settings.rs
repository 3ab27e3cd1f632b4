use crate::DevicePreference;

pub const DEVICE_ENV: &str = "VLM_DEVICE";
pub const REVISION_ENV: &str = "VLM_MODEL_REVISION";
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// Runtime configuration read from the process environment.
///
/// The cache directory is resolved separately by `model_hub::setup_cache_dir`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub device: DevicePreference,
    pub revision: Option<String>,
    pub hf_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let device = match non_empty(DEVICE_ENV) {
            Some(v) => v.parse()?,
            None => DevicePreference::Auto,
        };

        Ok(Self {
            device,
            revision: non_empty(REVISION_ENV),
            hf_token: non_empty(HF_TOKEN_ENV),
        })
    }
}

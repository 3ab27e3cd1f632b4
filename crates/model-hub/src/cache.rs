use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

pub const CACHE_DIR_ENV: &str = "VLM_CACHE_DIR";

/// Returns the directory pretrained artifacts are cached in, creating it if needed.
///
/// `$VLM_CACHE_DIR` wins when set, otherwise the regular Hugging Face hub cache
/// (`$HF_HOME/hub`, `~/.cache/huggingface/hub`) is used so weights already pulled
/// by other tools are reused.
pub fn setup_cache_dir() -> anyhow::Result<PathBuf> {
    let cache_dir = resolve_cache_dir(std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from));
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;
    info!("model cache dir: {:?}", cache_dir);
    Ok(cache_dir)
}

pub fn resolve_cache_dir(configured: Option<PathBuf>) -> PathBuf {
    match configured {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => hf_hub::Cache::default().path().clone(),
    }
}

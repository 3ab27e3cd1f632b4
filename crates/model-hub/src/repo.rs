use anyhow::{bail, Context};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Cache, CacheRepo, Repo, RepoType,
};
use serde::Deserialize;
use std::{
    cell::OnceCell,
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

pub struct HubRepoConfig {
    /// Hub identifier such as `Qwen/Qwen2-VL-2B-Instruct`, or a local directory
    /// holding the same files.
    pub model_id: String,
    pub revision: Option<String>,
    pub cache_dir: PathBuf,
    pub token: Option<String>,
}

enum Source {
    Local(PathBuf),
    Hub { api: ApiRepo, cache: CacheRepo },
}

/// Resolves files of one pretrained checkpoint to local paths,
/// downloading them into the cache dir when they are missing.
pub struct HubRepo {
    model_id: String,
    source: Source,
    remote_files: OnceCell<Vec<String>>,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

impl HubRepo {
    pub fn new(config: HubRepoConfig) -> anyhow::Result<Self> {
        let local_dir = Path::new(&config.model_id);
        let source = if local_dir.is_dir() {
            info!("using local model dir {:?}", local_dir);
            Source::Local(local_dir.to_path_buf())
        } else {
            let repo = match config.revision {
                Some(revision) => {
                    Repo::with_revision(config.model_id.clone(), RepoType::Model, revision)
                }
                None => Repo::new(config.model_id.clone(), RepoType::Model),
            };
            let api = ApiBuilder::new()
                .with_cache_dir(config.cache_dir.clone())
                .with_token(config.token)
                .with_progress(false)
                .build()?;
            Source::Hub {
                api: api.repo(repo.clone()),
                cache: Cache::new(config.cache_dir).repo(repo),
            }
        };

        Ok(Self {
            model_id: config.model_id,
            source,
            remote_files: OnceCell::new(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn get(&self, filename: &str) -> anyhow::Result<PathBuf> {
        match &self.source {
            Source::Local(dir) => {
                let path = dir.join(filename);
                if !path.is_file() {
                    bail!("{} not found in {}", filename, dir.display());
                }
                Ok(path)
            }
            Source::Hub { api, cache } => {
                if let Some(path) = cache.get(filename) {
                    debug!("cache hit for {}", filename);
                    return Ok(path);
                }
                info!("downloading {} from {}", filename, self.model_id);
                api.get(filename)
                    .with_context(|| format!("failed to fetch {} of {}", filename, self.model_id))
            }
        }
    }

    /// Like [`HubRepo::get`], but a file the checkpoint does not ship is `Ok(None)`.
    pub fn get_optional(&self, filename: &str) -> anyhow::Result<Option<PathBuf>> {
        match &self.source {
            Source::Local(dir) => {
                let path = dir.join(filename);
                Ok(path.is_file().then_some(path))
            }
            Source::Hub { cache, .. } => {
                if let Some(path) = cache.get(filename) {
                    return Ok(Some(path));
                }
                if self.remote_files()?.iter().any(|f| f == filename) {
                    self.get(filename).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// All safetensors shards of the checkpoint, sharded or not.
    pub fn safetensors_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        match self.get_optional(SAFETENSORS_INDEX)? {
            Some(index_path) => {
                let shards = read_shard_names(&index_path)?;
                shards.iter().map(|shard| self.get(shard)).collect()
            }
            None => Ok(vec![self.get(SAFETENSORS_SINGLE)?]),
        }
    }

    fn remote_files(&self) -> anyhow::Result<&Vec<String>> {
        if let Some(files) = self.remote_files.get() {
            return Ok(files);
        }
        let Source::Hub { api, .. } = &self.source else {
            bail!("{} is not a hub repo", self.model_id);
        };
        let info = api
            .info()
            .with_context(|| format!("failed to list files of {}", self.model_id))?;
        let files = info.siblings.into_iter().map(|s| s.rfilename).collect();
        Ok(self.remote_files.get_or_init(|| files))
    }
}

fn read_shard_names(index_path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&content)
        .with_context(|| format!("invalid safetensors index {}", index_path.display()))?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_repo(dir: &Path) -> HubRepo {
        HubRepo::new(HubRepoConfig {
            model_id: dir.to_string_lossy().to_string(),
            revision: None,
            cache_dir: dir.join("cache"),
            token: None,
        })
        .expect("local repo")
    }

    #[test_log::test]
    fn local_dir_resolves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let repo = local_repo(dir.path());

        assert_eq!(repo.get("config.json").unwrap(), dir.path().join("config.json"));
        assert!(repo.get("tokenizer.json").is_err());
        assert!(repo.get_optional("chat_template.json").unwrap().is_none());
    }

    #[test_log::test]
    fn sharded_weights_are_deduplicated_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let index = serde_json::json!({
            "metadata": {},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors",
            }
        });
        std::fs::write(dir.path().join(SAFETENSORS_INDEX), index.to_string()).unwrap();
        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();

        let files = local_repo(dir.path()).safetensors_files().unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test_log::test]
    fn single_file_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAFETENSORS_SINGLE), b"").unwrap();

        let files = local_repo(dir.path()).safetensors_files().unwrap();
        assert_eq!(files, vec![dir.path().join(SAFETENSORS_SINGLE)]);
    }
}

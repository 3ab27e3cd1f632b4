use anyhow::anyhow;
use image::DynamicImage;
use serde::{Deserialize, Serialize, Serializer};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Image(DynamicImage),
}

impl ImageSource {
    pub fn load(&self) -> anyhow::Result<DynamicImage> {
        match self {
            ImageSource::Path(path) => image::open(path)
                .map_err(|e| anyhow!("failed to open image {}: {}", path.display(), e)),
            ImageSource::Image(image) => Ok(image.clone()),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&str> for ImageSource {
    fn from(path: &str) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        ImageSource::Image(image)
    }
}

// chat templates only test for the presence of the field, pixels never reach them
impl Serialize for ImageSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ImageSource::Path(path) => serializer.serialize_str(&path.to_string_lossy()),
            ImageSource::Image(image) => serializer.serialize_str(&format!(
                "memory://{}x{}",
                image.width(),
                image.height()
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        image: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        resized_height: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resized_width: Option<u32>,
    },
    Video {
        video: Vec<ImageSource>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(image: impl Into<ImageSource>) -> Self {
        ContentBlock::Image {
            image: image.into(),
            resized_height: None,
            resized_width: None,
        }
    }

    pub fn resized_image(image: impl Into<ImageSource>, width: u32, height: u32) -> Self {
        ContentBlock::Image {
            image: image.into(),
            resized_height: Some(height),
            resized_width: Some(width),
        }
    }

    pub fn video(frames: Vec<ImageSource>) -> Self {
        ContentBlock::Video { video: frames }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, content)
    }
}

/// All turns of one batch item.
pub type Conversation = Vec<Message>;

/// A question keyed by language code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(BTreeMap<String, String>);

impl Query {
    pub const ENGLISH: &'static str = "en";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn en(text: impl Into<String>) -> Self {
        Self::new().with(Self::ENGLISH, text)
    }

    pub fn with(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.0.insert(language.into(), text.into());
        self
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        self.0.get(language).map(String::as_str)
    }

    pub fn english(&self) -> anyhow::Result<&str> {
        self.get(Self::ENGLISH)
            .ok_or_else(|| anyhow!("query has no \"{}\" text", Self::ENGLISH))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One image (first frame of `frames`) and the question asked about it.
#[derive(Debug, Clone)]
pub struct ImageQueryPair {
    pub frames: Vec<ImageSource>,
    pub query: Query,
}

impl ImageQueryPair {
    pub fn new(frames: Vec<ImageSource>, query: Query) -> Self {
        Self { frames, query }
    }

    /// Splits pairs into the parallel batches `process_image_queries` takes.
    pub fn unzip(pairs: Vec<ImageQueryPair>) -> (Vec<Vec<ImageSource>>, Vec<Query>) {
        pairs.into_iter().map(|p| (p.frames, p.query)).unzip()
    }
}

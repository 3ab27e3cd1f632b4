use crate::Message;
use anyhow::{anyhow, Result};
use minijinja::{context, Environment, Value};
use serde::Deserialize;
use std::path::Path;

/// Template shipped with the Qwen2-VL instruct checkpoints.
pub const QWEN2_VL_CHAT_TEMPLATE: &str = "{% set image_count = namespace(value=0) %}{% set video_count = namespace(value=0) %}{% for message in messages %}{% if loop.first and message['role'] != 'system' %}<|im_start|>system
You are a helpful assistant.<|im_end|>
{% endif %}<|im_start|>{{ message['role'] }}
{% if message['content'] is string %}{{ message['content'] }}<|im_end|>
{% else %}{% for content in message['content'] %}{% if content['type'] == 'image' or 'image' in content or 'image_url' in content %}{% set image_count.value = image_count.value + 1 %}{% if add_vision_id %}Picture {{ image_count.value }}: {% endif %}<|vision_start|><|image_pad|><|vision_end|>{% elif content['type'] == 'video' or 'video' in content %}{% set video_count.value = video_count.value + 1 %}{% if add_vision_id %}Video {{ video_count.value }}: {% endif %}<|vision_start|><|video_pad|><|vision_end|>{% elif 'text' in content %}{{ content['text'] }}{% endif %}{% endfor %}<|im_end|>
{% endif %}{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}";

#[derive(Deserialize)]
struct TemplateFile {
    chat_template: Option<String>,
}

/// Jinja chat template rendered with `minijinja`.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::new(QWEN2_VL_CHAT_TEMPLATE)
    }
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// First template found in `chat_template.json`, then `tokenizer_config.json`,
    /// else the built-in one.
    pub fn from_files(
        chat_template_json: Option<&Path>,
        tokenizer_config_json: Option<&Path>,
    ) -> Result<Self> {
        for path in [chat_template_json, tokenizer_config_json].into_iter().flatten() {
            if let Some(source) = read_template(path)? {
                return Ok(Self::new(source));
            }
        }
        Ok(Self::default())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, messages: &[Message], add_generation_prompt: bool) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("chat", &self.source)
            .map_err(|e| anyhow!("failed to add chat template: {}", e))?;
        let tmpl = env
            .get_template("chat")
            .map_err(|e| anyhow!("failed to get chat template: {}", e))?;

        tmpl.render(context! {
            messages => Value::from_serialize(messages),
            add_generation_prompt => add_generation_prompt,
        })
        .map_err(|e| anyhow!("failed to render chat template: {}", e))
    }
}

fn read_template(path: &Path) -> Result<Option<String>> {
    let content = std::fs::read_to_string(path)?;
    let file: TemplateFile = serde_json::from_str(&content)
        .map_err(|e| anyhow!("invalid template file {}: {}", path.display(), e))?;
    Ok(file.chat_template)
}

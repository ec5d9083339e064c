//! Installed-model metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a model is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Main,
    Vae,
    Lora,
    ControlNet,
    TextEncoder,
    Unknown,
}

/// Model family the weights are compatible with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseModelType {
    Any,
    #[serde(rename = "sd-1")]
    StableDiffusion1,
    #[serde(rename = "sdxl")]
    StableDiffusionXl,
    Flux,
    Unknown,
}

/// On-disk (or remote) representation of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Served by an external API, nothing on disk.
    Api,
    Checkpoint,
    Diffusers,
    Gguf,
}

impl ModelFormat {
    /// API models have no files to inspect.
    pub fn is_probeable(self) -> bool {
        !matches!(self, ModelFormat::Api)
    }
}

/// How the install source was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSourceType {
    Api,
    Local,
    Url,
}

impl ModelSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSourceType::Api => "api",
            ModelSourceType::Local => "local",
            ModelSourceType::Url => "url",
        }
    }
}

impl std::fmt::Display for ModelSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered model record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stable key derived from the source, unique in the store.
    pub key: String,
    /// Content hash of the installed files, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub base: BaseModelType,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub format: ModelFormat,
    /// The source string as given by the caller.
    pub source: String,
    pub source_type: ModelSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    /// Apply caller-supplied changes on top of this record.
    pub fn apply(&mut self, changes: &ModelRecordChanges) {
        if let Some(name) = &changes.name {
            self.name = name.clone();
        }
        if let Some(description) = &changes.description {
            self.description = Some(description.clone());
        }
        if let Some(base) = changes.base {
            self.base = base;
        }
        if let Some(model_type) = changes.model_type {
            self.model_type = model_type;
        }
        if let Some(path) = &changes.path {
            self.path = Some(path.clone());
        }
        if let Some(hash) = &changes.hash {
            self.hash = Some(hash.clone());
        }
        if let Some(file_size) = changes.file_size {
            self.file_size = Some(file_size);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for a model record. Also used as install-time overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRecordChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<BaseModelType>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl ModelRecordChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Criteria for listing model records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRecordFilter {
    pub name: Option<String>,
    pub base: Option<BaseModelType>,
    pub model_type: Option<ModelType>,
    pub format: Option<ModelFormat>,
}

impl ModelRecordFilter {
    pub fn matches(&self, config: &ModelConfig) -> bool {
        self.name.as_ref().is_none_or(|n| *n == config.name)
            && self.base.is_none_or(|b| b == config.base)
            && self.model_type.is_none_or(|t| t == config.model_type)
            && self.format.is_none_or(|f| f == config.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        let now = Utc::now();
        ModelConfig {
            key: "k".into(),
            hash: None,
            name: "Gemini".into(),
            description: None,
            base: BaseModelType::Any,
            model_type: ModelType::Main,
            format: ModelFormat::Api,
            source: "invokeai/gemini-2-5-flash".into(),
            source_type: ModelSourceType::Api,
            path: None,
            file_size: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn changes_override_only_set_fields() {
        let mut config = config();
        config.apply(&ModelRecordChanges::default().with_description("fast"));
        assert_eq!(config.name, "Gemini");
        assert_eq!(config.description.as_deref(), Some("fast"));
    }

    #[test]
    fn type_field_serializes_as_type() {
        let value = serde_json::to_value(config()).unwrap();
        assert_eq!(value["type"], "main");
        assert_eq!(value["format"], "api");
        assert_eq!(value["base"], "any");
    }

    #[test]
    fn api_format_is_not_probeable() {
        assert!(!ModelFormat::Api.is_probeable());
        assert!(ModelFormat::Checkpoint.is_probeable());
    }

    #[test]
    fn filter_matches_format() {
        let filter = ModelRecordFilter {
            format: Some(ModelFormat::Api),
            ..Default::default()
        };
        assert!(filter.matches(&config()));
        let filter = ModelRecordFilter {
            format: Some(ModelFormat::Gguf),
            ..Default::default()
        };
        assert!(!filter.matches(&config()));
    }
}

//! Model source resolution and install keys.

use std::path::PathBuf;
use std::sync::LazyLock;

use conductor_core::ModelSourceType;
use regex::Regex;
use url::Url;

use super::InstallError;
use crate::hashing::sha256_hex;

static API_SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^invokeai/([a-z0-9][a-z0-9._-]*)$").expect("API source pattern")
});

/// A model served by an external API rather than installed from files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiModel {
    pub slug: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// Known API models.
pub const API_MODELS: &[ApiModel] = &[
    ApiModel {
        slug: "gemini-2-5-flash",
        name: "Gemini 2.5 Flash Image Gen",
        description: "Google Gemini 2.5 Flash image generation",
    },
    ApiModel {
        slug: "gemini-3-pro",
        name: "Gemini 3 Pro Image Gen",
        description: "Google Gemini 3 Pro image generation",
    },
];

pub fn api_model(slug: &str) -> Option<&'static ApiModel> {
    API_MODELS.iter().find(|model| model.slug == slug)
}

/// A source string classified into one of the supported kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Api { slug: String },
    Local { path: PathBuf },
    Url { url: Url },
}

impl ResolvedSource {
    pub fn source_type(&self) -> ModelSourceType {
        match self {
            ResolvedSource::Api { .. } => ModelSourceType::Api,
            ResolvedSource::Local { .. } => ModelSourceType::Local,
            ResolvedSource::Url { .. } => ModelSourceType::Url,
        }
    }

    /// Normalized form of the source used for the install key.
    pub fn canonical(&self) -> String {
        match self {
            ResolvedSource::Api { slug } => format!("invokeai/{slug}"),
            ResolvedSource::Local { path } => path.display().to_string(),
            ResolvedSource::Url { url } => url.as_str().to_string(),
        }
    }

    /// Stable record key: SHA-256 of `"<source type>:<canonical source>"`.
    pub fn key(&self) -> String {
        sha256_hex(format!("{}:{}", self.source_type(), self.canonical()).as_bytes())
    }
}

/// Classify a source string.
///
/// API identifiers win over local paths, which win over URLs. Local paths
/// are canonicalized, so they must exist.
pub async fn resolve(source: &str) -> Result<ResolvedSource, InstallError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(InstallError::Resolution {
            input: source.to_string(),
            reason: "source is empty".to_string(),
        });
    }

    if let Some(captures) = API_SOURCE.captures(trimmed) {
        return Ok(ResolvedSource::Api {
            slug: captures[1].to_string(),
        });
    }

    if let Ok(path) = tokio::fs::canonicalize(trimmed).await {
        return Ok(ResolvedSource::Local { path });
    }

    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ResolvedSource::Url { url }),
        _ => Err(InstallError::Resolution {
            input: source.to_string(),
            reason: "not an API identifier, existing path or http(s) URL".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_identifiers_resolve_first() {
        let resolved = resolve("invokeai/gemini-2-5-flash").await.unwrap();
        assert_eq!(
            resolved,
            ResolvedSource::Api {
                slug: "gemini-2-5-flash".to_string()
            }
        );
        assert_eq!(resolved.source_type(), ModelSourceType::Api);
        assert_eq!(
            api_model("gemini-2-5-flash").map(|m| m.name),
            Some("Gemini 2.5 Flash Image Gen")
        );
    }

    #[tokio::test]
    async fn existing_paths_resolve_as_local() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(&dir.path().display().to_string()).await.unwrap();
        assert_eq!(resolved.source_type(), ModelSourceType::Local);
    }

    #[tokio::test]
    async fn urls_resolve_and_other_input_is_rejected() {
        let resolved = resolve("https://example.com/model.safetensors").await.unwrap();
        assert_eq!(resolved.source_type(), ModelSourceType::Url);

        assert!(matches!(
            resolve("ftp://example.com/model.bin").await,
            Err(InstallError::Resolution { .. })
        ));
        assert!(resolve("Invokeai/UPPER").await.is_err());
        assert!(resolve("   ").await.is_err());
    }

    #[test]
    fn keys_depend_on_type_and_canonical_source() {
        let api = ResolvedSource::Api { slug: "m".to_string() };
        let same = ResolvedSource::Api { slug: "m".to_string() };
        let url = ResolvedSource::Url {
            url: Url::parse("https://invokeai/m").unwrap(),
        };

        assert_eq!(api.key(), same.key());
        assert_ne!(api.key(), url.key());
        assert_eq!(api.key().len(), 64);
        assert_eq!(api.key(), sha256_hex(b"api:invokeai/m"));
    }
}

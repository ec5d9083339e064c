//! Inspects model files on disk to fill in a record.

use std::path::{Path, PathBuf};

use conductor_core::{BaseModelType, ModelFormat, ModelType};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::hashing::sha256_file;

const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin"];

/// What a probe learned about a model on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedModel {
    pub name: String,
    pub base: BaseModelType,
    pub model_type: ModelType,
    pub format: ModelFormat,
    pub hash: String,
    pub file_size: u64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} is not probeable")]
    NotProbeable(String),

    #[error("Unrecognized model layout at {0}")]
    Unrecognized(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model index: {0}")]
    Json(#[from] serde_json::Error),
}

/// API models live behind a remote service and have nothing on disk.
pub fn probe_api(source: &str) -> Result<ProbedModel, ProbeError> {
    Err(ProbeError::NotProbeable(source.to_string()))
}

#[derive(Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name", default)]
    class_name: String,
}

/// Probe a model file or directory.
pub async fn probe_path(path: &Path) -> Result<ProbedModel, ProbeError> {
    let meta = tokio::fs::metadata(path).await?;
    let name = display_name(path);

    if meta.is_file() {
        let format = file_format(path).ok_or_else(|| ProbeError::Unrecognized(path.to_path_buf()))?;
        return Ok(ProbedModel {
            base: base_from_name(&name),
            model_type: type_from_name(&name),
            format,
            hash: sha256_file(path).await?,
            file_size: meta.len(),
            name,
        });
    }

    let files = list_files(path).await?;
    let index = path.join("model_index.json");
    let (format, base) = if files.contains(&index) {
        let parsed: ModelIndex = serde_json::from_slice(&tokio::fs::read(&index).await?)?;
        let base = match base_from_name(&parsed.class_name) {
            BaseModelType::Unknown => base_from_name(&name),
            base => base,
        };
        (ModelFormat::Diffusers, base)
    } else {
        let mut weights = files.iter().filter_map(|file| file_format(file));
        match (weights.next(), weights.next()) {
            (Some(format), None) => (format, base_from_name(&name)),
            _ => return Err(ProbeError::Unrecognized(path.to_path_buf())),
        }
    };

    let (hash, file_size) = hash_tree(path, &files).await?;
    Ok(ProbedModel {
        base,
        model_type: type_from_name(&name),
        format,
        hash,
        file_size,
        name,
    })
}

fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_format(path: &Path) -> Option<ModelFormat> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if extension == "gguf" {
        Some(ModelFormat::Gguf)
    } else if WEIGHT_EXTENSIONS.contains(&extension.as_str()) {
        Some(ModelFormat::Checkpoint)
    } else {
        None
    }
}

fn base_from_name(name: &str) -> BaseModelType {
    let name = name.to_ascii_lowercase();
    if name.contains("flux") {
        BaseModelType::Flux
    } else if name.contains("sdxl") || name.contains("xl") {
        BaseModelType::StableDiffusionXl
    } else if ["sd15", "sd-1", "v1-5", "stablediffusionpipeline"]
        .iter()
        .any(|marker| name.contains(marker))
    {
        BaseModelType::StableDiffusion1
    } else {
        BaseModelType::Unknown
    }
}

fn type_from_name(name: &str) -> ModelType {
    let name = name.to_ascii_lowercase();
    if name.contains("lora") {
        ModelType::Lora
    } else if name.contains("controlnet") {
        ModelType::ControlNet
    } else if name.contains("vae") {
        ModelType::Vae
    } else if name.contains("t5") || name.contains("clip") || name.contains("text_encoder") {
        ModelType::TextEncoder
    } else {
        ModelType::Main
    }
}

/// Every regular file below `root`, sorted.
async fn list_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Hash a directory as the sorted list of relative paths and file digests.
async fn hash_tree(root: &Path, files: &[PathBuf]) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for file in files {
        let relative = file.strip_prefix(root).unwrap_or(file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(sha256_file(file).await?.as_bytes());
        size += tokio::fs::metadata(file).await?.len();
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_probe_always_refuses() {
        assert!(matches!(
            probe_api("invokeai/gemini-3-pro"),
            Err(ProbeError::NotProbeable(_))
        ));
    }

    #[tokio::test]
    async fn checkpoint_file_is_probed_from_its_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("juggernaut-sdxl.safetensors");
        tokio::fs::write(&path, b"weights").await?;

        let probed = probe_path(&path).await?;
        assert_eq!(probed.name, "juggernaut-sdxl");
        assert_eq!(probed.format, ModelFormat::Checkpoint);
        assert_eq!(probed.base, BaseModelType::StableDiffusionXl);
        assert_eq!(probed.model_type, ModelType::Main);
        assert_eq!(probed.file_size, 7);
        assert_eq!(probed.hash, crate::hashing::sha256_hex(b"weights"));
        Ok(())
    }

    #[tokio::test]
    async fn diffusers_directory_uses_model_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("my-model");
        tokio::fs::create_dir_all(model.join("unet")).await?;
        let index = br#"{"_class_name":"FluxPipeline"}"#;
        tokio::fs::write(model.join("model_index.json"), index).await?;
        tokio::fs::write(model.join("unet/diffusion.safetensors"), b"unet").await?;

        let probed = probe_path(&model).await?;
        assert_eq!(probed.format, ModelFormat::Diffusers);
        assert_eq!(probed.base, BaseModelType::Flux);
        assert_eq!(probed.name, "my-model");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_files_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await?;

        assert!(matches!(probe_path(&path).await, Err(ProbeError::Unrecognized(_))));
        assert!(matches!(probe_path(dir.path()).await, Err(ProbeError::Unrecognized(_))));
        Ok(())
    }
}

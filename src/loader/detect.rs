//! Model format and source detection

use std::path::{Path, PathBuf};

use crate::error::{Error, ResourceKind, Result};

/// Detected model format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// SafeTensors format (HuggingFace standard)
    SafeTensors,
    /// GGUF format (llama.cpp, quantized models)
    Gguf,
}

/// Detected model source
#[derive(Debug, Clone)]
pub struct ModelSource {
    /// Path to the model weights (first shard for sharded models)
    pub weights_path: PathBuf,
    /// Detected format
    pub format: ModelFormat,
    /// Total size of all weight files in bytes
    pub weight_bytes: u64,
}

/// Detect model format and source from a path
///
/// The path can be:
/// - A directory containing model files
/// - A direct path to a .safetensors file
/// - A direct path to a .gguf file
pub fn resolve_model_source<P: AsRef<Path>>(path: P) -> Result<ModelSource> {
    let path = path.as_ref();

    if path.is_file() {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let format = match ext {
            "safetensors" => ModelFormat::SafeTensors,
            "gguf" => ModelFormat::Gguf,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported model file format: .{}",
                    ext
                )))
            }
        };

        Ok(ModelSource {
            weights_path: path.to_path_buf(),
            format,
            weight_bytes: file_size(path)?,
        })
    } else if path.is_dir() {
        detect_model_in_directory(path)
    } else {
        Err(Error::NotFound {
            kind: ResourceKind::ModelPath,
            id: path.display().to_string(),
        })
    }
}

/// Detect model files in a directory
fn detect_model_in_directory(dir: &Path) -> Result<ModelSource> {
    // SafeTensors first, including sharded checkpoints
    let shards = glob_files(dir, "*.safetensors");
    if !shards.is_empty() {
        let mut weight_bytes = 0;
        for shard in &shards {
            weight_bytes += file_size(shard)?;
        }
        return Ok(ModelSource {
            weights_path: shards[0].clone(),
            format: ModelFormat::SafeTensors,
            weight_bytes,
        });
    }

    if let Some(gguf_file) = glob_files(dir, "*.gguf").into_iter().next() {
        let weight_bytes = file_size(&gguf_file)?;
        return Ok(ModelSource {
            weights_path: gguf_file,
            format: ModelFormat::Gguf,
            weight_bytes,
        });
    }

    Err(Error::Config(format!(
        "no supported model files found in directory: {}",
        dir.display()
    )))
}

fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::Config(format!("cannot stat {}: {}", path.display(), e)))
}

/// Files matching a glob pattern inside `dir`, sorted by name
fn glob_files(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = dir.join(pattern);
    let Some(pattern) = full_pattern.to_str() else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map(|paths| paths.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

//! Per-model load settings

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings a model is loaded with
///
/// Immutable once a model is registered under a name; loading the same name
/// again with a different `ModelConfig` is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to model weights (GGUF file, SafeTensors file or model directory)
    pub model_path: PathBuf,

    /// Context window size in tokens
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,

    /// Batch size for prompt processing
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,

    /// Number of CPU threads per context
    #[serde(default = "default_n_threads")]
    pub n_threads: u32,

    /// Number of layers offloaded to the GPU (0 = CPU only)
    #[serde(default)]
    pub n_gpu_layers: i32,

    /// Sampler seed (None = engine default)
    #[serde(default)]
    pub seed: Option<u32>,

    /// Memory-map the weights file
    #[serde(default = "default_true")]
    pub use_mmap: bool,

    /// Lock weights in RAM
    #[serde(default)]
    pub use_mlock: bool,

    /// Contexts produce embeddings instead of logits
    #[serde(default)]
    pub embeddings: bool,

    /// Half-precision KV cache
    #[serde(default = "default_true")]
    pub f16: bool,
}

fn default_n_ctx() -> u32 {
    2048
}

fn default_n_batch() -> u32 {
    512
}

fn default_n_threads() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    /// Config with defaults for the given weights path
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_threads: default_n_threads(),
            n_gpu_layers: 0,
            seed: None,
            use_mmap: true,
            use_mlock: false,
            embeddings: false,
            f16: true,
        }
    }

    /// Same config, but with contexts created in embedding mode
    pub fn for_embeddings(mut self) -> Self {
        self.embeddings = true;
        self
    }

    /// Set the context window size
    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Set the GPU layer count
    pub fn with_gpu_layers(mut self, layers: i32) -> Self {
        self.n_gpu_layers = layers;
        self
    }

    /// Bytes per KV-cache value for this precision
    pub fn bytes_per_value(&self) -> u64 {
        if self.f16 {
            2
        } else {
            4
        }
    }

    /// Estimated working memory of a single context (n_ctx × n_batch × precision)
    pub fn context_bytes(&self) -> u64 {
        self.n_ctx as u64 * self.n_batch as u64 * self.bytes_per_value()
    }

    /// Check if any layers run on the GPU
    pub fn uses_gpu(&self) -> bool {
        self.n_gpu_layers != 0
    }

    /// Reject configs no engine can load
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(Error::Config("model_path must not be empty".into()));
        }
        if self.n_ctx == 0 {
            return Err(Error::Config("n_ctx must be at least 1".into()));
        }
        if self.n_batch == 0 {
            return Err(Error::Config("n_batch must be at least 1".into()));
        }
        if self.n_batch > self.n_ctx {
            return Err(Error::Config(format!(
                "n_batch ({}) must not exceed n_ctx ({})",
                self.n_batch, self.n_ctx
            )));
        }
        if self.n_threads == 0 {
            return Err(Error::Config("n_threads must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = r#"
model_path: ./models/mistral-7b.Q4_K_M.gguf
n_ctx: 4096
n_gpu_layers: -1
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.n_ctx, 4096);
        assert_eq!(config.n_batch, 512);
        assert!(config.use_mmap);
        assert!(config.uses_gpu());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_context_bytes() {
        let config = ModelConfig::new("m.gguf").with_n_ctx(1024);
        assert_eq!(config.context_bytes(), 1024 * 512 * 2);

        let config = ModelConfig {
            f16: false,
            ..config
        };
        assert_eq!(config.context_bytes(), 1024 * 512 * 4);
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert!(ModelConfig::new("").validate().is_err());
        assert!(ModelConfig::new("m.gguf").with_n_ctx(0).validate().is_err());
        assert!(ModelConfig::new("m.gguf").with_n_ctx(128).validate().is_err());
    }
}

//! Inference engine boundary
//!
//! This module provides the seam between the resource manager and the
//! inference backend:
//! - InferenceEngine: the capability a backend implements (load, contexts, generate, embed)
//! - Executor: runs a generation on a checked-out context with stop/limit handling
//! - chat: prompt rendering for chat completions

mod chat;
mod executor;
#[cfg(test)]
pub(crate) mod mock;

pub use chat::{format_chat_prompt, ChatMessage};
pub use executor::{Executor, FinishReason, Generation};

use std::ops::ControlFlow;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::{GenerationParams, ModelConfig};
use crate::loader;

/// Trait for inference backends driven by the resource manager
///
/// All methods may block for a long time; the manager only calls them from
/// blocking threads and never while holding one of its own locks. Handles
/// are released by dropping them.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Loaded model weights; shared read-only by every context of the model
    type Model: Send + Sync + 'static;

    /// A stateful execution context (KV cache + sampler) bound to one model
    type Context: Send + 'static;

    /// One-time backend bring-up
    fn init_backend(&self) -> Result<()>;

    /// Estimated size of the model weights in bytes
    ///
    /// Called before `load` so an over-budget model is never loaded. The
    /// default measures the weight files on disk.
    fn estimate_weight_bytes(&self, config: &ModelConfig) -> crate::Result<u64> {
        loader::resolve_model_source(&config.model_path).map(|source| source.weight_bytes)
    }

    /// Load model weights
    fn load(&self, path: &Path, config: &ModelConfig) -> Result<Self::Model>;

    /// Create a new execution context for a loaded model
    fn new_context(&self, model: &Self::Model, config: &ModelConfig) -> Result<Self::Context>;

    /// Generate tokens for `prompt`, handing each one to `on_token`
    ///
    /// Generation ends when the model emits end-of-sequence, when
    /// `params.max_tokens` is reached, or as soon as `on_token` returns
    /// `ControlFlow::Break`.
    fn generate(
        &self,
        model: &Self::Model,
        context: &mut Self::Context,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(GeneratedToken) -> ControlFlow<()>,
    ) -> Result<()>;

    /// Compute an embedding vector for `text`
    fn embed(&self, model: &Self::Model, context: &mut Self::Context, text: &str)
        -> Result<Vec<f32>>;

    /// Clear per-request state (KV cache, sampler history) before reuse
    fn reset_context(&self, _context: &mut Self::Context) {}

    /// Compute devices available to the backend
    fn device_info(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            name: "CPU Only".to_string(),
            gpu_count: 0,
        }]
    }
}

/// A generated token with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToken {
    /// Token ID
    pub token_id: u32,
    /// Decoded text
    pub text: String,
    /// Log probability (if computed)
    pub logprob: Option<f32>,
}

/// A compute device reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub gpu_count: u32,
}

//! Inferpool - lifecycle and concurrency manager for in-process LLM inference
//!
//! Inferpool sits between callers and an inference backend, keeping loaded
//! models and their execution contexts alive across requests so no call pays
//! for a model reload or waits behind a single context.
//!
//! # Architecture
//!
//! - **engine**: the `InferenceEngine` trait a backend implements, plus the
//!   executor that applies token budgets and stop sequences
//! - **pool**: bounded, TTL-reclaimed context pools, one per model
//! - **manager**: model registry with a memory budget, batch queue, streaming
//!   sessions and the background reaper behind `ResourceManager`
//! - **metrics**: process-wide counters with immutable snapshots
//!
//! # Example
//!
//! ```ignore
//! let manager = ResourceManager::new(MyEngine::new(), ManagerConfig::default())?;
//! manager.load_model("mistral", ModelConfig::new("models/mistral-7b.gguf")).await?;
//!
//! let text = manager
//!     .generate("mistral", "Hello", &GenerationParams::balanced())
//!     .await?;
//!
//! manager.shutdown().await;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod pool;

// Re-export key types
pub use config::{GenerationParams, ManagerConfig, ModelConfig};
pub use engine::{ChatMessage, GeneratedToken, InferenceEngine};
pub use error::{Error, Result};
pub use loader::{resolve_model_source, ModelFormat, ModelSource};
pub use manager::{BatchResult, BatchStatus, ResourceManager, SessionState, StatusReport};
pub use metrics::PerformanceSnapshot;

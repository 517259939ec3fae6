//! Model weight discovery
//!
//! Resolves a configured model path to the weights file the engine will load
//! and measures its on-disk size for memory accounting.

mod detect;

pub use detect::{resolve_model_source, ModelFormat, ModelSource};

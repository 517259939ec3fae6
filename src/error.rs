//! Error types for the resource manager

use thiserror::Error;

/// What kind of identifier a [`Error::NotFound`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Model,
    Session,
    ModelPath,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Model => f.write_str("model"),
            ResourceKind::Session => f.write_str("streaming session"),
            ResourceKind::ModelPath => f.write_str("model path"),
        }
    }
}

/// Errors returned by the resource manager
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid model, generation or manager configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unknown model, session or request id
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    /// A model with this name is already loaded under a different config
    #[error("model '{0}' is already loaded with a different configuration")]
    AlreadyLoaded(String),

    /// Unload requested while operations still hold the model
    #[error("model '{name}' is in use by {references} operation(s)")]
    ModelInUse { name: String, references: usize },

    /// No context became available within the acquire timeout
    #[error("context pool for model '{model}' exhausted ({max_size} contexts in use)")]
    PoolExhausted { model: String, max_size: usize },

    /// Loading the model would exceed the configured memory budget
    #[error(
        "loading model '{model}' needs {required_mb} MB but only {available_mb} MB of the {limit_mb} MB limit is free"
    )]
    MemoryLimitExceeded {
        model: String,
        required_mb: u64,
        available_mb: u64,
        limit_mb: u64,
    },

    /// Batch queue saturated
    #[error("batch queue is full (capacity {0})")]
    QueueFull(usize),

    /// Opaque failure from the inference engine
    #[error("engine error: {0:#}")]
    Engine(#[from] anyhow::Error),

    /// A streaming generation thread failed
    #[error("streaming session '{id}' failed: {message}")]
    Session { id: String, message: String },

    /// The engine backend has not been brought up (or failed to)
    #[error("inference backend is not initialized")]
    NotInitialized,

    /// The manager is shutting down and accepts no more work
    #[error("resource manager is shutting down")]
    ShuttingDown,
}

impl Error {
    pub(crate) fn model_not_found(name: &str) -> Self {
        Error::NotFound {
            kind: ResourceKind::Model,
            id: name.to_string(),
        }
    }

    pub(crate) fn session_not_found(id: &str) -> Self {
        Error::NotFound {
            kind: ResourceKind::Session,
            id: id.to_string(),
        }
    }

    /// Whether the error was produced by the inference engine rather than by
    /// resource bookkeeping
    pub fn is_engine_error(&self) -> bool {
        matches!(self, Error::Engine(_) | Error::Session { .. })
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

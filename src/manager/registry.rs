//! Model registry
//!
//! Maps model names to loaded models, owns the global memory budget and
//! coordinates load/unload. Structural changes (load, unload) are serialized
//! by an async lock that may be held across the engine load; the name map
//! itself is only locked for short lookups so concurrent requests against
//! different models never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::ModelConfig;
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::{ContextPool, PoolStatus};

pub(crate) const MB: u64 = 1024 * 1024;

/// A model bound to its context pool
pub struct LoadedModel<E: InferenceEngine> {
    name: String,
    model: Arc<E::Model>,
    pool: Arc<ContextPool<E>>,
    config: ModelConfig,
    loaded_at: DateTime<Utc>,
    last_access: Mutex<Instant>,
    references: AtomicUsize,
    memory_bytes: AtomicU64,
}

impl<E: InferenceEngine> LoadedModel<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ContextPool<E>> {
        &self.pool
    }

    pub(crate) fn handle(&self) -> Arc<E::Model> {
        Arc::clone(&self.model)
    }

    /// Number of in-flight operations holding this model
    pub fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            config: self.config.clone(),
            loaded_at: self.loaded_at,
            idle_secs: self.idle_time().as_secs(),
            references: self.references(),
            memory_mb: self.memory_bytes() / MB,
            pool: self.pool.status(),
        }
    }
}

/// Counted reference to a loaded model
///
/// While a lease exists the model cannot be unloaded.
pub struct ModelLease<E: InferenceEngine> {
    model: Arc<LoadedModel<E>>,
}

impl<E: InferenceEngine> std::ops::Deref for ModelLease<E> {
    type Target = LoadedModel<E>;

    fn deref(&self) -> &Self::Target {
        &self.model
    }
}

impl<E: InferenceEngine> Drop for ModelLease<E> {
    fn drop(&mut self) {
        self.model.references.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of a successful load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// Same name and same config were already loaded; nothing changed
    AlreadyLoaded,
}

/// Model registry
pub struct ModelRegistry<E: InferenceEngine> {
    engine: Arc<E>,
    models: RwLock<HashMap<String, Arc<LoadedModel<E>>>>,
    /// Serializes load/unload
    structure: tokio::sync::Mutex<()>,
    memory_limit_bytes: AtomicU64,
    max_pool_size: usize,
    metrics: Arc<Metrics>,
}

impl<E: InferenceEngine> ModelRegistry<E> {
    pub fn new(
        engine: Arc<E>,
        memory_limit_bytes: u64,
        max_pool_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            models: RwLock::new(HashMap::new()),
            structure: tokio::sync::Mutex::new(()),
            memory_limit_bytes: AtomicU64::new(memory_limit_bytes),
            max_pool_size,
            metrics,
        }
    }

    /// Estimated footprint of a model: weights plus a full context pool
    pub fn estimate_footprint(&self, config: &ModelConfig, weight_bytes: u64) -> u64 {
        weight_bytes + config.context_bytes() * self.max_pool_size as u64
    }

    /// Footprint estimate for `config`, asking the engine for the weight size
    pub async fn estimate(&self, config: &ModelConfig) -> Result<u64> {
        let engine = Arc::clone(&self.engine);
        let estimate_config = config.clone();
        let weight_bytes =
            tokio::task::spawn_blocking(move || engine.estimate_weight_bytes(&estimate_config))
                .await
                .map_err(|e| anyhow::anyhow!("weight estimate task failed: {}", e))??;
        Ok(self.estimate_footprint(config, weight_bytes))
    }

    /// Load a model under `name`
    ///
    /// Idempotent for an identical config; a different config under the same
    /// name fails without touching the loaded model.
    pub async fn load(&self, name: &str, config: ModelConfig) -> Result<LoadOutcome> {
        config.validate()?;
        let _structure = self.structure.lock().await;

        if let Some(existing) = self.models.read().get(name) {
            if existing.config == config {
                tracing::info!("Model {} already loaded", name);
                return Ok(LoadOutcome::AlreadyLoaded);
            }
            return Err(Error::AlreadyLoaded(name.to_string()));
        }

        let footprint = self.estimate(&config).await?;
        self.check_budget(name, footprint)?;

        let engine = Arc::clone(&self.engine);
        let load_config = config.clone();
        let model = tokio::task::spawn_blocking(move || {
            engine.load(&load_config.model_path, &load_config)
        })
        .await
        .map_err(|e| anyhow::anyhow!("model load task failed: {}", e))?
        .map_err(|e| {
            tracing::warn!("Failed to load model {}: {:#}", name, e);
            Error::Engine(e)
        })?;
        let model = Arc::new(model);

        let pool = Arc::new(ContextPool::new(
            name,
            Arc::clone(&self.engine),
            Arc::clone(&model),
            config.clone(),
            self.max_pool_size,
            Arc::clone(&self.metrics),
        ));

        let now = Instant::now();
        let loaded = Arc::new(LoadedModel {
            name: name.to_string(),
            model,
            pool,
            config,
            loaded_at: Utc::now(),
            last_access: Mutex::new(now),
            references: AtomicUsize::new(0),
            memory_bytes: AtomicU64::new(footprint),
        });

        self.models.write().insert(name.to_string(), loaded);
        self.metrics.add_memory(footprint);

        tracing::info!(
            "Successfully loaded model: {} (estimated {} MB)",
            name,
            footprint / MB
        );
        Ok(LoadOutcome::Loaded)
    }

    fn check_budget(&self, name: &str, footprint: u64) -> Result<()> {
        let limit = self.memory_limit_bytes();
        if limit == 0 {
            return Ok(());
        }

        let used = self.memory_usage_bytes();
        if used + footprint > limit {
            tracing::warn!(
                "Memory limit reached, cannot load model {} ({} MB needed, {} of {} MB used)",
                name,
                footprint / MB,
                used / MB,
                limit / MB
            );
            return Err(Error::MemoryLimitExceeded {
                model: name.to_string(),
                required_mb: footprint.div_ceil(MB),
                available_mb: limit.saturating_sub(used) / MB,
                limit_mb: limit / MB,
            });
        }
        Ok(())
    }

    /// Unload a model that no operation is holding
    pub async fn unload(&self, name: &str) -> Result<()> {
        let _structure = self.structure.lock().await;

        let removed = {
            let mut models = self.models.write();
            let references = models
                .get(name)
                .ok_or_else(|| Error::model_not_found(name))?
                .references();
            if references > 0 {
                return Err(Error::ModelInUse {
                    name: name.to_string(),
                    references,
                });
            }
            models.remove(name)
        };

        if let Some(model) = removed {
            self.retire(&model);
            tracing::info!("Unloaded model: {}", name);
        }
        Ok(())
    }

    fn retire(&self, model: &LoadedModel<E>) {
        model.pool.close();
        self.metrics.sub_memory(model.memory_bytes());
    }

    /// Take a counted reference to a model
    pub fn lease(&self, name: &str) -> Result<ModelLease<E>> {
        let models = self.models.read();
        let model = models.get(name).ok_or_else(|| Error::model_not_found(name))?;
        // Incremented under the map lock so unload sees it
        model.references.fetch_add(1, Ordering::SeqCst);
        *model.last_access.lock() = Instant::now();
        Ok(ModelLease {
            model: Arc::clone(model),
        })
    }

    /// Remove every model regardless of references
    pub async fn clear(&self) {
        let _structure = self.structure.lock().await;
        let removed: Vec<_> = self.models.write().drain().collect();
        for (name, model) in removed {
            self.retire(&model);
            tracing::info!("Unloaded model: {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedModel<E>>> {
        self.models.read().get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.models.read().len()
    }

    /// Loaded model names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn info(&self, name: &str) -> Option<ModelInfo> {
        self.models.read().get(name).map(|m| m.info())
    }

    /// Info for every loaded model, sorted by name
    pub fn infos(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self.models.read().values().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn pools(&self) -> Vec<Arc<ContextPool<E>>> {
        self.models
            .read()
            .values()
            .map(|m| Arc::clone(&m.pool))
            .collect()
    }

    pub fn pool_statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<PoolStatus> = self.pools().iter().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.model.cmp(&b.model));
        statuses
    }

    /// Run one TTL sweep over every pool; returns contexts destroyed
    pub fn cleanup_expired_contexts(&self, ttl: Duration) -> usize {
        // Pools are swept without holding the map lock
        self.pools().iter().map(|p| p.cleanup_expired(ttl)).sum()
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes.load(Ordering::SeqCst)
    }

    pub fn set_memory_limit_bytes(&self, bytes: u64) {
        self.memory_limit_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Summed footprint of all loaded models
    pub fn memory_usage_bytes(&self) -> u64 {
        self.models.read().values().map(|m| m.memory_bytes()).sum()
    }

    /// Whether usage is within the budget (always true when unlimited)
    pub fn check_memory_limit(&self) -> bool {
        let limit = self.memory_limit_bytes();
        limit == 0 || self.memory_usage_bytes() <= limit
    }
}

/// Snapshot of one loaded model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub config: ModelConfig,
    pub loaded_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub references: usize,
    pub memory_mb: u64,
    pub pool: PoolStatus,
}

//! Resource manager
//!
//! `ResourceManager` is the entry point callers hold. It owns:
//! - the model registry and its per-model context pools
//! - the batch queue and its single worker task
//! - the streaming session table
//! - the reaper task that reclaims idle resources
//!
//! Create one per process with [`ResourceManager::new`] inside a tokio
//! runtime and share it (it is `Send + Sync`). Call
//! [`ResourceManager::shutdown`] to stop background work deterministically.

mod batch;
mod reaper;
mod registry;
mod streaming;

pub use batch::{BatchRequest, BatchResult, BatchStatus};
pub use reaper::ReaperReport;
pub use registry::{LoadOutcome, LoadedModel, ModelInfo};
pub use streaming::{SessionInfo, SessionState, StreamToken};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{GenerationParams, ManagerConfig, ModelConfig};
use crate::engine::{
    format_chat_prompt, ChatMessage, DeviceInfo, Executor, Generation, InferenceEngine,
};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, PerformanceSnapshot};
use crate::pool::PoolStatus;
use batch::BatchQueue;
use registry::{ModelRegistry, MB};
use streaming::{ProducerSettings, SessionManager};

/// State shared between the manager handle and its background tasks
pub(crate) struct Inner<E: InferenceEngine> {
    engine: Arc<E>,
    config: ManagerConfig,
    registry: ModelRegistry<E>,
    metrics: Arc<Metrics>,
    batch: BatchQueue,
    sessions: SessionManager,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl<E: InferenceEngine> Inner<E> {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        self.ensure_running()?;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let engine = Arc::clone(&self.engine);
        let result = tokio::task::spawn_blocking(move || engine.init_backend())
            .await
            .map_err(|e| anyhow::anyhow!("backend init task failed: {}", e))?;

        match result {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!("Inference backend initialized");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to initialize inference backend: {:#}", e);
                Err(Error::Engine(e))
            }
        }
    }

    /// Run one generation on a pooled context
    ///
    /// The model lease and the context travel into the blocking thread and
    /// are released there, so they go back even if the caller stops waiting.
    async fn generate(
        &self,
        model_name: &str,
        prompt: String,
        params: GenerationParams,
    ) -> Result<Generation> {
        self.ensure_ready()?;
        params.validate()?;

        let lease = self.registry.lease(model_name)?;
        let pool = Arc::clone(lease.pool());
        let context = pool.acquire(self.config.acquire_timeout()).await?;

        let started = Instant::now();
        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut context = context;
            let model = lease.handle();
            let result =
                Executor::new(&*engine, &*model).generate_text(context.context_mut(), &prompt, &params);
            drop(context);
            drop(lease);
            result
        })
        .await
        .map_err(|e| anyhow::anyhow!("generation task failed: {}", e))?;

        match outcome {
            Ok(generation) => {
                self.metrics
                    .record_request(generation.tokens, started.elapsed());
                tracing::debug!(
                    "Generated {} tokens with model {} in {:?}",
                    generation.tokens,
                    model_name,
                    started.elapsed()
                );
                Ok(generation)
            }
            Err(e) => {
                tracing::warn!("Generation with model {} failed: {:#}", model_name, e);
                Err(Error::Engine(e))
            }
        }
    }

    async fn embed(&self, model_name: &str, text: String) -> Result<Vec<f32>> {
        self.ensure_ready()?;

        let lease = self.registry.lease(model_name)?;
        if !lease.config().embeddings {
            return Err(Error::Config(format!(
                "model '{}' was not loaded with embeddings enabled",
                model_name
            )));
        }
        let pool = Arc::clone(lease.pool());
        let context = pool.acquire(self.config.acquire_timeout()).await?;

        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut context = context;
            let model = lease.handle();
            let result = Executor::new(&*engine, &*model).embed(context.context_mut(), &text);
            drop(context);
            drop(lease);
            result
        })
        .await
        .map_err(|e| anyhow::anyhow!("embedding task failed: {}", e))?;

        outcome.map_err(|e| {
            tracing::warn!("Embedding with model {} failed: {:#}", model_name, e);
            Error::Engine(e)
        })
    }
}

/// Memory budget and usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub used_mb: u64,
    /// 0 when unlimited
    pub limit_mb: u64,
    pub peak_mb: u64,
    /// Estimated footprint per loaded model, sorted by name
    pub models: Vec<(String, u64)>,
}

impl MemoryStatus {
    pub fn is_healthy(&self) -> bool {
        self.limit_mb == 0 || self.used_mb <= self.limit_mb
    }
}

/// Everything `status()` reports, in structured form
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub initialized: bool,
    pub shutting_down: bool,
    pub models: Vec<ModelInfo>,
    pub memory: MemoryStatus,
    pub metrics: PerformanceSnapshot,
    pub pending_batch_requests: usize,
    pub completed_batch_results: usize,
    pub streaming_sessions: usize,
    pub active_streaming_sessions: usize,
}

impl StatusReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Engine(anyhow::anyhow!("failed to serialize status: {}", e)))
    }
}

/// Lifecycle and concurrency manager for inference resources
pub struct ResourceManager<E: InferenceEngine> {
    inner: Arc<Inner<E>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: InferenceEngine> ResourceManager<E> {
    /// Create a manager and start its batch worker and reaper
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(engine: E, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("ResourceManager must be created inside a tokio runtime".into())
        })?;

        let engine = Arc::new(engine);
        let metrics = Arc::new(Metrics::new());
        let (batch, requests) = BatchQueue::new(config.batch_queue_capacity, config.max_batch_results);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            registry: ModelRegistry::new(
                Arc::clone(&engine),
                config.memory_limit_bytes(),
                config.max_pool_size,
                Arc::clone(&metrics),
            ),
            sessions: SessionManager::new(config.stream_queue_capacity),
            engine,
            config,
            metrics,
            batch,
            shutdown: shutdown.clone(),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        });

        let tasks = vec![
            runtime.spawn(run_batch_worker(
                Arc::clone(&inner),
                requests,
                shutdown.clone(),
            )),
            runtime.spawn(reaper::run(Arc::clone(&inner), shutdown)),
        ];

        tracing::info!(
            "Resource manager started (max pool size {}, memory limit {} MB)",
            inner.config.max_pool_size,
            inner.config.memory_limit_mb
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Bring up the engine backend; idempotent
    ///
    /// A failure is returned here and leaves the manager uninitialized, so
    /// every operation needing the backend fails with `NotInitialized` until
    /// a later call succeeds.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.initialize().await
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    // Models

    /// Load a model, initializing the backend first if needed
    pub async fn load_model(&self, name: &str, config: ModelConfig) -> Result<LoadOutcome> {
        self.inner.ensure_running()?;
        self.inner.initialize().await?;
        self.inner.registry.load(name, config).await
    }

    /// Unload a model; fails with `ModelInUse` while any operation holds it
    pub async fn unload_model(&self, name: &str) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.registry.unload(name).await
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<LoadedModel<E>>> {
        self.inner.registry.get(name)
    }

    pub fn is_model_loaded(&self, name: &str) -> bool {
        self.inner.registry.is_loaded(name)
    }

    pub fn loaded_model_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn loaded_model_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn model_info(&self, name: &str) -> Result<ModelInfo> {
        self.inner
            .registry
            .info(name)
            .ok_or_else(|| Error::model_not_found(name))
    }

    /// Footprint a model would be charged if loaded with `config`
    pub async fn estimate_model_memory(&self, config: &ModelConfig) -> Result<u64> {
        config.validate()?;
        self.inner.registry.estimate(config).await
    }

    // Synchronous inference

    /// Generate text for `prompt`
    pub async fn generate(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        self.generate_with_details(model_name, prompt, params)
            .await
            .map(|generation| generation.text)
    }

    /// Like [`generate`](Self::generate) but also reports token count and finish reason
    pub async fn generate_with_details(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation> {
        self.inner
            .generate(model_name, prompt.to_string(), params.clone())
            .await
    }

    pub async fn chat_completion(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String> {
        let prompt = format_chat_prompt(messages)?;
        self.generate(model_name, &prompt, params).await
    }

    /// Embedding vector for `text`; the model must be loaded with `embeddings = true`
    pub async fn embed(&self, model_name: &str, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(model_name, text.to_string()).await
    }

    // Batch

    /// Queue a generation and return its request id immediately
    pub fn submit_batch_request(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        self.inner.ensure_running()?;
        params.validate()?;
        self.inner.batch.submit(model_name, prompt, params.clone())
    }

    /// Terminal result of a batch request, `None` until it completes
    pub fn batch_result(&self, request_id: &str) -> Option<BatchResult> {
        self.inner.batch.result(request_id)
    }

    pub fn batch_status(&self, request_id: &str) -> Option<BatchStatus> {
        self.inner.batch.status(request_id)
    }

    /// Retained batch results in completion order
    pub fn all_batch_results(&self) -> Vec<BatchResult> {
        self.inner.batch.all_results()
    }

    // Streaming

    /// Start a streaming generation and return its session id
    pub async fn start_streaming_session(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        self.inner.ensure_ready()?;
        params.validate()?;
        let lease = self.inner.registry.lease(model_name)?;

        Ok(self.inner.sessions.start(
            Arc::clone(&self.inner.engine),
            lease,
            prompt,
            params.clone(),
            ProducerSettings {
                acquire_timeout: self.inner.config.acquire_timeout(),
                cancel: self.inner.shutdown.child_token(),
                metrics: Arc::clone(&self.inner.metrics),
            },
        ))
    }

    /// Wait for the next token; `Ok(None)` once the session is drained
    pub async fn next_stream_token(&self, session_id: &str) -> Result<Option<StreamToken>> {
        self.inner.sessions.next_token(session_id).await
    }

    /// Stop a session; its context is back in the pool when this returns
    pub async fn stop_streaming_session(&self, session_id: &str) -> Result<()> {
        self.inner.sessions.stop(session_id).await
    }

    /// Tokens of a session as a `Stream`
    ///
    /// Ends after the last token; a session failure is yielded once as an
    /// error item.
    pub fn token_stream(
        &self,
        session_id: &str,
    ) -> impl Stream<Item = Result<StreamToken>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        async_stream::stream! {
            loop {
                match inner.sessions.next_token(&session_id).await {
                    Ok(Some(token)) => yield Ok(token),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.inner.sessions.info(session_id)
    }

    /// Sessions still generating
    pub fn active_session_count(&self) -> usize {
        self.inner.sessions.active_count()
    }

    // Metrics and memory

    pub fn metrics(&self) -> PerformanceSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        tracing::info!("Performance metrics reset");
    }

    /// Change the global memory budget (0 = unlimited)
    ///
    /// Models already loaded stay loaded; the new limit applies to later loads.
    pub fn set_memory_limit(&self, limit_mb: u64) {
        self.inner.registry.set_memory_limit_bytes(limit_mb * MB);
        tracing::info!("Memory limit set to {} MB", limit_mb);
    }

    pub fn check_memory_limit(&self) -> bool {
        self.inner.registry.check_memory_limit()
    }

    pub fn check_memory_health(&self) -> bool {
        let healthy = self.check_memory_limit();
        if !healthy {
            tracing::warn!(
                "Memory usage {} MB is above the {} MB limit",
                self.inner.registry.memory_usage_bytes() / MB,
                self.inner.registry.memory_limit_bytes() / MB
            );
        }
        healthy
    }

    pub fn memory_status(&self) -> MemoryStatus {
        MemoryStatus {
            used_mb: self.inner.registry.memory_usage_bytes() / MB,
            limit_mb: self.inner.registry.memory_limit_bytes() / MB,
            peak_mb: self.inner.metrics.snapshot().peak_memory_mb(),
            models: self
                .inner
                .registry
                .infos()
                .into_iter()
                .map(|info| (info.name, info.memory_mb))
                .collect(),
        }
    }

    /// Context pool occupancy per model, sorted by model name
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.inner.registry.pool_statuses()
    }

    /// Compute devices reported by the engine
    pub async fn device_info(&self) -> Result<Vec<DeviceInfo>> {
        let engine = Arc::clone(&self.inner.engine);
        let devices = tokio::task::spawn_blocking(move || engine.device_info())
            .await
            .map_err(|e| anyhow::anyhow!("device query task failed: {}", e))?;
        Ok(devices)
    }

    // Reclamation

    /// Destroy idle pooled contexts older than the configured TTL
    pub fn cleanup_expired_contexts(&self) -> usize {
        self.inner
            .registry
            .cleanup_expired_contexts(self.inner.config.context_ttl())
    }

    /// Remove finished sessions idle longer than the configured timeout
    pub fn cleanup_expired_sessions(&self) -> usize {
        self.inner
            .sessions
            .cleanup_expired(self.inner.config.session_idle_timeout())
    }

    /// Run one reaper sweep now
    pub fn run_reaper_cycle(&self) -> ReaperReport {
        self.inner.reap()
    }

    // Status

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            initialized: self.is_initialized(),
            shutting_down: self.inner.shutdown.is_cancelled(),
            models: self.inner.registry.infos(),
            memory: self.memory_status(),
            metrics: self.metrics(),
            pending_batch_requests: self.inner.batch.pending_count(),
            completed_batch_results: self.inner.batch.completed_count(),
            streaming_sessions: self.inner.sessions.len(),
            active_streaming_sessions: self.inner.sessions.active_count(),
        }
    }

    /// Human-readable status summary
    pub fn status(&self) -> String {
        let report = self.status_report();
        let mut out = String::new();

        out.push_str(&format!(
            "Backend: {}\n",
            if report.shutting_down {
                "shutting down"
            } else if report.initialized {
                "ready"
            } else {
                "not initialized"
            }
        ));
        out.push_str(&format!("Loaded models: {}\n", report.models.len()));
        for model in &report.models {
            out.push_str(&format!(
                "  {} ({} MB, {} in use, contexts {}/{} available)\n",
                model.name,
                model.memory_mb,
                model.references,
                model.pool.available,
                model.pool.size
            ));
        }

        let limit = if report.memory.limit_mb == 0 {
            "unlimited".to_string()
        } else {
            format!("{} MB", report.memory.limit_mb)
        };
        out.push_str(&format!(
            "Memory: {} MB used, {} MB peak, limit {}\n",
            report.memory.used_mb, report.memory.peak_mb, limit
        ));
        out.push_str(&format!(
            "Requests: {} ({} tokens, {:.1} tokens/s, {:.1} ms avg latency)\n",
            report.metrics.total_requests,
            report.metrics.total_tokens_generated,
            report.metrics.average_tokens_per_second(),
            report.metrics.average_latency_ms()
        ));
        out.push_str(&format!(
            "Batch: {} pending, {} results\n",
            report.pending_batch_requests, report.completed_batch_results
        ));
        out.push_str(&format!(
            "Streaming sessions: {} ({} active)\n",
            report.streaming_sessions, report.active_streaming_sessions
        ));
        out
    }

    // Lifecycle

    /// Stop background work and release every resource
    ///
    /// Streaming sessions are stopped, queued batch requests are completed
    /// with a shutdown error, all models are unloaded and metrics reset.
    /// Every later operation fails with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() && self.tasks.lock().is_empty() {
            return;
        }
        tracing::info!("Shutting down resource manager");

        self.inner.shutdown.cancel();
        self.inner.sessions.stop_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        self.inner.registry.clear().await;
        self.inner.metrics.reset();
        tracing::info!("Resource manager shut down");
    }
}

impl<E: InferenceEngine> Drop for ResourceManager<E> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Batch worker: executes queued requests one at a time in submission order
async fn run_batch_worker<E: InferenceEngine>(
    inner: Arc<Inner<E>>,
    mut requests: mpsc::Receiver<BatchRequest>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Batch worker started");

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        tracing::debug!("Processing batch request {}", request.request_id);
        let started = Instant::now();
        let outcome = inner
            .generate(&request.model_name, request.prompt.clone(), request.params.clone())
            .await
            .map(|generation| (generation.text, generation.tokens));
        if let Err(e) = &outcome {
            tracing::warn!("Batch request {} failed: {}", request.request_id, e);
        }
        inner
            .batch
            .complete(BatchResult::completed(&request, outcome, started.elapsed()));
    }

    // Whatever is still queued will never run
    requests.close();
    while let Ok(request) = requests.try_recv() {
        inner.batch.complete(BatchResult::completed(
            &request,
            Err(Error::ShuttingDown),
            Duration::ZERO,
        ));
    }
    tracing::debug!("Batch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use futures::StreamExt;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn manager_config() -> ManagerConfig {
        ManagerConfig {
            max_pool_size: 2,
            acquire_timeout_ms: 1_000,
            ..ManagerConfig::default()
        }
    }

    fn small_model(path: &str) -> ModelConfig {
        ModelConfig {
            n_ctx: 512,
            n_batch: 512,
            ..ModelConfig::new(path)
        }
    }

    async fn manager_with(engine: MockEngine, config: ManagerConfig) -> ResourceManager<MockEngine> {
        let manager = ResourceManager::new(engine, config).unwrap();
        manager.load_model("m", small_model("m.gguf")).await.unwrap();
        manager
    }

    async fn wait_for_result(manager: &ResourceManager<MockEngine>, id: &str) -> BatchResult {
        for _ in 0..1_000 {
            if let Some(result) = manager.batch_result(id) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("batch request {} never completed", id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generate_end_to_end() {
        init_tracing();
        let manager = manager_with(MockEngine::new(), manager_config()).await;
        assert!(manager.is_initialized());

        let text = manager
            .generate("m", "hello", &GenerationParams::greedy())
            .await
            .unwrap();
        assert_eq!(text, "tok0 tok1 tok2 tok3 tok4 ");

        let snap = manager.metrics();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.total_tokens_generated, 5);

        // The context went back to the pool
        let pools = manager.pool_status();
        assert_eq!(pools[0].available, 1);
        assert_eq!(pools[0].in_use, 0);

        manager.unload_model("m").await.unwrap();
        assert!(!manager.is_model_loaded("m"));
        assert_eq!(manager.engine().live_contexts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generate_respects_stop_sequence_and_limit() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        let params = GenerationParams::greedy().with_stop("tok2 ");
        let generation = manager
            .generate_with_details("m", "hello", &params)
            .await
            .unwrap();
        assert_eq!(generation.text, "tok0 tok1 ");
        assert_eq!(generation.finish_reason, crate::engine::FinishReason::StopSequence);

        let params = GenerationParams::greedy().with_max_tokens(2);
        let generation = manager
            .generate_with_details("m", "LONG", &params)
            .await
            .unwrap();
        assert_eq!(generation.tokens, 2);
        assert_eq!(generation.finish_reason, crate::engine::FinishReason::Length);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_failure_releases_context() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        let err = manager
            .generate("m", "FAIL", &GenerationParams::greedy())
            .await
            .unwrap_err();
        assert!(err.is_engine_error());

        let info = manager.model_info("m").unwrap();
        assert_eq!(info.references, 0);
        assert_eq!(info.pool.in_use, 0);
        manager.unload_model("m").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_model_and_bad_params() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        assert!(matches!(
            manager.generate("nope", "hi", &GenerationParams::default()).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            manager
                .generate("m", "hi", &GenerationParams::default().with_max_tokens(0))
                .await,
            Err(Error::Config(_))
        ));
        assert!(manager.model_info("nope").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chat_completion() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        let messages = [ChatMessage::system("Be brief."), ChatMessage::user("hi")];
        let text = manager
            .chat_completion("m", &messages, &GenerationParams::greedy())
            .await
            .unwrap();
        assert!(text.starts_with("tok0 "));

        let bad = [ChatMessage::new("narrator", "once upon a time")];
        assert!(matches!(
            manager
                .chat_completion("m", &bad, &GenerationParams::greedy())
                .await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_embeddings_require_embedding_model() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;
        assert!(matches!(
            manager.embed("m", "text").await,
            Err(Error::Config(_))
        ));

        manager
            .load_model("e", small_model("e.gguf").for_embeddings())
            .await
            .unwrap();
        let embedding = manager.embed("e", "text").await.unwrap();
        assert_eq!(embedding, vec![4.0, 1.0, 2.0, 3.0]);
        // Embeddings are not generation requests
        assert_eq!(manager.metrics().total_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backend_init_failure_blocks_operations_until_retry() {
        let manager =
            ResourceManager::new(MockEngine::new().with_init_failure(), manager_config()).unwrap();

        let err = manager
            .load_model("m", small_model("m.gguf"))
            .await
            .unwrap_err();
        assert!(err.is_engine_error());
        assert!(!manager.is_initialized());
        assert!(matches!(
            manager
                .start_streaming_session("m", "hi", &GenerationParams::greedy())
                .await,
            Err(Error::NotInitialized)
        ));

        manager.engine().set_init_failure(false);
        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        assert_eq!(manager.engine().stats.init_calls.load(Ordering::SeqCst), 2);

        manager.load_model("m", small_model("m.gguf")).await.unwrap();
        assert!(manager.generate("m", "hi", &GenerationParams::greedy()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_limit_across_models() {
        // 1 MB weights + 2 contexts × 512 × 512 × 2 bytes = 2 MB per model
        let config = manager_config().with_memory_limit_mb(5);
        let manager = manager_with(MockEngine::new(), config).await;

        manager.load_model("b", small_model("b.gguf")).await.unwrap();
        let err = manager
            .load_model("c", small_model("c.gguf"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MemoryLimitExceeded { .. }));

        assert_eq!(manager.loaded_model_names(), vec!["b", "m"]);
        assert!(manager.generate("b", "hi", &GenerationParams::greedy()).await.is_ok());

        let memory = manager.memory_status();
        assert_eq!(memory.used_mb, 4);
        assert_eq!(memory.limit_mb, 5);
        assert!(manager.check_memory_health());

        // Lowering the limit does not evict anything
        manager.set_memory_limit(3);
        assert!(!manager.check_memory_health());
        assert_eq!(manager.loaded_model_count(), 2);

        assert_eq!(
            manager.estimate_model_memory(&small_model("x.gguf")).await.unwrap(),
            2 * MB
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_results_follow_submission_order() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        let params = GenerationParams::greedy();
        let ids: Vec<String> = ["a", "bb", "ccc"]
            .iter()
            .map(|prompt| manager.submit_batch_request("m", prompt, &params).unwrap())
            .collect();
        let missing = manager
            .submit_batch_request("nope", "x", &params)
            .unwrap();

        let mut results = Vec::new();
        for id in &ids {
            results.push(wait_for_result(&manager, id).await);
        }
        for pair in results.windows(2) {
            assert!(pair[0].completed_at <= pair[1].completed_at);
        }
        assert_eq!(results[2].response, "tok0 tok1 tok2 ");
        assert!(results.iter().all(|r| r.success));

        let failed = wait_for_result(&manager, &missing).await;
        assert!(!failed.success);
        assert!(failed.error_message.unwrap().contains("nope"));

        let order: Vec<String> = manager
            .all_batch_results()
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        assert_eq!(order, [ids, vec![missing]].concat());
        assert!(manager.batch_status("batch-unknown").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unload_refused_while_batch_in_flight() {
        let engine = MockEngine::new().with_token_delay(Duration::from_millis(10));
        let manager = manager_with(engine, manager_config()).await;

        let id = manager
            .submit_batch_request("m", "LONG", &GenerationParams::greedy().with_max_tokens(20))
            .unwrap();

        for _ in 0..200 {
            if manager.model_info("m").unwrap().references > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(matches!(
            manager.unload_model("m").await,
            Err(Error::ModelInUse { .. })
        ));

        let result = wait_for_result(&manager, &id).await;
        assert!(result.success);
        assert_eq!(result.tokens_generated, 20);
        manager.unload_model("m").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_streaming_session_through_manager() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;

        let id = manager
            .start_streaming_session("m", "abc", &GenerationParams::greedy())
            .await
            .unwrap();
        let tokens: Vec<String> = manager
            .token_stream(&id)
            .map(|token| token.unwrap().text)
            .collect()
            .await;

        assert_eq!(tokens, vec!["tok0 ", "tok1 ", "tok2 "]);
        assert!(manager.session_info(&id).is_err());
        assert_eq!(manager.metrics().total_tokens_generated, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_session_returns_context_and_allows_unload() {
        let engine = MockEngine::new().with_token_delay(Duration::from_millis(5));
        let manager = manager_with(engine, manager_config()).await;

        let id = manager
            .start_streaming_session("m", "LONG", &GenerationParams::greedy().with_max_tokens(10_000))
            .await
            .unwrap();
        assert!(manager.next_stream_token(&id).await.unwrap().is_some());
        assert_eq!(manager.active_session_count(), 1);

        // The session holds the model
        assert!(matches!(
            manager.unload_model("m").await,
            Err(Error::ModelInUse { .. })
        ));

        manager.stop_streaming_session(&id).await.unwrap();
        assert!(manager.next_stream_token(&id).await.is_err());

        let pool = &manager.pool_status()[0];
        assert_eq!(pool.in_use, 0);
        assert_eq!(pool.available, 1);
        manager.unload_model("m").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_exhaustion() {
        let engine = MockEngine::new().with_token_delay(Duration::from_millis(5));
        let config = ManagerConfig {
            max_pool_size: 1,
            acquire_timeout_ms: 50,
            ..ManagerConfig::default()
        };
        let manager = manager_with(engine, config).await;

        let id = manager
            .start_streaming_session("m", "LONG", &GenerationParams::greedy().with_max_tokens(10_000))
            .await
            .unwrap();
        assert!(manager.next_stream_token(&id).await.unwrap().is_some());

        let err = manager
            .generate("m", "hi", &GenerationParams::greedy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { max_size: 1, .. }));

        manager.stop_streaming_session(&id).await.unwrap();
        assert!(manager.generate("m", "hi", &GenerationParams::greedy()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reaper_cycle_evicts_idle_contexts() {
        let config = ManagerConfig {
            context_ttl_secs: 0,
            session_idle_timeout_secs: 0,
            batch_result_ttl_secs: 0,
            ..manager_config()
        };
        let manager = manager_with(MockEngine::new(), config).await;

        manager
            .generate("m", "hi", &GenerationParams::greedy())
            .await
            .unwrap();
        let id = manager
            .submit_batch_request("m", "hi", &GenerationParams::greedy())
            .unwrap();
        wait_for_result(&manager, &id).await;

        let report = manager.run_reaper_cycle();
        assert_eq!(report.contexts_evicted, 1);
        assert_eq!(report.batch_results_expired, 1);
        assert_eq!(manager.pool_status()[0].size, 0);
        assert_eq!(manager.engine().live_contexts(), 0);
        assert!(manager.run_reaper_cycle().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper_evicts_idle_contexts() {
        let config = ManagerConfig {
            reaper_interval_secs: 1,
            context_ttl_secs: 0,
            ..manager_config()
        };
        let manager = manager_with(MockEngine::new(), config).await;

        manager
            .generate("m", "hi", &GenerationParams::greedy())
            .await
            .unwrap();
        assert_eq!(manager.pool_status()[0].size, 1);

        // Past at least one reaper tick after the context went idle
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(manager.pool_status()[0].size, 0);
        assert_eq!(manager.engine().live_contexts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_report() {
        let manager = manager_with(MockEngine::new(), manager_config()).await;
        manager
            .generate("m", "hi", &GenerationParams::greedy())
            .await
            .unwrap();

        let status = manager.status();
        assert!(status.contains("Backend: ready"));
        assert!(status.contains("  m ("));
        assert!(status.contains("limit unlimited"));

        let json: serde_json::Value =
            serde_json::from_str(&manager.status_report().to_json().unwrap()).unwrap();
        assert_eq!(json["models"][0]["name"], "m");
        assert_eq!(json["metrics"]["total_requests"], 1);

        let devices = manager.device_info().await.unwrap();
        assert_eq!(devices[0].name, "CPU Only");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_everything() {
        init_tracing();
        let manager = manager_with(MockEngine::new(), manager_config()).await;
        manager
            .generate("m", "hi", &GenerationParams::greedy())
            .await
            .unwrap();

        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(manager.loaded_model_count(), 0);
        assert_eq!(manager.engine().live_contexts(), 0);
        assert_eq!(manager.metrics().total_requests, 0);
        assert!(matches!(
            manager.generate("m", "hi", &GenerationParams::greedy()).await,
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            manager.submit_batch_request("m", "hi", &GenerationParams::greedy()),
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            manager.load_model("m", small_model("m.gguf")).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            ResourceManager::new(MockEngine::new(), ManagerConfig::default()),
            Err(Error::Config(_))
        ));
    }
}

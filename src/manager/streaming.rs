//! Streaming generation sessions
//!
//! Each session owns one producer running on a dedicated blocking thread.
//! The producer pushes tokens into a bounded per-session queue and blocks
//! when it is full; consumers pull tokens from caller tasks. Cancellation is
//! cooperative and checked between tokens.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::ModelLease;
use crate::config::GenerationParams;
use crate::engine::{Executor, FinishReason, GeneratedToken, InferenceEngine};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// A token delivered to a streaming consumer
pub type StreamToken = GeneratedToken;

/// Session lifecycle: `Created → Generating → {Finished | Stopped | Errored}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Generating,
    Finished,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Stopped | SessionState::Errored
        )
    }
}

struct SessionStatus {
    state: SessionState,
    error: Option<String>,
    last_activity: Instant,
}

/// One streaming generation
pub struct StreamingSession {
    id: String,
    model_name: String,
    prompt: String,
    params: GenerationParams,
    created_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    tokens_produced: AtomicUsize,
    receiver: tokio::sync::Mutex<mpsc::Receiver<StreamToken>>,
    cancel: CancellationToken,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSession {
    fn new(
        id: String,
        model_name: &str,
        prompt: &str,
        params: GenerationParams,
        receiver: mpsc::Receiver<StreamToken>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            model_name: model_name.to_string(),
            prompt: prompt.to_string(),
            params,
            created_at: Utc::now(),
            status: Mutex::new(SessionStatus {
                state: SessionState::Created,
                error: None,
                last_activity: Instant::now(),
            }),
            tokens_produced: AtomicUsize::new(0),
            receiver: tokio::sync::Mutex::new(receiver),
            cancel,
            producer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.status.lock();
        // Terminal states are final
        if !status.state.is_terminal() {
            status.state = state;
        }
        status.last_activity = Instant::now();
    }

    fn fail(&self, message: String) {
        tracing::warn!("Streaming session {} failed: {}", self.id, message);
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            status.state = SessionState::Errored;
            status.error = Some(message);
        }
        status.last_activity = Instant::now();
    }

    fn touch(&self) {
        self.status.lock().last_activity = Instant::now();
    }

    fn idle_time(&self) -> Duration {
        self.status.lock().last_activity.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status.lock();
        SessionInfo {
            id: self.id.clone(),
            model_name: self.model_name.clone(),
            state: status.state,
            error_message: status.error.clone(),
            tokens_produced: self.tokens_produced.load(Ordering::Relaxed),
            created_at: self.created_at,
            idle_secs: status.last_activity.elapsed().as_secs(),
        }
    }

    /// Wait for the next token
    ///
    /// Returns `Ok(None)` once the queue is drained and the producer is done,
    /// or as soon as the session has been stopped.
    async fn next_token(&self) -> Result<Option<StreamToken>> {
        self.touch();
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let token = {
            let mut receiver = self.receiver.lock().await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                token = receiver.recv() => token,
            }
        };

        if let Some(token) = token {
            self.touch();
            return Ok(Some(token));
        }

        // Channel closed: the producer has recorded its terminal state
        let status = self.status.lock();
        match status.state {
            SessionState::Errored => Err(Error::Session {
                id: self.id.clone(),
                message: status.error.clone().unwrap_or_default(),
            }),
            _ => Ok(None),
        }
    }

    /// Cancel generation and wait for the producer to let go of its context
    async fn stop(&self) {
        self.cancel.cancel();
        // Closing the queue unblocks a producer waiting on a full queue
        self.receiver.lock().await.close();
        let producer = self.producer.lock().take();
        if let Some(handle) = producer {
            if let Err(e) = handle.await {
                tracing::warn!("Producer for session {} ended abnormally: {}", self.id, e);
            }
        }
        self.set_state(SessionState::Stopped);
    }
}

/// Snapshot of a streaming session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub model_name: String,
    pub state: SessionState,
    pub error_message: Option<String>,
    pub tokens_produced: usize,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

/// Table of live streaming sessions
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<StreamingSession>>>,
    queue_capacity: usize,
}

impl SessionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a session and spawn its producer
    pub fn start<E: InferenceEngine>(
        &self,
        engine: Arc<E>,
        lease: ModelLease<E>,
        prompt: &str,
        params: GenerationParams,
        producer: ProducerSettings,
    ) -> String {
        let id = format!("stream-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(StreamingSession::new(
            id.clone(),
            lease.name(),
            prompt,
            params,
            receiver,
            producer.cancel.clone(),
        ));

        let handle = tokio::spawn(run_producer(
            engine,
            lease,
            Arc::clone(&session),
            sender,
            producer,
        ));
        *session.producer.lock() = Some(handle);
        self.sessions.lock().insert(id.clone(), session);

        tracing::debug!("Started streaming session {}", id);
        id
    }

    fn get(&self, id: &str) -> Result<Arc<StreamingSession>> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(id))
    }

    /// Next token of a session, blocking until one is available
    ///
    /// A session that has been drained after finishing or failing is
    /// removed; its error (if any) is reported once.
    pub async fn next_token(&self, id: &str) -> Result<Option<StreamToken>> {
        // The table lock is not held while waiting
        let session = self.get(id)?;
        let next = session.next_token().await;

        if matches!(next, Ok(None) | Err(_)) && session.state().is_terminal() && !session.is_stopped()
        {
            self.sessions.lock().remove(id);
            tracing::debug!("Streaming session {} drained", id);
        }
        next
    }

    /// Stop a session; no tokens are delivered once this returns
    pub async fn stop(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| Error::session_not_found(id))?;
        session.stop().await;
        tracing::debug!("Stopped streaming session {}", id);
        Ok(())
    }

    /// Stop every session (shutdown path)
    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    /// Remove terminal sessions idle longer than `timeout`
    ///
    /// Sessions that are still generating are never removed.
    pub fn cleanup_expired(&self, timeout: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !(s.state().is_terminal() && s.idle_time() >= timeout));
        before - sessions.len()
    }

    pub fn info(&self, id: &str) -> Result<SessionInfo> {
        self.get(id).map(|s| s.info())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions still producing tokens
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }
}

/// Limits and signals a producer runs with
pub struct ProducerSettings {
    pub acquire_timeout: Duration,
    pub cancel: CancellationToken,
    pub metrics: Arc<Metrics>,
}

async fn run_producer<E: InferenceEngine>(
    engine: Arc<E>,
    lease: ModelLease<E>,
    session: Arc<StreamingSession>,
    sender: mpsc::Sender<StreamToken>,
    settings: ProducerSettings,
) {
    session.set_state(SessionState::Generating);
    let started = Instant::now();

    let pool = Arc::clone(lease.pool());
    let context = tokio::select! {
        _ = settings.cancel.cancelled() => {
            session.set_state(SessionState::Stopped);
            return;
        }
        context = pool.acquire(settings.acquire_timeout) => context,
    };
    let mut context = match context {
        Ok(context) => context,
        Err(e) => {
            session.fail(format!("failed to get context for streaming: {}", e));
            return;
        }
    };

    let model = lease.handle();
    let worker_session = Arc::clone(&session);
    let worker_sender = sender.clone();
    let cancel = settings.cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let executor = Executor::new(&*engine, &*model);
        let session = worker_session;
        let result = executor.generate(
            context.context_mut(),
            &session.prompt,
            &session.params,
            |token| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                if worker_sender.blocking_send(token.clone()).is_err() {
                    return ControlFlow::Break(());
                }
                session.tokens_produced.fetch_add(1, Ordering::Relaxed);
                ControlFlow::Continue(())
            },
        );
        // Context and lease go back before the session reports completion
        drop(context);
        drop(lease);
        result
    })
    .await;

    match outcome {
        Ok(Ok(generation)) => {
            // Only tokens the consumer can receive count
            let delivered = session.tokens_produced.load(Ordering::Relaxed);
            settings.metrics.record_request(delivered, started.elapsed());
            if generation.finish_reason == FinishReason::Cancelled || settings.cancel.is_cancelled()
            {
                session.set_state(SessionState::Stopped);
            } else {
                session.set_state(SessionState::Finished);
            }
        }
        Ok(Err(e)) => session.fail(format!("{:#}", e)),
        Err(e) => session.fail(format!("generation thread failed: {}", e)),
    }

    // Dropping the last sender lets the consumer observe the terminal state
    drop(sender);
}

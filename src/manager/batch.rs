//! Batch request queue
//!
//! A bounded FIFO drained by exactly one worker task, so batch requests run
//! strictly one at a time in submission order. Results are kept by id until
//! they expire or the retention bound pushes them out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::GenerationParams;
use crate::error::{Error, Result};

/// A queued generation job
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub request_id: String,
    pub model_name: String,
    pub prompt: String,
    pub params: GenerationParams,
    pub submitted_at: DateTime<Utc>,
}

/// Terminal outcome of a batch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub request_id: String,
    pub success: bool,
    /// Generated text (empty on failure)
    pub response: String,
    pub error_message: Option<String>,
    pub tokens_generated: usize,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time_ms: u64,
}

impl BatchResult {
    pub(crate) fn completed(
        request: &BatchRequest,
        outcome: Result<(String, usize)>,
        processing_time: Duration,
    ) -> Self {
        let (success, response, error_message, tokens_generated) = match outcome {
            Ok((text, tokens)) => (true, text, None, tokens),
            Err(e) => (false, String::new(), Some(e.to_string()), 0),
        };
        Self {
            request_id: request.request_id.clone(),
            success,
            response,
            error_message,
            tokens_generated,
            submitted_at: request.submitted_at,
            completed_at: Utc::now(),
            processing_time_ms: processing_time.as_millis() as u64,
        }
    }
}

/// Where a batch request currently is
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatus {
    Pending,
    Completed(BatchResult),
}

struct StoredResult {
    result: BatchResult,
    stored_at: Instant,
}

#[derive(Default)]
struct ResultStore {
    results: HashMap<String, StoredResult>,
    /// Completion order, oldest first
    order: VecDeque<String>,
}

/// Submission side of the batch queue plus the result store
pub struct BatchQueue {
    sender: mpsc::Sender<BatchRequest>,
    capacity: usize,
    max_results: usize,
    pending: Mutex<HashSet<String>>,
    store: Mutex<ResultStore>,
}

impl BatchQueue {
    /// Create the queue and the receiver its worker drains
    pub fn new(capacity: usize, max_results: usize) -> (Self, mpsc::Receiver<BatchRequest>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Self {
            sender,
            capacity,
            max_results,
            pending: Mutex::new(HashSet::new()),
            store: Mutex::new(ResultStore::default()),
        };
        (queue, receiver)
    }

    /// Enqueue a request and return its id without waiting
    pub fn submit(&self, model_name: &str, prompt: &str, params: GenerationParams) -> Result<String> {
        let request_id = format!("batch-{}", Uuid::new_v4());
        let request = BatchRequest {
            request_id: request_id.clone(),
            model_name: model_name.to_string(),
            prompt: prompt.to_string(),
            params,
            submitted_at: Utc::now(),
        };

        // Marked pending first so the worker can never complete an id that
        // is not yet known
        self.pending.lock().insert(request_id.clone());
        match self.sender.try_send(request) {
            Ok(()) => {
                tracing::debug!("Queued batch request {} for model {}", request_id, model_name);
                Ok(request_id)
            }
            Err(e) => {
                self.pending.lock().remove(&request_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!("Batch queue full, rejecting request for {}", model_name);
                        Err(Error::QueueFull(self.capacity))
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(Error::ShuttingDown),
                }
            }
        }
    }

    /// Store the terminal result for a request
    pub fn complete(&self, result: BatchResult) {
        let id = result.request_id.clone();
        let mut store = self.store.lock();
        store.order.push_back(id.clone());
        store.results.insert(
            id.clone(),
            StoredResult {
                result,
                stored_at: Instant::now(),
            },
        );
        while store.results.len() > self.max_results {
            match store.order.pop_front() {
                Some(oldest) => {
                    store.results.remove(&oldest);
                }
                None => break,
            }
        }
        drop(store);
        self.pending.lock().remove(&id);
    }

    /// Terminal result for `id`, if the worker has finished it
    pub fn result(&self, id: &str) -> Option<BatchResult> {
        self.store.lock().results.get(id).map(|s| s.result.clone())
    }

    pub fn status(&self, id: &str) -> Option<BatchStatus> {
        if let Some(result) = self.result(id) {
            return Some(BatchStatus::Completed(result));
        }
        if self.pending.lock().contains(id) {
            return Some(BatchStatus::Pending);
        }
        None
    }

    /// Every retained result, oldest first
    pub fn all_results(&self) -> Vec<BatchResult> {
        let store = self.store.lock();
        store
            .order
            .iter()
            .filter_map(|id| store.results.get(id))
            .map(|s| s.result.clone())
            .collect()
    }

    /// Drop results stored longer than `ttl`; returns how many were dropped
    pub fn expire_results(&self, ttl: Duration) -> usize {
        let mut store = self.store.lock();
        let ResultStore { results, order } = &mut *store;
        let before = results.len();
        results.retain(|_, s| s.stored_at.elapsed() < ttl);
        order.retain(|id| results.contains_key(id));
        before - results.len()
    }

    /// Requests submitted but not yet completed
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn completed_count(&self) -> usize {
        self.store.lock().results.len()
    }
}

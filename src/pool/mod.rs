//! Per-model context pool
//!
//! A `ContextPool` owns every execution context created for one loaded
//! model. Contexts are handed out as [`PooledContext`] guards which return
//! them to the pool when dropped, on every exit path. The pool lock is only
//! held for bookkeeping; context creation and destruction happen outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::ModelConfig;
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// One pooled context plus its bookkeeping
struct PoolEntry<C> {
    id: u64,
    context: C,
    last_used: Instant,
    usage_count: u64,
}

struct PoolState<C> {
    /// Idle entries, most recently released at the back
    available: VecDeque<PoolEntry<C>>,
    /// Checked-out entry ids with their usage counts
    checked_out: HashMap<u64, u64>,
    /// Slots reserved for contexts currently being created
    creating: usize,
    next_id: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn size(&self) -> usize {
        self.available.len() + self.checked_out.len() + self.creating
    }
}

enum Checkout<C> {
    Ready(PoolEntry<C>),
    Create(u64),
    Full,
}

/// Bounded set of reusable contexts for one model
pub struct ContextPool<E: InferenceEngine> {
    model_name: String,
    engine: Arc<E>,
    model: Arc<E::Model>,
    config: ModelConfig,
    max_size: usize,
    state: Mutex<PoolState<E::Context>>,
    released: Notify,
    metrics: Arc<Metrics>,
}

impl<E: InferenceEngine> ContextPool<E> {
    pub fn new(
        model_name: impl Into<String>,
        engine: Arc<E>,
        model: Arc<E::Model>,
        config: ModelConfig,
        max_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            engine,
            model,
            config,
            max_size,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                checked_out: HashMap::new(),
                creating: 0,
                next_id: 0,
                closed: false,
            }),
            released: Notify::new(),
            metrics,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Check out a context
    ///
    /// Reuses an idle context if there is one, creates a new one while the
    /// pool is below `max_size`, and otherwise waits up to `timeout` for a
    /// release before failing with `PoolExhausted`.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledContext<E>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wakeups before looking, so a release between the
            // check and the wait is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout()? {
                Checkout::Ready(entry) => {
                    tracing::debug!(
                        "Reusing context {} for model {} (use #{})",
                        entry.id,
                        self.model_name,
                        entry.usage_count
                    );
                    return Ok(PooledContext::new(Arc::clone(self), entry));
                }
                Checkout::Create(id) => {
                    let entry = self.create_entry(id).await?;
                    return Ok(PooledContext::new(Arc::clone(self), entry));
                }
                Checkout::Full => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::warn!(
                            "Context pool for model {} exhausted after {:?}",
                            self.model_name,
                            timeout
                        );
                        return Err(Error::PoolExhausted {
                            model: self.model_name.clone(),
                            max_size: self.max_size,
                        });
                    }
                }
            }
        }
    }

    fn try_checkout(&self) -> Result<Checkout<E::Context>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::model_not_found(&self.model_name));
        }

        if let Some(mut entry) = state.available.pop_back() {
            entry.usage_count += 1;
            entry.last_used = Instant::now();
            state.checked_out.insert(entry.id, entry.usage_count);
            drop(state);
            self.metrics.context_checked_out();
            return Ok(Checkout::Ready(entry));
        }

        if state.size() < self.max_size {
            state.creating += 1;
            let id = state.next_id;
            state.next_id += 1;
            return Ok(Checkout::Create(id));
        }

        Ok(Checkout::Full)
    }

    /// Create a context for a reserved slot; the slot is given back if
    /// creation fails or the caller goes away
    async fn create_entry(&self, id: u64) -> Result<PoolEntry<E::Context>> {
        let mut slot = CreationSlot {
            pool: self,
            armed: true,
        };

        let engine = Arc::clone(&self.engine);
        let model = Arc::clone(&self.model);
        let config = self.config.clone();
        let context = tokio::task::spawn_blocking(move || engine.new_context(&model, &config))
            .await
            .map_err(|e| anyhow::anyhow!("context creation task failed: {}", e))??;

        let mut state = self.state.lock();
        slot.armed = false;
        state.creating -= 1;
        if state.closed {
            drop(state);
            drop(context);
            self.released.notify_one();
            return Err(Error::model_not_found(&self.model_name));
        }
        state.checked_out.insert(id, 1);
        let size = state.size();
        drop(state);

        self.metrics.contexts_created(1);
        self.metrics.context_checked_out();
        tracing::debug!(
            "Created context {} for model {} (pool size {}/{})",
            id,
            self.model_name,
            size,
            self.max_size
        );

        Ok(PoolEntry {
            id,
            context,
            last_used: Instant::now(),
            usage_count: 1,
        })
    }

    fn release(&self, mut entry: PoolEntry<E::Context>) {
        entry.last_used = Instant::now();

        let mut state = self.state.lock();
        state.checked_out.remove(&entry.id);
        let discarded = if state.closed {
            Some(entry)
        } else {
            state.available.push_back(entry);
            None
        };
        drop(state);

        self.metrics.context_returned();
        if let Some(entry) = discarded {
            self.metrics.contexts_destroyed(1);
            drop(entry);
        }
        self.released.notify_one();
    }

    /// Destroy idle contexts unused for longer than `ttl`
    ///
    /// Checked-out contexts are never touched. Returns the number destroyed.
    pub fn cleanup_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.available.len());
            while let Some(entry) = state.available.pop_front() {
                if now.duration_since(entry.last_used) >= ttl {
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.available = kept;
        }

        let count = expired.len();
        if count > 0 {
            drop(expired);
            self.metrics.contexts_destroyed(count);
            self.released.notify_one();
            tracing::debug!(
                "Evicted {} idle context(s) for model {}",
                count,
                self.model_name
            );
        }
        count
    }

    /// Close the pool: destroy idle contexts now, checked-out ones on release
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.available.drain(..).collect()
        };

        let count = drained.len();
        drop(drained);
        self.metrics.contexts_destroyed(count);
        self.released.notify_waiters();
    }

    /// Number of contexts owned by the pool (idle, checked out or being created)
    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    /// Number of idle contexts
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Number of checked-out contexts
    pub fn in_use(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            model: self.model_name.clone(),
            size: state.size(),
            available: state.available.len(),
            in_use: state.checked_out.len(),
            max_size: self.max_size,
        }
    }

    /// Enumerate every context the pool owns
    pub fn entries(&self) -> Vec<ContextEntryInfo> {
        let state = self.state.lock();
        let now = Instant::now();

        let mut entries: Vec<ContextEntryInfo> = state
            .available
            .iter()
            .map(|entry| ContextEntryInfo {
                id: entry.id,
                in_use: false,
                usage_count: entry.usage_count,
                idle_for: Some(now.duration_since(entry.last_used)),
            })
            .chain(state.checked_out.iter().map(|(&id, &usage_count)| ContextEntryInfo {
                id,
                in_use: true,
                usage_count,
                idle_for: None,
            }))
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}

struct CreationSlot<'a, E: InferenceEngine> {
    pool: &'a ContextPool<E>,
    armed: bool,
}

impl<E: InferenceEngine> Drop for CreationSlot<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().creating -= 1;
            self.pool.released.notify_one();
        }
    }
}

/// Scoped checkout of a pooled context
///
/// The context goes back to its pool when the guard is dropped.
pub struct PooledContext<E: InferenceEngine> {
    pool: Arc<ContextPool<E>>,
    entry: Option<PoolEntry<E::Context>>,
}

impl<E: InferenceEngine> PooledContext<E> {
    fn new(pool: Arc<ContextPool<E>>, entry: PoolEntry<E::Context>) -> Self {
        Self {
            pool,
            entry: Some(entry),
        }
    }

    fn entry_mut(&mut self) -> &mut PoolEntry<E::Context> {
        // Only `drop` takes the entry
        self.entry
            .as_mut()
            .expect("pooled context accessed after release")
    }

    /// Pool-local id of the checked-out context
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map(|e| e.id).unwrap_or_default()
    }

    pub fn context_mut(&mut self) -> &mut E::Context {
        &mut self.entry_mut().context
    }
}

impl<E: InferenceEngine> Drop for PooledContext<E> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

/// Pool occupancy for one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub model: String,
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub max_size: usize,
}

/// Enumeration entry for one pooled context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntryInfo {
    pub id: u64,
    pub in_use: bool,
    pub usage_count: u64,
    /// Time since release (None while checked out)
    pub idle_for: Option<Duration>,
}

//! Periodic reclamation of idle resources

use std::sync::Arc;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::engine::InferenceEngine;

/// What one reaper sweep reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaperReport {
    pub contexts_evicted: usize,
    pub sessions_removed: usize,
    pub batch_results_expired: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl<E: InferenceEngine> Inner<E> {
    /// One full sweep: idle contexts, finished sessions, old batch results
    pub(super) fn reap(&self) -> ReaperReport {
        ReaperReport {
            contexts_evicted: self
                .registry
                .cleanup_expired_contexts(self.config.context_ttl()),
            sessions_removed: self
                .sessions
                .cleanup_expired(self.config.session_idle_timeout()),
            batch_results_expired: self.batch.expire_results(self.config.batch_result_ttl()),
        }
    }
}

/// Reaper loop; runs until `shutdown` is cancelled
pub(super) async fn run<E: InferenceEngine>(inner: Arc<Inner<E>>, shutdown: CancellationToken) {
    let period = inner.config.reaper_interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!("Reaper started (interval {:?})", period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let report = inner.reap();
                if !report.is_empty() {
                    tracing::info!(
                        "Reaper evicted {} context(s), {} session(s), {} batch result(s)",
                        report.contexts_evicted,
                        report.sessions_removed,
                        report.batch_results_expired
                    );
                }
            }
        }
    }
    tracing::debug!("Reaper stopped");
}

//! Scripted engine for tests
//!
//! Emits one token `tok{i} ` per prompt byte, then end-of-sequence. Prompts
//! containing `LONG` run until `max_tokens`; prompts containing `FAIL` error
//! after the first token.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use super::{GeneratedToken, InferenceEngine};
use crate::config::{GenerationParams, ModelConfig};

#[derive(Default)]
pub(crate) struct MockStats {
    pub init_calls: AtomicUsize,
    pub loads: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub contexts_dropped: AtomicUsize,
}

pub(crate) struct MockEngine {
    pub stats: Arc<MockStats>,
    weight_bytes: u64,
    token_delay: Duration,
    fail_init: AtomicBool,
}

pub(crate) struct MockModel;

pub(crate) struct MockContext {
    stats: Arc<MockStats>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.stats.contexts_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            weight_bytes: 1024 * 1024,
            token_delay: Duration::ZERO,
            fail_init: AtomicBool::new(false),
        }
    }

    pub fn with_weight_bytes(mut self, bytes: u64) -> Self {
        self.weight_bytes = bytes;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_init_failure(self) -> Self {
        self.fail_init.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_init_failure(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn live_contexts(&self) -> usize {
        self.stats.contexts_created.load(Ordering::SeqCst)
            - self.stats.contexts_dropped.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for MockEngine {
    type Model = MockModel;
    type Context = MockContext;

    fn init_backend(&self) -> Result<()> {
        self.stats.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            bail!("no compute backend available");
        }
        Ok(())
    }

    fn estimate_weight_bytes(&self, _config: &ModelConfig) -> crate::Result<u64> {
        Ok(self.weight_bytes)
    }

    fn load(&self, path: &Path, _config: &ModelConfig) -> Result<MockModel> {
        let path = path.to_string_lossy().to_string();
        if path.contains("corrupt") {
            return Err(anyhow!("failed to load model from {}", path));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(MockModel)
    }

    fn new_context(&self, _model: &MockModel, _config: &ModelConfig) -> Result<MockContext> {
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext {
            stats: Arc::clone(&self.stats),
        })
    }

    fn generate(
        &self,
        _model: &MockModel,
        _context: &mut MockContext,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(GeneratedToken) -> ControlFlow<()>,
    ) -> Result<()> {
        let budget = if prompt.contains("LONG") {
            params.max_tokens
        } else {
            prompt.len().min(params.max_tokens)
        };

        for i in 0..budget {
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            let token = GeneratedToken {
                token_id: i as u32,
                text: format!("tok{} ", i),
                logprob: Some(-0.5),
            };
            if on_token(token).is_break() {
                return Ok(());
            }
            if prompt.contains("FAIL") {
                bail!("decode failed at token {}", i);
            }
        }
        Ok(())
    }

    fn embed(&self, _model: &MockModel, _context: &mut MockContext, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0, 2.0, 3.0])
    }
}

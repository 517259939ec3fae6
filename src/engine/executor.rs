//! Generation executor
//!
//! Runs one generation or embedding on a checked-out context, applying the
//! token budget and stop sequences on top of whatever the engine does.

use std::collections::VecDeque;
use std::ops::ControlFlow;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{GeneratedToken, InferenceEngine};
use crate::config::GenerationParams;

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The engine reported end of sequence
    EndOfSequence,
    /// `max_tokens` reached
    Length,
    /// Output ended with one of the stop sequences
    StopSequence,
    /// The token sink asked to stop (cancellation, closed consumer)
    Cancelled,
}

/// Result of a completed generation
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Generated text with any trailing stop sequence removed
    pub text: String,
    /// Number of tokens the engine produced
    pub tokens: usize,
    pub finish_reason: FinishReason,
}

/// Inference executor
///
/// Borrows the engine and a loaded model; the context is passed per call
/// because it is checked out of the pool for exactly one operation.
pub struct Executor<'a, E: InferenceEngine> {
    engine: &'a E,
    model: &'a E::Model,
}

impl<'a, E: InferenceEngine> Executor<'a, E> {
    pub fn new(engine: &'a E, model: &'a E::Model) -> Self {
        Self { engine, model }
    }

    /// Generate tokens, forwarding each accepted token to `sink`
    ///
    /// Output that could still be the start of a stop sequence is held back
    /// until it either completes the sequence (and is dropped) or stops
    /// matching. A stop sequence may end anywhere inside a token; the token
    /// straddling the cut is forwarded truncated, so the forwarded text always
    /// equals `Generation::text`. The sink can end the generation early by
    /// returning `ControlFlow::Break`.
    pub fn generate<F>(
        &self,
        context: &mut E::Context,
        prompt: &str,
        params: &GenerationParams,
        sink: F,
    ) -> Result<Generation>
    where
        F: FnMut(&GeneratedToken) -> ControlFlow<()>,
    {
        self.engine.reset_context(context);

        let mut filter = StopFilter::new(&params.stop_sequences, sink);
        let mut tokens = 0usize;
        let mut finish_reason = None;

        let mut on_token = |token: GeneratedToken| {
            tokens += 1;

            if let ControlFlow::Break(reason) = filter.push(token) {
                finish_reason = Some(reason);
                return ControlFlow::Break(());
            }

            if tokens >= params.max_tokens {
                finish_reason = Some(FinishReason::Length);
                return ControlFlow::Break(());
            }

            ControlFlow::Continue(())
        };

        self.engine
            .generate(self.model, context, prompt, params, &mut on_token)?;

        let mut finish_reason = finish_reason.unwrap_or(FinishReason::EndOfSequence);
        if matches!(
            finish_reason,
            FinishReason::EndOfSequence | FinishReason::Length
        ) && filter.flush_all().is_break()
        {
            finish_reason = FinishReason::Cancelled;
        }

        tracing::debug!(
            "Generation finished: {} tokens ({:?})",
            tokens,
            finish_reason
        );

        Ok(Generation {
            text: filter.text,
            tokens,
            finish_reason,
        })
    }

    /// Generate text and return the complete result
    pub fn generate_text(
        &self,
        context: &mut E::Context,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation> {
        self.generate(context, prompt, params, |_| ControlFlow::Continue(()))
    }

    /// Compute an embedding vector
    pub fn embed(&self, context: &mut E::Context, text: &str) -> Result<Vec<f32>> {
        self.engine.reset_context(context);
        let embedding = self.engine.embed(self.model, context, text)?;
        if embedding.is_empty() {
            anyhow::bail!("engine returned an empty embedding");
        }
        Ok(embedding)
    }
}

/// Stop-sequence detection between the engine and the token sink
struct StopFilter<'p, F> {
    stops: &'p [String],
    longest_stop: usize,
    /// Accepted text, cut at the stop sequence once one is found
    text: String,
    /// Tokens not yet forwarded, with the offset in `text` where each ends
    pending: VecDeque<(GeneratedToken, usize)>,
    sink: F,
}

impl<'p, F> StopFilter<'p, F>
where
    F: FnMut(&GeneratedToken) -> ControlFlow<()>,
{
    fn new(stops: &'p [String], sink: F) -> Self {
        Self {
            stops,
            longest_stop: stops.iter().map(String::len).max().unwrap_or(0),
            text: String::new(),
            pending: VecDeque::new(),
            sink,
        }
    }

    /// Accept one token; breaks with the reason generation has to end
    fn push(&mut self, token: GeneratedToken) -> ControlFlow<FinishReason> {
        // A new match must end inside the new token, so only the tail that
        // could still belong to it is searched
        let scan_from = floor_char_boundary(
            &self.text,
            self.text.len().saturating_sub(self.longest_stop.saturating_sub(1)),
        );
        self.text.push_str(&token.text);
        self.pending.push_back((token, self.text.len()));

        if let Some(cut) = self.find_stop(scan_from) {
            self.text.truncate(cut);
            if self.flush_until(cut).is_break() {
                return ControlFlow::Break(FinishReason::Cancelled);
            }
            self.forward_partial(cut);
            return ControlFlow::Break(FinishReason::StopSequence);
        }

        let safe = self.text.len() - self.held_len();
        if self.flush_until(safe).is_break() {
            return ControlFlow::Break(FinishReason::Cancelled);
        }
        ControlFlow::Continue(())
    }

    /// Earliest stop-sequence match starting at or after `from`
    fn find_stop(&self, from: usize) -> Option<usize> {
        let tail = &self.text[from..];
        self.stops
            .iter()
            .filter_map(|stop| tail.find(stop.as_str()))
            .min()
            .map(|pos| from + pos)
    }

    /// Length of the longest text suffix that is a proper prefix of a stop sequence
    fn held_len(&self) -> usize {
        self.stops
            .iter()
            .flat_map(|stop| {
                (1..stop.len())
                    .rev()
                    .filter(|&k| stop.is_char_boundary(k))
                    .find(|&k| self.text.ends_with(&stop[..k]))
            })
            .max()
            .unwrap_or(0)
    }

    /// Forward pending tokens that end at or before `limit`
    fn flush_until(&mut self, limit: usize) -> ControlFlow<()> {
        while let Some((_, end)) = self.pending.front() {
            if *end > limit {
                break;
            }
            if let Some((token, _)) = self.pending.pop_front() {
                if (self.sink)(&token).is_break() {
                    self.pending.clear();
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Forward the part of the token straddling `cut` that precedes it
    fn forward_partial(&mut self, cut: usize) {
        if let Some((token, end)) = self.pending.pop_front() {
            let start = end - token.text.len();
            if cut > start {
                let partial = GeneratedToken {
                    text: token.text[..cut - start].to_string(),
                    ..token
                };
                // Generation ends here either way
                let _ = (self.sink)(&partial);
            }
        }
        self.pending.clear();
    }

    fn flush_all(&mut self) -> ControlFlow<()> {
        self.flush_until(usize::MAX)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::engine::mock::MockEngine;

    fn setup() -> (MockEngine, <MockEngine as InferenceEngine>::Model) {
        let engine = MockEngine::new();
        let model = engine
            .load(std::path::Path::new("mock.gguf"), &ModelConfig::new("mock.gguf"))
            .unwrap();
        (engine, model)
    }

    #[test]
    fn test_generate_text_respects_max_tokens() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        let params = GenerationParams::greedy().with_max_tokens(3);
        let generation = executor.generate_text(&mut ctx, "hello", &params).unwrap();

        assert_eq!(generation.tokens, 3);
        assert_eq!(generation.finish_reason, FinishReason::Length);
        assert_eq!(generation.text, "tok0 tok1 tok2 ");
    }

    #[test]
    fn test_stop_sequence_is_trimmed() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        let params = GenerationParams::greedy().with_stop("tok2 ");
        let mut forwarded = Vec::new();
        let generation = executor
            .generate(&mut ctx, "hello", &params, |t| {
                forwarded.push(t.text.clone());
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(generation.text, "tok0 tok1 ");
        assert_eq!(generation.finish_reason, FinishReason::StopSequence);
        assert_eq!(forwarded, vec!["tok0 ", "tok1 "]);
    }

    fn collect(
        executor: &Executor<'_, MockEngine>,
        ctx: &mut <MockEngine as InferenceEngine>::Context,
        prompt: &str,
        params: &GenerationParams,
    ) -> (Generation, Vec<String>) {
        let mut forwarded = Vec::new();
        let generation = executor
            .generate(ctx, prompt, params, |t| {
                forwarded.push(t.text.clone());
                ControlFlow::Continue(())
            })
            .unwrap();
        (generation, forwarded)
    }

    #[test]
    fn test_stop_sequence_ending_inside_a_token() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        // "tok2" ends one byte before the end of the "tok2 " token
        let params = GenerationParams::greedy().with_stop("tok2");
        let generation = executor.generate_text(&mut ctx, "abcdef", &params).unwrap();
        assert_eq!(generation.text, "tok0 tok1 ");
        assert_eq!(generation.finish_reason, FinishReason::StopSequence);

        // Cut in the middle of a token: the head of that token is still emitted
        let params = GenerationParams::greedy().with_stop("1 to");
        let (generation, forwarded) = collect(&executor, &mut ctx, "hello", &params);
        assert_eq!(generation.text, "tok0 tok");
        assert_eq!(forwarded, vec!["tok0 ", "tok"]);
        assert_eq!(forwarded.concat(), generation.text);
    }

    #[test]
    fn test_stop_prefix_is_held_back() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        let params = GenerationParams::greedy().with_stop("tok1 tok2 ");
        let (generation, forwarded) = collect(&executor, &mut ctx, "hello", &params);
        assert_eq!(generation.text, "tok0 ");
        assert_eq!(generation.tokens, 3);
        assert_eq!(forwarded, vec!["tok0 "]);
    }

    #[test]
    fn test_held_tokens_flushed_when_stop_does_not_complete() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        // "tok1 " is held as a possible start, then released by "tok2 "
        let params = GenerationParams::greedy().with_stop("tok1 tokX");
        let (generation, forwarded) = collect(&executor, &mut ctx, "abc", &params);
        assert_eq!(forwarded, vec!["tok0 ", "tok1 ", "tok2 "]);
        assert_eq!(generation.text, "tok0 tok1 tok2 ");
        assert_eq!(generation.finish_reason, FinishReason::EndOfSequence);

        // A prefix still held when the budget runs out is flushed too
        let params = GenerationParams::greedy().with_max_tokens(2).with_stop("tok1 tokX");
        let (generation, forwarded) = collect(&executor, &mut ctx, "abc", &params);
        assert_eq!(forwarded, vec!["tok0 ", "tok1 "]);
        assert_eq!(generation.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_sink_break_cancels() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        let generation = executor
            .generate(&mut ctx, "hello", &GenerationParams::greedy(), |_| {
                ControlFlow::Break(())
            })
            .unwrap();

        assert_eq!(generation.tokens, 1);
        assert_eq!(generation.finish_reason, FinishReason::Cancelled);
    }

    #[test]
    fn test_end_of_sequence() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        // The mock emits one token per prompt byte before EOS
        let generation = executor
            .generate_text(&mut ctx, "hi", &GenerationParams::greedy())
            .unwrap();
        assert_eq!(generation.tokens, 2);
        assert_eq!(generation.finish_reason, FinishReason::EndOfSequence);
    }

    #[test]
    fn test_embed() {
        let (engine, model) = setup();
        let mut ctx = engine.new_context(&model, &ModelConfig::new("mock.gguf")).unwrap();
        let executor = Executor::new(&engine, &model);

        let embedding = executor.embed(&mut ctx, "abc").unwrap();
        assert_eq!(embedding.len(), 4);
    }
}

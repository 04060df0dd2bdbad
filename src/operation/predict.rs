//! The prediction loop.
//!
//! Each iteration first evaluates whatever is staged, then either stages the
//! next batch of prompt tokens or samples one new token. A sampled token is
//! staged rather than evaluated immediately, so the token that ends one
//! prediction is folded into the model at the start of the next.

use std::sync::Arc;

use llama_engine::{InferenceContext, LlamaError, TokenId};
use llama_runtime::telemetry::{PredictionOutcome, PredictionTimer, TelemetryHook};
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::error::{Result, SessionError};
use crate::event::{EventChannel, PredictionEvent};
use crate::params::SessionParams;
use crate::queue::{CancelFlag, ContextObserver, ContextSlot, Operation};
use crate::run_state::RunState;

/// Headroom the native context needs beyond the prompt itself.
const CONTEXT_HEADROOM: usize = 4;

/// How a prediction that did not fail came to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    EndOfSequence,
    Antiprompt,
    TokenLimit,
    Cancelled,
}

pub(crate) struct PredictOperation {
    prompt: String,
    events: EventChannel<PredictionEvent>,
    telemetry: Arc<dyn TelemetryHook>,
    observer: Option<ContextObserver>,
}

impl PredictOperation {
    pub(crate) fn new(
        prompt: String,
        events: EventChannel<PredictionEvent>,
        telemetry: Arc<dyn TelemetryHook>,
        observer: Option<ContextObserver>,
    ) -> Self {
        Self {
            prompt,
            events,
            telemetry,
            observer,
        }
    }

    fn predict(&mut self, context: &mut SessionContext, cancel: &CancelFlag) -> Result<Stop> {
        let context_id = context.id();
        let (params, native, state) = context.parts_mut();

        let input = tokenize_turn(params, native, state, &self.prompt)?;
        let limit = native.context_size().saturating_sub(CONTEXT_HEADROOM);
        if input.len() > limit {
            return Err(SessionError::PromptTooLong(format!(
                "{} tokens exceed the {limit} token limit",
                input.len()
            )));
        }

        state.compact_input();
        state.pending_input_tokens.extend_from_slice(&input);
        state.generated_tokens.clear();
        state.is_antiprompt_active = false;
        state.tokens_remaining = params.token_limit;

        info!(
            context = %context_id,
            prompt_tokens = input.len(),
            token_limit = params.token_limit,
            "prediction started"
        );
        self.events.emit(PredictionEvent::Started);

        let mut timer = PredictionTimer::new(self.telemetry.clone());
        let result = self.generate(params, native, state, cancel, &mut timer, input.len());
        let outcome = match &result {
            Ok(Stop::Cancelled) => PredictionOutcome::Cancelled,
            Ok(_) => PredictionOutcome::Completed,
            Err(_) => PredictionOutcome::Failed,
        };
        let metrics = timer.finish(outcome);
        debug!(
            context = %context_id,
            generated = metrics.generated_tokens,
            tokens_per_sec = metrics.tokens_per_sec,
            "prediction finished"
        );
        result
    }

    fn generate(
        &mut self,
        params: &SessionParams,
        native: &mut dyn InferenceContext,
        state: &mut RunState,
        cancel: &CancelFlag,
        timer: &mut PredictionTimer,
        prompt_tokens: usize,
    ) -> Result<Stop> {
        let mut prompt_processed = false;
        let stage_limit = staging_limit(params, native.context_size());

        loop {
            if cancel.is_cancelled() {
                return Ok(Stop::Cancelled);
            }

            if !state.unevaluated_tokens.is_empty() {
                evaluate_staged(params, native, state)?;
            }

            if !state.input_exhausted() {
                state.stage_input(stage_limit);
                continue;
            }

            if !prompt_processed {
                timer.mark_prompt_processed(prompt_tokens);
                prompt_processed = true;
            }

            if state.is_budget_bounded() && state.tokens_remaining == 0 {
                return Ok(Stop::TokenLimit);
            }

            let token = native.sample(state.recent_tokens.as_slice(), &params.sampling);
            if token == native.eos_token() {
                return Ok(Stop::EndOfSequence);
            }

            state.record_generated(token);
            timer.mark_token();
            self.events
                .emit(PredictionEvent::Token(native.detokenize(token)));

            if let Some(antiprompt) = state.match_antiprompt(native, &params.antiprompts) {
                debug!(antiprompt, "antiprompt reached");
                state.is_antiprompt_active = true;
                return Ok(Stop::Antiprompt);
            }
            if state.is_budget_bounded() && state.tokens_remaining == 0 {
                return Ok(Stop::TokenLimit);
            }
        }
    }
}

impl Operation for PredictOperation {
    fn kind(&self) -> &'static str {
        "predict"
    }

    fn run(mut self: Box<Self>, slot: &mut ContextSlot, cancel: &CancelFlag) {
        let terminal = match slot {
            ContextSlot::Ready(context) => {
                let terminal = match self.predict(context, cancel) {
                    Ok(Stop::Cancelled) => {
                        info!(context = %context.id(), "prediction cancelled");
                        PredictionEvent::Cancelled
                    }
                    Ok(stop) => {
                        debug!(?stop, "prediction completed");
                        PredictionEvent::Completed
                    }
                    Err(err) => {
                        warn!(context = %context.id(), error = %err, "prediction failed");
                        PredictionEvent::Failed(err)
                    }
                };
                if let Some(observer) = &self.observer {
                    observer(&context.snapshot());
                }
                terminal
            }
            ContextSlot::Failed(err) => PredictionEvent::Failed(err.clone()),
            ContextSlot::Empty => {
                PredictionEvent::Failed(SessionError::generation("no session context loaded"))
            }
        };
        self.events.emit(terminal);
    }

    fn abandon(mut self: Box<Self>) {
        self.events.emit(PredictionEvent::Cancelled);
    }
}

/// Tokenize one turn, adding the initial prompt and instruction framing
/// where they apply. BOS goes only on the first sequence a fresh context sees.
fn tokenize_turn(
    params: &SessionParams,
    native: &dyn InferenceContext,
    state: &RunState,
    prompt: &str,
) -> Result<Vec<TokenId>> {
    let fresh = state.is_fresh();
    let mut segments: Vec<&str> = Vec::with_capacity(4);

    if fresh {
        if let Some(initial) = &params.initial_prompt {
            segments.push(initial);
        }
    }
    if params.is_instructional() {
        if let Some(prefix) = &params.prompt_prefix {
            segments.push(prefix);
        }
        segments.push(prompt);
        if let Some(suffix) = &params.prompt_suffix {
            segments.push(suffix);
        }
    } else {
        segments.push(prompt);
    }

    let mut tokens = Vec::new();
    for segment in segments {
        let add_bos = fresh && tokens.is_empty();
        if segment.is_empty() && !add_bos {
            continue;
        }
        let piece = native
            .tokenize(segment, add_bos)
            .map_err(|e| match e {
                LlamaError::Tokenization(detail) => SessionError::PromptTooLong(detail),
                other => SessionError::PromptTooLong(other.to_string()),
            })?;
        tokens.extend(piece);
    }
    Ok(tokens)
}

/// Largest input batch that still fits the window after a context swap.
///
/// A swap leaves `n_keep` positions plus at most half of the rest, so input
/// staged in chunks of half the swappable window always fits behind it.
fn staging_limit(params: &SessionParams, n_ctx: usize) -> usize {
    let n_keep = params.tokens_to_keep.min(n_ctx);
    params.batch_size.min((n_ctx - n_keep) / 2).max(1)
}

/// Evaluate staged tokens in `batch_size` chunks, swapping the context
/// first if they would overflow the window.
fn evaluate_staged(
    params: &SessionParams,
    native: &mut dyn InferenceContext,
    state: &mut RunState,
) -> Result<()> {
    let n_ctx = native.context_size();
    if state.tokens_processed + state.unevaluated_tokens.len() > n_ctx {
        swap_context(params.tokens_to_keep, state);
    }

    let batch = params.batch_size.max(1);
    while !state.unevaluated_tokens.is_empty() {
        let n = state.unevaluated_tokens.len().min(batch);
        native
            .evaluate(
                &state.unevaluated_tokens[..n],
                state.tokens_processed,
                params.thread_count,
            )
            .map_err(SessionError::GenerationFailed)?;
        state.tokens_processed += n;
        state.unevaluated_tokens.drain(..n);
    }
    Ok(())
}

/// Keep the first `n_keep` positions and re-feed the most recent half of
/// the rest ahead of the staged tokens.
fn swap_context(n_keep: usize, state: &mut RunState) {
    let n_keep = n_keep.min(state.tokens_processed);
    let n_left = state.tokens_processed - n_keep;

    let history = state.recent_tokens.to_vec();
    let end = history.len().saturating_sub(state.unevaluated_tokens.len());
    let start = end.saturating_sub(n_left / 2);

    let mut refeed = history[start..end].to_vec();
    debug!(
        n_keep,
        refeed = refeed.len(),
        staged = state.unevaluated_tokens.len(),
        "context window full, swapping"
    );
    refeed.append(&mut state.unevaluated_tokens);
    state.unevaluated_tokens = refeed;
    state.tokens_processed = n_keep;
}

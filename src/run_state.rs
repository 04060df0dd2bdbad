//! Generation progress that persists across predictions on one context.

use std::collections::VecDeque;

use llama_engine::{InferenceContext, TokenId};

/// Fixed-capacity token history that drops the oldest token on overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHistory {
    tokens: VecDeque<TokenId>,
    capacity: usize,
}

impl TokenHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, token: TokenId) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn extend(&mut self, tokens: &[TokenId]) {
        for &token in tokens {
            self.push(token);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TokenId> + ExactSizeIterator + '_ {
        self.tokens.iter()
    }

    /// Oldest-first view, rearranging the buffer if it has wrapped.
    pub fn as_slice(&mut self) -> &[TokenId] {
        self.tokens.make_contiguous()
    }

    /// The most recent `n` tokens, oldest first.
    pub fn tail(&self, n: usize) -> Vec<TokenId> {
        let skip = self.tokens.len().saturating_sub(n);
        self.tokens.iter().skip(skip).copied().collect()
    }

    pub fn to_vec(&self) -> Vec<TokenId> {
        self.tokens.iter().copied().collect()
    }
}

/// Mutable per-context memory of generation progress.
///
/// Only the operation currently holding the context's lane slot reads or
/// writes this; it is never shared between operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// Tokens sampled during the current prediction, in order.
    pub generated_tokens: Vec<TokenId>,
    /// Tokens staged for the next evaluate call. A token sampled at the end
    /// of one prediction stays here and is evaluated at the start of the next.
    pub unevaluated_tokens: Vec<TokenId>,
    /// Tokens already folded into the model state (n_past).
    pub tokens_processed: usize,
    /// Generation budget left; negative means unbounded (n_remain).
    pub tokens_remaining: i32,
    /// Cursor into `pending_input_tokens` (n_consumed).
    pub tokens_consumed_from_input: usize,
    /// Tokenized prompt text awaiting evaluation.
    pub pending_input_tokens: Vec<TokenId>,
    /// History used for penalties, antiprompt matching and context swaps.
    pub recent_tokens: TokenHistory,
    pub is_antiprompt_active: bool,
}

impl RunState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            generated_tokens: Vec::new(),
            unevaluated_tokens: Vec::new(),
            tokens_processed: 0,
            tokens_remaining: 0,
            tokens_consumed_from_input: 0,
            pending_input_tokens: Vec::new(),
            recent_tokens: TokenHistory::with_capacity(history_capacity),
            is_antiprompt_active: false,
        }
    }

    /// True once every pending input token has been staged.
    pub fn input_exhausted(&self) -> bool {
        self.tokens_consumed_from_input >= self.pending_input_tokens.len()
    }

    /// Nothing has been fed to the model yet.
    pub fn is_fresh(&self) -> bool {
        self.tokens_processed == 0
            && self.pending_input_tokens.is_empty()
            && self.unevaluated_tokens.is_empty()
    }

    pub fn is_budget_bounded(&self) -> bool {
        self.tokens_remaining >= 0
    }

    /// Stage up to `batch_size` pending input tokens for evaluation.
    pub fn stage_input(&mut self, batch_size: usize) -> usize {
        let mut staged = 0;
        while !self.input_exhausted() && self.unevaluated_tokens.len() < batch_size {
            let token = self.pending_input_tokens[self.tokens_consumed_from_input];
            self.unevaluated_tokens.push(token);
            self.recent_tokens.push(token);
            self.tokens_consumed_from_input += 1;
            staged += 1;
        }
        staged
    }

    /// Drop input tokens that have already been staged.
    pub fn compact_input(&mut self) {
        let consumed = self.tokens_consumed_from_input.min(self.pending_input_tokens.len());
        self.pending_input_tokens.drain(..consumed);
        self.tokens_consumed_from_input = 0;
    }

    /// Record a freshly sampled token.
    pub fn record_generated(&mut self, token: TokenId) {
        self.generated_tokens.push(token);
        self.unevaluated_tokens.push(token);
        self.recent_tokens.push(token);
        if self.is_budget_bounded() {
            self.tokens_remaining -= 1;
        }
    }

    /// Decode as much of the history's tail as needed to cover `min_chars`.
    pub fn trailing_text(&self, ctx: &dyn InferenceContext, min_chars: usize) -> String {
        let mut pieces = Vec::new();
        let mut len = 0;
        for &token in self.recent_tokens.iter().rev() {
            let piece = ctx.detokenize(token);
            len += piece.len();
            pieces.push(piece);
            if len >= min_chars {
                break;
            }
        }
        pieces.iter().rev().map(String::as_str).collect()
    }

    /// First configured antiprompt that the decoded history ends with.
    pub fn match_antiprompt<'a>(
        &self,
        ctx: &dyn InferenceContext,
        antiprompts: &'a [String],
    ) -> Option<&'a str> {
        let longest = antiprompts.iter().map(String::len).max()?;
        if longest == 0 {
            return None;
        }
        let tail = self.trailing_text(ctx, longest);
        antiprompts
            .iter()
            .find(|a| !a.is_empty() && tail.ends_with(a.as_str()))
            .map(String::as_str)
    }
}

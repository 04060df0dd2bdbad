//! Telemetry hooks for prediction performance measurement.
//!
//! Provides:
//! - [`PredictionMetrics`] — TTFT, tokens/sec and how the prediction ended
//! - [`TelemetryHook`] trait — callback interface for real-time reporting
//! - [`PredictionTimer`] — records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`] — built-in hook implementations

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// How a prediction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for PredictionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionOutcome::Completed => write!(f, "completed"),
            PredictionOutcome::Cancelled => write!(f, "cancelled"),
            PredictionOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate metrics from one prediction.
#[derive(Debug, Clone)]
pub struct PredictionMetrics {
    pub outcome: PredictionOutcome,
    /// Milliseconds from start until the first generated token was ready.
    pub ttft_ms: f64,
    /// Decode throughput, excluding prompt processing.
    pub tokens_per_sec: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_time_ms: f64,
}

/// Callback trait for real-time prediction telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the prompt has been fully evaluated.
    fn on_prompt_processed(&self, _elapsed_ms: f64) {}

    /// Called after each generated token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when the prediction reaches its terminal state.
    fn on_prediction_complete(&self, _metrics: &PredictionMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs each finished prediction through `tracing` and keeps the last report.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<PredictionMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the most recently finished prediction.
    pub fn last_metrics(&self) -> Option<PredictionMetrics> {
        self.last_report
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_prediction_complete(&self, metrics: &PredictionMetrics) {
        tracing::info!(
            outcome = %metrics.outcome,
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            "prediction finished"
        );
        match self.last_report.lock() {
            Ok(mut guard) => *guard = Some(metrics.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(metrics.clone()),
        }
    }
}

/// Records timestamps during a prediction to compute [`PredictionMetrics`].
///
/// Usage:
/// 1. [`PredictionTimer::new`] when the operation starts
/// 2. [`PredictionTimer::mark_prompt_processed`] once input is exhausted
/// 3. [`PredictionTimer::mark_token`] after each generated token
/// 4. [`PredictionTimer::finish`] with the terminal outcome
pub struct PredictionTimer {
    start: Instant,
    prompt_tokens: usize,
    first_token_at: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl PredictionTimer {
    pub fn new(hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            start: Instant::now(),
            prompt_tokens: 0,
            first_token_at: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_prompt_processed(&mut self, prompt_tokens: usize) {
        self.prompt_tokens = prompt_tokens;
        self.hook.on_prompt_processed(self.elapsed_ms());
    }

    pub fn mark_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        self.token_count += 1;
        self.hook.on_token_generated(self.token_count, self.elapsed_ms());
    }

    pub fn finish(self, outcome: PredictionOutcome) -> PredictionMetrics {
        let total_time_ms = self.elapsed_ms();
        let ttft_ms = self
            .first_token_at
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        // The first token is produced by prompt processing, so it is not a decode step.
        let decode_tokens = self.token_count.saturating_sub(1);
        let tokens_per_sec = if decode_time_ms > 0.0 && decode_tokens > 0 {
            decode_tokens as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = PredictionMetrics {
            outcome,
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };

        self.hook.on_prediction_complete(&metrics);
        metrics
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        prompts: AtomicUsize,
        tokens: AtomicUsize,
        completions: AtomicUsize,
    }

    impl TelemetryHook for CountingHook {
        fn on_prompt_processed(&self, _elapsed_ms: f64) {
            self.prompts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {
            self.tokens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_prediction_complete(&self, _metrics: &PredictionMetrics) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn timer_reports_counts_and_outcome() {
        let mut timer = PredictionTimer::new(Arc::new(NoopTelemetry));
        timer.mark_prompt_processed(3);
        timer.mark_token();
        timer.mark_token();

        let metrics = timer.finish(PredictionOutcome::Completed);
        assert_eq!(metrics.outcome, PredictionOutcome::Completed);
        assert_eq!(metrics.prompt_tokens, 3);
        assert_eq!(metrics.generated_tokens, 2);
        assert!(metrics.total_time_ms >= metrics.ttft_ms);
    }

    #[test]
    fn timer_without_tokens_has_zero_ttft() {
        let timer = PredictionTimer::new(Arc::new(NoopTelemetry));
        let metrics = timer.finish(PredictionOutcome::Cancelled);
        assert_eq!(metrics.ttft_ms, 0.0);
        assert_eq!(metrics.tokens_per_sec, 0.0);
        assert_eq!(metrics.generated_tokens, 0);
    }

    #[test]
    fn timer_fires_every_hook() {
        let hook = Arc::new(CountingHook::default());
        let mut timer = PredictionTimer::new(hook.clone());
        timer.mark_prompt_processed(1);
        timer.mark_token();
        timer.mark_token();
        timer.mark_token();
        timer.finish(PredictionOutcome::Failed);

        assert_eq!(hook.prompts.load(Ordering::SeqCst), 1);
        assert_eq!(hook.tokens.load(Ordering::SeqCst), 3);
        assert_eq!(hook.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn log_telemetry_keeps_last_report() {
        let log = LogTelemetry::new();
        assert!(log.last_metrics().is_none());

        let mut timer = PredictionTimer::new(Arc::new(log.clone()));
        timer.mark_token();
        timer.finish(PredictionOutcome::Completed);

        let captured = log.last_metrics().unwrap();
        assert_eq!(captured.generated_tokens, 1);
        assert_eq!(captured.outcome, PredictionOutcome::Completed);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(PredictionOutcome::Cancelled.to_string(), "cancelled");
    }
}

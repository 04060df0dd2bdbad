//! # llama-runtime
//!
//! Runtime support for the llama-session pipeline: telemetry hooks that time
//! each prediction (TTFT, tok/s) and, behind the `mock` feature, a
//! deterministic scripted backend used by the demo CLI and the test suites.

#[cfg(feature = "mock")]
pub mod mock;
pub mod telemetry;

#[cfg(feature = "mock")]
pub use mock::{CallMonitor, MockConfig, MockEngine};
pub use telemetry::{
    LogTelemetry, NoopTelemetry, PredictionMetrics, PredictionOutcome, PredictionTimer,
    TelemetryHook,
};

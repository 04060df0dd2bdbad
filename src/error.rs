//! Error types for the llama-session crate.

use std::path::PathBuf;

use llama_engine::LlamaError;
use thiserror::Error;

/// Failures surfaced by session operations.
///
/// Every backend failure is mapped onto one of these at the operation
/// boundary before it reaches an event channel. Cancellation is not an
/// error; it is reported as its own terminal event.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("failed to load model: {0}")]
    FailedToLoadModel(#[source] LlamaError),

    #[error("failed to apply LoRA adapter: {0}")]
    FailedToApplyLoraAdapter(#[source] LlamaError),

    #[error("failed to quantize model: {0}")]
    FailedToQuantize(#[source] LlamaError),

    #[error("failed to validate model: {0}")]
    FailedToValidateModel(String),

    #[error("prompt is too long: {0}")]
    PromptTooLong(String),

    #[error("generation failed: {0}")]
    GenerationFailed(#[source] LlamaError),

    #[error("invalid session parameters: {0}")]
    InvalidParams(String),

    #[error("model files missing: {}", display_paths(.0))]
    MissingModelFiles(Vec<PathBuf>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session context already loaded; release it first")]
    ContextAlreadyLoaded,

    #[error("cannot wait on the operation lane from inside one of its callbacks")]
    LaneReentry,

    #[error("operation queue closed")]
    QueueClosed,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl SessionError {
    /// A generation failure that did not originate in the backend.
    pub(crate) fn generation(message: impl Into<String>) -> Self {
        SessionError::GenerationFailed(LlamaError::Inference(message.into()))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn source_is_preserved() {
        let err = SessionError::FailedToLoadModel(LlamaError::ModelLoad("bad magic".into()));
        assert!(err.to_string().contains("bad magic"));
        assert!(err.source().is_some());
    }

    #[test]
    fn missing_files_are_listed() {
        let err = SessionError::MissingModelFiles(vec![
            PathBuf::from("7B/params.json"),
            PathBuf::from("tokenizer.model"),
        ]);
        assert_eq!(
            err.to_string(),
            "model files missing: 7B/params.json, tokenizer.model"
        );
    }

    #[test]
    fn prompt_too_long_message() {
        let err = SessionError::PromptTooLong("600 tokens exceed the 508 token limit".into());
        assert_eq!(
            err.to_string(),
            "prompt is too long: 600 tokens exceed the 508 token limit"
        );
    }
}

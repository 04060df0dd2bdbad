//! # llama-engine
//!
//! The "narrow waist" between the session pipeline and a native inference
//! backend. Defines the collaborator traits the pipeline drives (model
//! loading, tokenization, evaluation, sampling) plus the offline model
//! utilities (quantization, metadata inspection). Backends plug in behind
//! these traits without the pipeline knowing which one is running.
//!
//! ## Design Notes
//!
//! ### Exclusive contexts
//! [`InferenceContext`] methods that advance native state take `&mut self`.
//! A context is owned by exactly one session and is only ever touched from
//! that session's operation lane, so backends need no interior locking.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Errors raised by a backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("LoRA adapter failed: {0}")]
    LoraAdapter(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Quantization failed: {0}")]
    Quantization(String),
    #[error("Unsupported by backend: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LlamaError {
    fn from(err: std::io::Error) -> Self {
        LlamaError::Io(err.to_string())
    }
}

/// Everything a backend needs to bring a model into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    pub path: String,
    pub context_size: usize,
    /// `None` lets the backend pick a random seed.
    pub seed: Option<u32>,
    /// Layers offloaded to an accelerator, if the backend has one.
    pub gpu_layers: u32,
    pub f16_memory: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

/// Mirostat sampling variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    Disabled,
    V1,
    V2,
}

/// Sampling knobs handed to [`InferenceContext::sample`] on every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// `0` disables top-k.
    pub top_k: u32,
    pub top_p: f32,
    pub tail_free_z: f32,
    pub typical_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    /// How many of the most recent tokens the penalties look at.
    pub penalty_window: usize,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: MirostatMode,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_newline: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            tail_free_z: 1.0,
            typical_p: 1.0,
            temperature: 0.8,
            repeat_penalty: 1.1,
            penalty_window: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: MirostatMode::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
        }
    }
}

impl SamplingConfig {
    /// The slice of `recent` that repetition penalties apply to.
    pub fn penalty_slice<'a>(&self, recent: &'a [TokenId]) -> &'a [TokenId] {
        let start = recent.len().saturating_sub(self.penalty_window);
        &recent[start..]
    }
}

/// Parameter-count class of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Unknown,
    Size7B,
    Size13B,
    Size30B,
    Size65B,
}

impl ModelType {
    /// Parameter count in billions, `None` for [`ModelType::Unknown`].
    pub fn parameter_count_billions(&self) -> Option<u32> {
        match self {
            ModelType::Unknown => None,
            ModelType::Size7B => Some(7),
            ModelType::Size13B => Some(13),
            ModelType::Size30B => Some(30),
            ModelType::Size65B => Some(65),
        }
    }

    /// Number of `consolidated.*.pth` shards the PyTorch checkpoint of this
    /// size is split into, 0 for [`ModelType::Unknown`].
    pub fn pytorch_part_count(&self) -> usize {
        match self {
            ModelType::Unknown => 0,
            ModelType::Size7B => 1,
            ModelType::Size13B => 2,
            ModelType::Size30B => 4,
            ModelType::Size65B => 8,
        }
    }

    pub fn from_parameter_count_billions(billions: u32) -> Self {
        match billions {
            7 => ModelType::Size7B,
            13 => ModelType::Size13B,
            30 => ModelType::Size30B,
            65 => ModelType::Size65B,
            _ => ModelType::Unknown,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parameter_count_billions() {
            Some(b) => write!(f, "{b}B"),
            None => write!(f, "unknown"),
        }
    }
}

/// Target weight format for quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFileType {
    AllF32,
    MostlyF16,
    MostlyQ4_0,
    MostlyQ4_1,
    MostlyQ4_1SomeF16,
}

impl fmt::Display for ModelFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFileType::AllF32 => write!(f, "f32"),
            ModelFileType::MostlyF16 => write!(f, "f16"),
            ModelFileType::MostlyQ4_0 => write!(f, "q4_0"),
            ModelFileType::MostlyQ4_1 => write!(f, "q4_1"),
            ModelFileType::MostlyQ4_1SomeF16 => write!(f, "q4_1_some_f16"),
        }
    }
}

/// Brings a model into memory and hands back an owned native context.
pub trait ModelLoader: Send + Sync {
    fn load(&self, params: &LoadParams) -> Result<Box<dyn InferenceContext>>;
}

/// A loaded model plus its native evaluation state (KV cache etc).
///
/// Contexts are intentionally not `Clone`: duplicating native state is not a
/// cheap or well-defined operation.
pub trait InferenceContext: Send {
    /// Convert text into token IDs, optionally prefixed with BOS.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// Text for a single token. Unknown IDs decode to an empty string.
    fn detokenize(&self, token: TokenId) -> String;

    /// Fold `tokens` into the native state at position `n_past`.
    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize, threads: usize) -> Result<()>;

    /// Pick the next token given the evaluated state and recent history.
    fn sample(&mut self, recent: &[TokenId], config: &SamplingConfig) -> TokenId;

    /// End-of-sequence token for this model.
    fn eos_token(&self) -> TokenId;

    /// Context window the model was loaded with.
    fn context_size(&self) -> usize;

    /// Apply a LoRA adapter on top of the loaded weights.
    fn apply_lora_adapter(
        &mut self,
        adapter: &Path,
        base: Option<&Path>,
        threads: usize,
    ) -> Result<()> {
        let _ = (base, threads);
        Err(LlamaError::Unsupported(format!(
            "LoRA adapters ({})",
            adapter.display()
        )))
    }
}

/// Rewrites a model file into a smaller weight format.
pub trait Quantizer: Send + Sync {
    fn quantize(&self, source: &Path, destination: &Path, file_type: ModelFileType) -> Result<()>;
}

/// Reads model metadata without building a full context.
pub trait ModelInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ModelType>;
}

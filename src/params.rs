//! Session parameters.
//!
//! [`SessionParams`] is an immutable-after-construction value object: build
//! it with the presets and `with_*` methods, or load it from JSON, then hand
//! it to a setup operation. Range checking beyond the basics in
//! [`SessionParams::validate`] is left to the backend.

use std::path::{Path, PathBuf};

use llama_engine::{LoadParams, SamplingConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Instruction framing used by the Alpaca and GPT4All presets.
pub mod alpaca_framing {
    pub const INITIAL_PROMPT: &str = "Below is an instruction that describes a task. Write a response that appropriately completes the request.";
    pub const PREFIX: &str = "\n\n### Instruction:\n\n";
    pub const SUFFIX: &str = "\n\n### Response:\n\n";
    pub const ANTIPROMPT: &str = "### Instruction:\n\n";
}

/// Whether each turn is wrapped in the prompt prefix/suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Regular,
    Instructional,
}

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    pub model_path: String,
    pub mode: SessionMode,

    /// `None` picks a random seed at load time.
    pub seed: Option<u32>,
    pub thread_count: usize,

    /// Tokens to generate per prediction; negative means unbounded.
    pub token_limit: i32,
    pub gpu_layers: u32,
    pub context_size: usize,
    pub batch_size: usize,

    /// Tokens from the start of the context preserved when the window overflows.
    pub tokens_to_keep: usize,

    pub sampling: SamplingConfig,
    pub antiprompts: Vec<String>,

    pub lora_adapter: Option<PathBuf>,
    pub lora_base: Option<PathBuf>,

    pub f16_memory: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,

    pub initial_prompt: Option<String>,
    pub prompt_prefix: Option<String>,
    pub prompt_suffix: Option<String>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            mode: SessionMode::Regular,
            seed: None,
            thread_count: default_thread_count(),
            token_limit: 128,
            gpu_layers: 0,
            context_size: 512,
            batch_size: 512,
            tokens_to_keep: 0,
            sampling: SamplingConfig::default(),
            antiprompts: Vec::new(),
            lora_adapter: None,
            lora_base: None,
            f16_memory: true,
            use_mmap: true,
            use_mlock: false,
            initial_prompt: None,
            prompt_prefix: None,
            prompt_suffix: None,
        }
    }
}

/// Leave room for the caller's thread and the lane worker, capped at 6.
pub fn default_thread_count() -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    available.saturating_sub(2).clamp(1, 6)
}

impl SessionParams {
    pub fn new(model_path: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            model_path: model_path.into(),
            mode,
            ..Self::default()
        }
    }

    /// Plain LLaMA completion.
    pub fn llama(model_path: impl Into<String>) -> Self {
        Self::new(model_path, SessionMode::Regular).with_token_limit(128)
    }

    /// Alpaca instruction following.
    pub fn alpaca(model_path: impl Into<String>) -> Self {
        let mut params = Self::new(model_path, SessionMode::Instructional)
            .with_token_limit(512)
            .with_context_size(2048)
            .with_batch_size(256)
            .with_alpaca_framing();
        params.sampling.top_k = 10_000;
        params.sampling.temperature = 0.2;
        params.sampling.repeat_penalty = 1.0;
        params
    }

    /// GPT4All, which shares Alpaca's framing.
    pub fn gpt4all(model_path: impl Into<String>) -> Self {
        let mut params = Self::new(model_path, SessionMode::Instructional)
            .with_token_limit(128)
            .with_context_size(2048)
            .with_batch_size(8)
            .with_alpaca_framing();
        params.sampling.penalty_window = 64;
        params.sampling.top_k = 40;
        params.sampling.top_p = 0.95;
        params.sampling.temperature = 0.1;
        params.sampling.repeat_penalty = 1.3;
        params
    }

    /// Load parameters from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| SessionError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    fn with_alpaca_framing(mut self) -> Self {
        self.initial_prompt = Some(alpaca_framing::INITIAL_PROMPT.to_string());
        self.prompt_prefix = Some(alpaca_framing::PREFIX.to_string());
        self.prompt_suffix = Some(alpaca_framing::SUFFIX.to_string());
        self.antiprompts = vec![alpaca_framing::ANTIPROMPT.to_string()];
        self
    }

    pub fn with_model_path(mut self, model_path: impl Into<String>) -> Self {
        self.model_path = model_path.into();
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn with_token_limit(mut self, limit: i32) -> Self {
        self.token_limit = limit;
        self
    }

    pub fn with_context_size(mut self, n_ctx: usize) -> Self {
        self.context_size = n_ctx;
        self
    }

    pub fn with_batch_size(mut self, n_batch: usize) -> Self {
        self.batch_size = n_batch;
        self
    }

    pub fn with_tokens_to_keep(mut self, n_keep: usize) -> Self {
        self.tokens_to_keep = n_keep;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_antiprompt(mut self, antiprompt: impl Into<String>) -> Self {
        self.antiprompts.push(antiprompt.into());
        self
    }

    pub fn with_lora_adapter(mut self, adapter: impl Into<PathBuf>, base: Option<PathBuf>) -> Self {
        self.lora_adapter = Some(adapter.into());
        self.lora_base = base;
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_prompt_framing(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.prompt_prefix = Some(prefix.into());
        self.prompt_suffix = Some(suffix.into());
        self
    }

    pub fn is_instructional(&self) -> bool {
        self.mode == SessionMode::Instructional
    }

    /// Reject parameters no backend could accept.
    pub fn validate(&self) -> Result<()> {
        if self.model_path.trim().is_empty() {
            return Err(SessionError::InvalidParams("model path is empty".into()));
        }
        if self.context_size == 0 {
            return Err(SessionError::InvalidParams("context size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(SessionError::InvalidParams("batch size must be positive".into()));
        }
        if self.thread_count == 0 {
            return Err(SessionError::InvalidParams("thread count must be positive".into()));
        }
        if self.tokens_to_keep >= self.context_size {
            return Err(SessionError::InvalidParams(format!(
                "tokens to keep ({}) must be smaller than the context size ({})",
                self.tokens_to_keep, self.context_size
            )));
        }
        Ok(())
    }

    /// The subset of parameters the model loader consumes.
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            path: self.model_path.clone(),
            context_size: self.context_size,
            seed: self.seed,
            gpu_layers: self.gpu_layers,
            f16_memory: self.f16_memory,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
        }
    }
}

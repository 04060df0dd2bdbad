//! Deterministic scripted backend.
//!
//! [`MockEngine`] implements every `llama-engine` trait without a model file.
//! Prompts tokenize to one token per character; the sampler plays back a
//! fixed script of reply pieces. Every native call is instrumented so tests
//! can assert that calls on one context never overlap.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use llama_engine::{
    InferenceContext, LlamaError, LoadParams, ModelFileType, ModelInspector, ModelLoader,
    ModelType, Quantizer, Result, SamplingConfig, TokenId,
};

pub const BOS_ID: TokenId = 1;
pub const EOS_ID: TokenId = 2;

/// Reply pieces are numbered above the Unicode range so they never collide
/// with character tokens.
const PIECE_BASE: TokenId = 0x0011_0000;

/// Behaviour knobs for [`MockEngine`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Text pieces the sampler emits, one per token, in order.
    pub reply: Vec<String>,
    /// Emit EOS once the script runs out instead of starting over.
    pub end_with_eos: bool,
    /// Time each evaluate/sample call blocks for.
    pub step_delay: Duration,
    pub fail_load: Option<String>,
    pub fail_lora: bool,
    /// Number of successful evaluate calls before every later call fails.
    pub fail_evaluate_after: Option<usize>,
    pub fail_quantize: bool,
    pub model_type: ModelType,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            reply: vec!["Hello".into(), ",".into(), " world".into(), "!".into()],
            end_with_eos: true,
            step_delay: Duration::ZERO,
            fail_load: None,
            fail_lora: false,
            fail_evaluate_after: None,
            fail_quantize: false,
            model_type: ModelType::Size7B,
        }
    }
}

/// Tracks concurrent native calls against one context.
#[derive(Debug, Default)]
pub struct CallMonitor {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl CallMonitor {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous calls ever observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct MockStats {
    loads: AtomicUsize,
    evaluated_tokens: AtomicUsize,
    monitors: Mutex<Vec<Arc<CallMonitor>>>,
}

/// Scripted backend. Cloning shares the call statistics.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    config: MockConfig,
    stats: Arc<MockStats>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            stats: Arc::default(),
        }
    }

    /// Script the reply as explicit token pieces.
    pub fn with_reply_pieces<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.reply = pieces.into_iter().map(Into::into).collect();
        self
    }

    /// Script the reply as whitespace-preserving words: `"Hello User:"`
    /// becomes `["Hello", " User:"]`.
    pub fn with_reply_text(self, text: &str) -> Self {
        let mut pieces = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            if c.is_whitespace() && !current.trim().is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        self.with_reply_pieces(pieces)
    }

    pub fn ending_with_eos(mut self, end_with_eos: bool) -> Self {
        self.config.end_with_eos = end_with_eos;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.config.step_delay = delay;
        self
    }

    pub fn failing_load(mut self, message: impl Into<String>) -> Self {
        self.config.fail_load = Some(message.into());
        self
    }

    pub fn failing_lora(mut self) -> Self {
        self.config.fail_lora = true;
        self
    }

    pub fn failing_evaluate_after(mut self, successful_calls: usize) -> Self {
        self.config.fail_evaluate_after = Some(successful_calls);
        self
    }

    pub fn failing_quantize(mut self) -> Self {
        self.config.fail_quantize = true;
        self
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.config.model_type = model_type;
        self
    }

    /// Number of successful model loads.
    pub fn loads(&self) -> usize {
        self.stats.loads.load(Ordering::SeqCst)
    }

    /// Tokens passed to evaluate across every context.
    pub fn evaluated_tokens(&self) -> usize {
        self.stats.evaluated_tokens.load(Ordering::SeqCst)
    }

    /// One monitor per loaded context, in load order.
    pub fn monitors(&self) -> Vec<Arc<CallMonitor>> {
        self.stats
            .monitors
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Highest per-context call overlap seen on any context.
    pub fn max_overlap(&self) -> usize {
        self.monitors()
            .iter()
            .map(|m| m.max_in_flight())
            .max()
            .unwrap_or(0)
    }

    fn register_monitor(&self) -> Arc<CallMonitor> {
        let monitor = Arc::new(CallMonitor::default());
        if let Ok(mut monitors) = self.stats.monitors.lock() {
            monitors.push(monitor.clone());
        }
        monitor
    }
}

impl ModelLoader for MockEngine {
    fn load(&self, params: &LoadParams) -> Result<Box<dyn InferenceContext>> {
        if params.path.is_empty() {
            return Err(LlamaError::ModelLoad("empty model path".to_string()));
        }
        if let Some(message) = &self.config.fail_load {
            return Err(LlamaError::ModelLoad(message.clone()));
        }
        thread::sleep(self.config.step_delay);
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(path = %params.path, context_size = params.context_size, "mock model loaded");

        Ok(Box::new(MockContext {
            config: self.config.clone(),
            stats: self.stats.clone(),
            monitor: self.register_monitor(),
            context_size: params.context_size,
            cursor: 0,
            evaluate_calls: 0,
        }))
    }
}

impl Quantizer for MockEngine {
    fn quantize(&self, source: &Path, destination: &Path, file_type: ModelFileType) -> Result<()> {
        if self.config.fail_quantize {
            return Err(LlamaError::Quantization(format!(
                "cannot convert {} to {file_type}",
                source.display()
            )));
        }
        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            %file_type,
            "mock quantize"
        );
        Ok(())
    }
}

impl ModelInspector for MockEngine {
    fn inspect(&self, path: &Path) -> Result<ModelType> {
        if path.as_os_str().is_empty() {
            return Err(LlamaError::Io("empty model path".to_string()));
        }
        if let Some(message) = &self.config.fail_load {
            return Err(LlamaError::ModelLoad(message.clone()));
        }
        Ok(self.config.model_type)
    }
}

struct MockContext {
    config: MockConfig,
    stats: Arc<MockStats>,
    monitor: Arc<CallMonitor>,
    context_size: usize,
    cursor: usize,
    evaluate_calls: usize,
}

impl MockContext {
    fn instrumented<T>(&self, call: impl FnOnce() -> T) -> T {
        self.monitor.enter();
        thread::sleep(self.config.step_delay);
        let result = call();
        self.monitor.exit();
        result
    }
}

impl InferenceContext for MockContext {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        self.instrumented(|| {
            let mut tokens = Vec::with_capacity(text.len() + 1);
            if add_bos {
                tokens.push(BOS_ID);
            }
            tokens.extend(text.chars().map(|c| c as TokenId));
            if tokens.len() > self.context_size {
                return Err(LlamaError::Tokenization(format!(
                    "{} tokens do not fit a {} token buffer",
                    tokens.len(),
                    self.context_size
                )));
            }
            Ok(tokens)
        })
    }

    fn detokenize(&self, token: TokenId) -> String {
        self.instrumented(|| {
            if token >= PIECE_BASE {
                return self
                    .config
                    .reply
                    .get((token - PIECE_BASE) as usize)
                    .cloned()
                    .unwrap_or_default();
            }
            if token == BOS_ID || token == EOS_ID {
                return String::new();
            }
            char::from_u32(token as u32)
                .map(String::from)
                .unwrap_or_default()
        })
    }

    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize, _threads: usize) -> Result<()> {
        self.monitor.enter();
        thread::sleep(self.config.step_delay);
        let result = match self.config.fail_evaluate_after {
            Some(limit) if self.evaluate_calls >= limit => {
                Err(LlamaError::Inference("mock evaluate failure".to_string()))
            }
            _ if n_past + tokens.len() > self.context_size => Err(LlamaError::Inference(format!(
                "position {} exceeds context size {}",
                n_past + tokens.len(),
                self.context_size
            ))),
            _ => {
                self.evaluate_calls += 1;
                self.stats
                    .evaluated_tokens
                    .fetch_add(tokens.len(), Ordering::SeqCst);
                Ok(())
            }
        };
        self.monitor.exit();
        result
    }

    fn sample(&mut self, _recent: &[TokenId], _config: &SamplingConfig) -> TokenId {
        self.monitor.enter();
        thread::sleep(self.config.step_delay);
        let reply_len = self.config.reply.len();
        let token = if reply_len == 0 || (self.config.end_with_eos && self.cursor >= reply_len) {
            EOS_ID
        } else {
            let index = self.cursor % reply_len;
            self.cursor += 1;
            PIECE_BASE + index as TokenId
        };
        self.monitor.exit();
        token
    }

    fn eos_token(&self) -> TokenId {
        EOS_ID
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn apply_lora_adapter(
        &mut self,
        adapter: &Path,
        _base: Option<&Path>,
        _threads: usize,
    ) -> Result<()> {
        if self.config.fail_lora {
            return Err(LlamaError::LoraAdapter(format!(
                "cannot apply {}",
                adapter.display()
            )));
        }
        Ok(())
    }
}

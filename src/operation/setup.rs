//! Model loading.

use std::sync::Arc;
use std::time::Instant;

use llama_engine::ModelLoader;
use tracing::{info, warn};

use crate::context::SessionContext;
use crate::error::{Result, SessionError};
use crate::event::{EventChannel, SetupEvent, SetupProgress};
use crate::params::SessionParams;
use crate::queue::{CancelFlag, ContextSlot, Operation};

/// Loads a model, applies the optional LoRA adapter and installs the
/// resulting context on the lane. A lane that already holds a context
/// rejects the setup until the context is released.
///
/// Cancellation is only honoured before the operation starts: a native load
/// cannot be interrupted, so a running setup always reports its outcome.
pub(crate) struct SetupOperation {
    loader: Arc<dyn ModelLoader>,
    params: SessionParams,
    events: EventChannel<SetupEvent>,
}

impl SetupOperation {
    pub(crate) fn new(
        loader: Arc<dyn ModelLoader>,
        params: SessionParams,
        events: EventChannel<SetupEvent>,
    ) -> Self {
        Self {
            loader,
            params,
            events,
        }
    }

    fn load(&mut self) -> Result<SessionContext> {
        self.params.validate()?;

        self.events
            .emit(SetupEvent::Progress(SetupProgress::LoadingModel));
        let mut native = self
            .loader
            .load(&self.params.load_params())
            .map_err(SessionError::FailedToLoadModel)?;

        if let Some(adapter) = &self.params.lora_adapter {
            self.events
                .emit(SetupEvent::Progress(SetupProgress::ApplyingLoraAdapter));
            info!(adapter = %adapter.display(), "applying LoRA adapter");
            native
                .apply_lora_adapter(
                    adapter,
                    self.params.lora_base.as_deref(),
                    self.params.thread_count,
                )
                .map_err(SessionError::FailedToApplyLoraAdapter)?;
        }

        Ok(SessionContext::new(self.params.clone(), native))
    }
}

impl Operation for SetupOperation {
    fn kind(&self) -> &'static str {
        "setup"
    }

    fn run(mut self: Box<Self>, slot: &mut ContextSlot, _cancel: &CancelFlag) {
        if let ContextSlot::Ready(current) = slot {
            warn!(context = %current.id(), "setup rejected, context already loaded");
            self.events
                .emit(SetupEvent::Failed(SessionError::ContextAlreadyLoaded));
            return;
        }

        let started = Instant::now();
        info!(model = %self.params.model_path, "loading model");

        match self.load() {
            Ok(context) => {
                let info = context.info();
                *slot = ContextSlot::Ready(context);
                info!(
                    context = %info.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                self.events.emit(SetupEvent::Ready(info));
            }
            Err(err) => {
                warn!(model = %self.params.model_path, error = %err, "setup failed");
                *slot = ContextSlot::Failed(err.clone());
                self.events.emit(SetupEvent::Failed(err));
            }
        }
    }

    fn abandon(self: Box<Self>) {}
}

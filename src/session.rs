//! High-level session management.
//!
//! A [`Session`] ties a model loader, a [`SessionParams`] and an
//! [`OperationQueue`] into a single object: the model is loaded lazily on the
//! first prediction and every prediction runs on the session's own lane.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use llama_engine::ModelLoader;
use llama_runtime::telemetry::TelemetryHook;
use tracing::debug;

use crate::context::ContextSnapshot;
use crate::error::{Result, SessionError};
use crate::event::{EventChannel, PredictionEvent, PredictionStream, SetupEvent};
use crate::params::SessionParams;
use crate::queue::{OperationHandle, OperationQueue};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone)]
pub enum SessionState {
    NotStarted,
    LoadingModel,
    ReadyToPredict,
    Predicting,
    /// Setup failed; every later prediction fails with this error.
    Error(SessionError),
}

impl SessionState {
    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }
}

type StateHandler = Arc<dyn Fn(&SessionState) + Send + Sync>;

#[derive(Default)]
struct Shared {
    state: Option<SessionState>,
    handler: Option<StateHandler>,
}

/// State shared between the session and the event channels it wraps.
#[derive(Clone, Default)]
struct StateCell(Arc<Mutex<Shared>>);

impl StateCell {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self) -> SessionState {
        self.lock()
            .state
            .clone()
            .unwrap_or(SessionState::NotStarted)
    }

    /// Apply `transition` and notify the handler outside the lock.
    fn update(&self, transition: impl FnOnce(&SessionState) -> Option<SessionState>) {
        let (next, handler) = {
            let mut shared = self.lock();
            let current = shared.state.clone().unwrap_or(SessionState::NotStarted);
            let Some(next) = transition(&current) else {
                return;
            };
            shared.state = Some(next.clone());
            (next, shared.handler.clone())
        };
        debug!(state = ?next, "session state changed");
        if let Some(handler) = handler {
            handler(&next);
        }
    }

    fn set(&self, next: SessionState) {
        self.update(|_| Some(next));
    }
}

/// An interactive session over one model.
pub struct Session {
    loader: Arc<dyn ModelLoader>,
    params: SessionParams,
    queue: OperationQueue,
    state: StateCell,
}

impl Session {
    /// Create a session. No model is loaded until the first prediction or
    /// an explicit [`Session::load`].
    pub fn new(loader: Arc<dyn ModelLoader>, params: SessionParams) -> Result<Self> {
        let name = format!("llama-session-{}", short_name(&params.model_path));
        let queue = OperationQueue::spawn(name)?;
        Ok(Self {
            loader,
            params,
            queue,
            state: StateCell::default(),
        })
    }

    /// Report prediction metrics to `hook`.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.queue.set_telemetry(hook);
        self
    }

    /// Push the context's state to `observer` after every prediction.
    pub fn with_context_observer(
        mut self,
        observer: impl Fn(&ContextSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.queue.set_context_observer(Arc::new(observer));
        self
    }

    /// Invoke `handler` on every state change.
    ///
    /// The handler may run on the lane worker, where it must not wait on the
    /// lane: [`Session::current_context`] called from it returns
    /// [`SessionError::LaneReentry`]. Use [`Session::with_context_observer`]
    /// to receive context updates pushed from the lane instead.
    pub fn on_state_change(&self, handler: impl Fn(&SessionState) + Send + Sync + 'static) {
        self.state.lock().handler = Some(Arc::new(handler));
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Queue the model load if it has not been queued yet.
    pub fn load(&self) -> Result<()> {
        self.load_with(EventChannel::from_fn(|_| {}))
    }

    /// Like [`Session::load`], forwarding setup events to `events`. When the
    /// model is already loading or loaded, `events` is dropped unused.
    pub fn load_with(&self, mut events: EventChannel<SetupEvent>) -> Result<()> {
        let mut queued = false;
        self.state.update(|current| match current {
            SessionState::NotStarted => {
                queued = true;
                Some(SessionState::LoadingModel)
            }
            _ => None,
        });
        if !queued {
            return Ok(());
        }

        let state = self.state.clone();
        let tracked = EventChannel::from_fn(move |event: SetupEvent| {
            match &event {
                SetupEvent::Progress(_) => {}
                SetupEvent::Ready(_) => state.set(SessionState::ReadyToPredict),
                SetupEvent::Failed(err) => state.set(SessionState::Error(err.clone())),
            }
            events.emit(event);
        });

        if let Err(err) = self
            .queue
            .submit_setup(self.loader.clone(), self.params.clone(), tracked)
        {
            self.state.set(SessionState::Error(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Start a prediction and return a blocking stream over its events.
    pub fn predict(&self, prompt: impl Into<String>) -> Result<PredictionStream> {
        let (events, rx) = EventChannel::unbounded();
        let handle = self.predict_with(prompt, events)?;
        Ok(PredictionStream::new(handle, rx))
    }

    /// Start a prediction, delivering its events to `events`.
    ///
    /// If setup has already failed, `events` receives `Failed` with the setup
    /// error immediately.
    pub fn predict_with(
        &self,
        prompt: impl Into<String>,
        mut events: EventChannel<PredictionEvent>,
    ) -> Result<OperationHandle> {
        if let SessionState::Error(err) = self.state() {
            events.emit(PredictionEvent::Failed(err));
            return Ok(OperationHandle::new());
        }
        self.load()?;

        let state = self.state.clone();
        let tracked = EventChannel::from_fn(move |event: PredictionEvent| {
            match &event {
                PredictionEvent::Started => state.update(|current| match current {
                    SessionState::ReadyToPredict => Some(SessionState::Predicting),
                    _ => None,
                }),
                PredictionEvent::Completed
                | PredictionEvent::Cancelled
                | PredictionEvent::Failed(_) => state.update(|current| match current {
                    SessionState::Predicting => Some(SessionState::ReadyToPredict),
                    _ => None,
                }),
                PredictionEvent::Token(_) => {}
            }
            events.emit(event);
        });
        self.queue.submit_predict(prompt, tracked)
    }

    /// Snapshot of the loaded context, or `None` before a successful load.
    /// Fails with [`SessionError::LaneReentry`] on the lane worker.
    pub fn current_context(&self) -> Result<Option<ContextSnapshot>> {
        self.queue.current_context()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("model_path", &self.params.model_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn short_name(model_path: &str) -> String {
    std::path::Path::new(model_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}

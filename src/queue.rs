//! Serial operation lane.
//!
//! An [`OperationQueue`] owns a dedicated OS thread and runs submitted
//! operations on it one at a time, in submission order. The lane worker is
//! the only owner of the session context: setup operations install it,
//! predict operations borrow it for their whole run, and nothing outside
//! the worker ever touches the native handle.
//!
//! ```text
//! ┌──────────────┐   LaneCommand    ┌────────────────────────┐
//! │ caller thread│ ───────────────> │ lane worker            │
//! │              │                  │  owns: ContextSlot     │
//! │              │ <─ EventChannel ─│  runs: one op at a time│
//! └──────────────┘                  └────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use llama_engine::ModelLoader;
use llama_runtime::telemetry::{NoopTelemetry, TelemetryHook};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextSnapshot, SessionContext};
use crate::error::{Result, SessionError};
use crate::event::{EventChannel, PredictionEvent, PredictionStream, SetupEvent};
use crate::operation::predict::PredictOperation;
use crate::operation::setup::SetupOperation;
use crate::operation::{InspectOperation, ReleaseOperation};
use crate::params::SessionParams;

/// Identifies one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Cooperative cancellation flag shared between a handle and its operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Caller-side handle to a submitted operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    cancel: CancelFlag,
}

impl OperationHandle {
    pub(crate) fn new() -> Self {
        Self {
            id: OperationId::new(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Request cancellation. A queued operation is dropped before it starts;
    /// a running prediction stops at its next loop iteration. Cancelling a
    /// finished operation has no effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

/// What the lane currently holds in place of a session context.
#[derive(Debug, Default)]
pub(crate) enum ContextSlot {
    #[default]
    Empty,
    Ready(SessionContext),
    /// The most recent setup failed before any context was installed.
    Failed(SessionError),
}

/// Work that runs on the lane.
pub(crate) trait Operation: Send {
    fn kind(&self) -> &'static str;

    /// Run to completion, emitting exactly one terminal event.
    fn run(self: Box<Self>, slot: &mut ContextSlot, cancel: &CancelFlag);

    /// Called instead of `run` when the handle was cancelled while queued.
    fn abandon(self: Box<Self>);
}

enum LaneCommand {
    Run {
        handle: OperationHandle,
        operation: Box<dyn Operation>,
    },
    Shutdown,
}

/// Called on the lane with the context's state after every prediction.
pub type ContextObserver = Arc<dyn Fn(&ContextSnapshot) + Send + Sync>;

/// A FIFO lane that serializes every operation on one session context.
///
/// Event callbacks run on the lane worker. From there, calls that wait for
/// the lane (`current_context`) fail with [`SessionError::LaneReentry`]
/// instead of blocking forever; submitting new work is fine.
pub struct OperationQueue {
    name: String,
    cmd_tx: Sender<LaneCommand>,
    telemetry: Arc<dyn TelemetryHook>,
    observer: Option<ContextObserver>,
    worker: thread::ThreadId,
    thread: Option<thread::JoinHandle<()>>,
}

impl OperationQueue {
    /// Spawn the lane worker thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (cmd_tx, cmd_rx) = unbounded::<LaneCommand>();

        let lane = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || lane_loop(&lane, cmd_rx))
            .map_err(|e| {
                warn!(error = %e, "failed to spawn lane worker");
                SessionError::QueueClosed
            })?;

        Ok(Self {
            name,
            cmd_tx,
            telemetry: Arc::new(NoopTelemetry),
            observer: None,
            worker: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Report prediction metrics to `hook`.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.set_telemetry(hook);
        self
    }

    pub fn set_telemetry(&mut self, hook: Arc<dyn TelemetryHook>) {
        self.telemetry = hook;
    }

    /// Push the context's state to `observer` after every prediction,
    /// before its terminal event is emitted.
    pub fn with_context_observer(mut self, observer: ContextObserver) -> Self {
        self.set_context_observer(observer);
        self
    }

    pub fn set_context_observer(&mut self, observer: ContextObserver) {
        self.observer = Some(observer);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a setup that loads a model and installs it as the lane's
    /// context. Fails with [`SessionError::ContextAlreadyLoaded`] if the lane
    /// still holds one.
    pub fn submit_setup(
        &self,
        loader: Arc<dyn ModelLoader>,
        params: SessionParams,
        events: EventChannel<SetupEvent>,
    ) -> Result<OperationHandle> {
        self.submit(Box::new(SetupOperation::new(loader, params, events)))
    }

    /// Enqueue a prediction against the lane's context.
    pub fn submit_predict(
        &self,
        prompt: impl Into<String>,
        events: EventChannel<PredictionEvent>,
    ) -> Result<OperationHandle> {
        let operation = PredictOperation::new(
            prompt.into(),
            events,
            self.telemetry.clone(),
            self.observer.clone(),
        );
        self.submit(Box::new(operation))
    }

    /// Enqueue a prediction and return a blocking stream over its events.
    pub fn predict(&self, prompt: impl Into<String>) -> Result<PredictionStream> {
        let (events, rx) = EventChannel::unbounded();
        let handle = self.submit_predict(prompt, events)?;
        Ok(PredictionStream::new(handle, rx))
    }

    /// Snapshot of the lane's context, taken after every operation queued
    /// ahead of this call has finished.
    ///
    /// Blocks until the lane reaches the request, so it fails with
    /// [`SessionError::LaneReentry`] when called from the lane itself.
    pub fn current_context(&self) -> Result<Option<ContextSnapshot>> {
        if self.on_worker() {
            return Err(SessionError::LaneReentry);
        }
        let (tx, rx) = bounded(1);
        self.submit(Box::new(InspectOperation::new(tx)))?;
        rx.recv().map_err(|_| SessionError::QueueClosed)
    }

    /// Drop the lane's context once queued work ahead of it has finished.
    pub fn release_context(&self) -> Result<OperationHandle> {
        self.submit(Box::new(ReleaseOperation))
    }

    pub(crate) fn submit(&self, operation: Box<dyn Operation>) -> Result<OperationHandle> {
        let handle = OperationHandle::new();
        debug!(lane = %self.name, id = %handle.id(), kind = operation.kind(), "operation queued");
        self.cmd_tx
            .send(LaneCommand::Run {
                handle: handle.clone(),
                operation,
            })
            .map_err(|_| SessionError::QueueClosed)?;
        Ok(handle)
    }

    /// Finish queued work, then stop the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.worker
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(LaneCommand::Shutdown);
        if self.on_worker() {
            // The worker exits on its own once it reads the shutdown.
            drop(self.thread.take());
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(lane = %self.name, "lane worker panicked");
            }
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The loop running on the lane worker.
fn lane_loop(lane: &str, cmd_rx: Receiver<LaneCommand>) {
    let mut slot = ContextSlot::Empty;
    info!(lane, "lane worker started");

    while let Ok(command) = cmd_rx.recv() {
        match command {
            LaneCommand::Run { handle, operation } => {
                let kind = operation.kind();
                if handle.is_cancelled() {
                    debug!(lane, id = %handle.id(), kind, "operation cancelled before start");
                    operation.abandon();
                    continue;
                }
                debug!(lane, id = %handle.id(), kind, "operation started");
                operation.run(&mut slot, handle.flag());
                debug!(lane, id = %handle.id(), kind, "operation finished");
            }
            LaneCommand::Shutdown => break,
        }
    }

    // The native context is released on the thread that used it.
    drop(slot);
    info!(lane, "lane worker stopped");
}

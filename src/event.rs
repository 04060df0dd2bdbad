//! Events emitted by operations and the channels that deliver them.
//!
//! Every operation owns one [`EventChannel`]. The channel forwards events to
//! whatever the caller picked (a crossbeam receiver drained by a UI thread,
//! a tokio task, a plain callback) in emission order, and seals itself after
//! the terminal event so nothing is delivered for an operation once it has
//! finished.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::context::SessionContextInfo;
use crate::error::SessionError;
use crate::queue::{OperationHandle, OperationId};

/// Events that close an operation's stream.
pub trait TerminalEvent {
    fn is_terminal(&self) -> bool;
}

/// Lifecycle of one predict operation: `Started`, any number of `Token`s,
/// then exactly one of `Completed`, `Cancelled` or `Failed`.
#[derive(Debug, Clone)]
pub enum PredictionEvent {
    Started,
    Token(String),
    Completed,
    Cancelled,
    Failed(SessionError),
}

impl TerminalEvent for PredictionEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionEvent::Completed | PredictionEvent::Cancelled | PredictionEvent::Failed(_)
        )
    }
}

/// Progress reported while a model loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupProgress {
    LoadingModel,
    ApplyingLoraAdapter,
}

/// Lifecycle of a setup operation: any number of `Progress`, then `Ready`
/// or `Failed`.
#[derive(Debug, Clone)]
pub enum SetupEvent {
    Progress(SetupProgress),
    Ready(SessionContextInfo),
    Failed(SessionError),
}

impl TerminalEvent for SetupEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, SetupEvent::Ready(_) | SetupEvent::Failed(_))
    }
}

/// Ordered, lossless delivery of one operation's events.
pub struct EventChannel<E> {
    deliver: Box<dyn FnMut(E) + Send>,
    closed: bool,
}

impl<E: TerminalEvent + Send + 'static> EventChannel<E> {
    /// Deliver by invoking `f` on the lane worker.
    pub fn from_fn(f: impl FnMut(E) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(f),
            closed: false,
        }
    }

    /// Deliver into a crossbeam channel. A dropped receiver discards events.
    pub fn from_sender(tx: Sender<E>) -> Self {
        Self::from_fn(move |event| {
            let _ = tx.send(event);
        })
    }

    /// Deliver into a tokio channel for consumption from async code.
    pub fn from_tokio(tx: tokio::sync::mpsc::UnboundedSender<E>) -> Self {
        Self::from_fn(move |event| {
            let _ = tx.send(event);
        })
    }

    /// A channel paired with the receiving end.
    pub fn unbounded() -> (Self, Receiver<E>) {
        let (tx, rx) = unbounded();
        (Self::from_sender(tx), rx)
    }

    /// Forward `event` unless the terminal event has already gone out.
    /// Returns whether the event was delivered.
    pub(crate) fn emit(&mut self, event: E) -> bool {
        if self.closed {
            return false;
        }
        self.closed = event.is_terminal();
        (self.deliver)(event);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Blocking view over a prediction's events.
///
/// Iteration ends after the terminal event. Dropping the stream does not
/// cancel the prediction; call [`PredictionStream::cancel`] for that.
pub struct PredictionStream {
    handle: OperationHandle,
    events: Receiver<PredictionEvent>,
    finished: bool,
}

impl PredictionStream {
    pub(crate) fn new(handle: OperationHandle, events: Receiver<PredictionEvent>) -> Self {
        Self {
            handle,
            events,
            finished: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.handle.id()
    }

    pub fn handle(&self) -> &OperationHandle {
        &self.handle
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Wait at most `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<PredictionEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(self.observe(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain the stream, concatenating token text.
    ///
    /// Returns the text generated so far alongside the terminal event.
    pub fn wait(self) -> (String, Option<PredictionEvent>) {
        let mut text = String::new();
        let mut terminal = None;
        for event in self {
            match event {
                PredictionEvent::Token(piece) => text.push_str(&piece),
                PredictionEvent::Started => {}
                other => terminal = Some(other),
            }
        }
        (text, terminal)
    }

    fn observe(&mut self, event: PredictionEvent) -> PredictionEvent {
        if event.is_terminal() {
            self.finished = true;
        }
        event
    }
}

impl Iterator for PredictionStream {
    type Item = PredictionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.events.recv() {
            Ok(event) => Some(self.observe(event)),
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn channel_seals_after_terminal_event() {
        let (mut channel, rx) = EventChannel::<PredictionEvent>::unbounded();
        assert!(channel.emit(PredictionEvent::Started));
        assert!(channel.emit(PredictionEvent::Token("a".into())));
        assert!(channel.emit(PredictionEvent::Completed));
        assert!(channel.is_closed());
        assert!(!channel.emit(PredictionEvent::Token("late".into())));
        assert!(!channel.emit(PredictionEvent::Cancelled));

        let delivered: Vec<_> = rx.try_iter().collect();
        assert_eq!(delivered.len(), 3);
        assert!(matches!(delivered[2], PredictionEvent::Completed));
    }

    #[test]
    fn callback_channel_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut channel = EventChannel::from_fn(move |event: SetupEvent| {
            sink.lock().unwrap().push(format!("{event:?}"));
        });
        channel.emit(SetupEvent::Progress(SetupProgress::LoadingModel));
        channel.emit(SetupEvent::Failed(SessionError::QueueClosed));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("LoadingModel"));
        assert!(seen[1].contains("QueueClosed"));
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (mut channel, rx) = EventChannel::<PredictionEvent>::unbounded();
        drop(rx);
        assert!(channel.emit(PredictionEvent::Started));
    }

    #[tokio::test]
    async fn tokio_channel_delivers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut channel = EventChannel::from_tokio(tx);
        channel.emit(PredictionEvent::Token("hi".into()));
        channel.emit(PredictionEvent::Completed);

        assert!(matches!(rx.recv().await, Some(PredictionEvent::Token(t)) if t == "hi"));
        assert!(matches!(rx.recv().await, Some(PredictionEvent::Completed)));
    }

    #[test]
    fn terminal_classification() {
        assert!(!PredictionEvent::Started.is_terminal());
        assert!(!PredictionEvent::Token(String::new()).is_terminal());
        assert!(PredictionEvent::Cancelled.is_terminal());
        assert!(!SetupEvent::Progress(SetupProgress::ApplyingLoraAdapter).is_terminal());
    }
}

//! Operations that run on an operation lane.

pub(crate) mod predict;
pub(crate) mod setup;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::context::ContextSnapshot;
use crate::queue::{CancelFlag, ContextSlot, Operation};

/// Copies the lane's context state back to a waiting caller.
pub(crate) struct InspectOperation {
    reply: Sender<Option<ContextSnapshot>>,
}

impl InspectOperation {
    pub(crate) fn new(reply: Sender<Option<ContextSnapshot>>) -> Self {
        Self { reply }
    }
}

impl Operation for InspectOperation {
    fn kind(&self) -> &'static str {
        "inspect"
    }

    fn run(self: Box<Self>, slot: &mut ContextSlot, _cancel: &CancelFlag) {
        let snapshot = match slot {
            ContextSlot::Ready(context) => Some(context.snapshot()),
            ContextSlot::Empty | ContextSlot::Failed(_) => None,
        };
        let _ = self.reply.send(snapshot);
    }

    fn abandon(self: Box<Self>) {}
}

/// Drops the lane's context.
pub(crate) struct ReleaseOperation;

impl Operation for ReleaseOperation {
    fn kind(&self) -> &'static str {
        "release"
    }

    fn run(self: Box<Self>, slot: &mut ContextSlot, _cancel: &CancelFlag) {
        if let ContextSlot::Ready(context) = std::mem::take(slot) {
            debug!(context = %context.id(), "session context released");
        }
    }

    fn abandon(self: Box<Self>) {}
}

//! The unit of exclusive access: a native context paired with its run state.

use llama_engine::InferenceContext;
use uuid::Uuid;

use crate::params::{SessionMode, SessionParams};
use crate::run_state::RunState;

/// Owns one native inference context and the [`RunState`] tied to it.
///
/// Built by a setup operation inside an operation lane and only ever handed
/// to operations running on that lane. Callers never receive the context
/// itself: they get a [`SessionContextInfo`] on `Ready` and can ask the lane
/// for a [`ContextSnapshot`].
pub struct SessionContext {
    id: Uuid,
    params: SessionParams,
    native: Box<dyn InferenceContext>,
    run_state: RunState,
}

impl SessionContext {
    pub(crate) fn new(params: SessionParams, native: Box<dyn InferenceContext>) -> Self {
        // History spans the whole window so a context swap can re-feed from it.
        let history_capacity = params.context_size.max(params.sampling.penalty_window);
        Self {
            id: Uuid::new_v4(),
            params,
            native,
            run_state: RunState::new(history_capacity),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    /// Split borrow for the operation currently holding the lane.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&SessionParams, &mut dyn InferenceContext, &mut RunState) {
        (&self.params, self.native.as_mut(), &mut self.run_state)
    }

    pub fn info(&self) -> SessionContextInfo {
        SessionContextInfo {
            id: self.id,
            model_path: self.params.model_path.clone(),
            mode: self.params.mode,
            context_size: self.native.context_size(),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            info: self.info(),
            run_state: self.run_state.clone(),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("model_path", &self.params.model_path)
            .field("run_state", &self.run_state)
            .finish_non_exhaustive()
    }
}

/// Caller-facing description of a loaded context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContextInfo {
    pub id: Uuid,
    pub model_path: String,
    pub mode: SessionMode,
    pub context_size: usize,
}

/// Point-in-time copy of a context's state, taken on its lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub info: SessionContextInfo,
    pub run_state: RunState,
}

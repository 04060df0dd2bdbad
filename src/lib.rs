//! Serialized prediction sessions over llama-style language models.
//!
//! A session context (a native inference context plus its [`RunState`]) is
//! owned by an [`OperationQueue`] lane. Setup and predict operations run on
//! that lane one at a time and report progress through [`EventChannel`]s.

pub mod context;
pub mod error;
pub mod event;
pub mod model_utils;
mod operation;
pub mod params;
pub mod queue;
pub mod run_state;
pub mod session;

pub use context::{ContextSnapshot, SessionContext, SessionContextInfo};
pub use error::{Result, SessionError};
pub use event::{EventChannel, PredictionEvent, PredictionStream, SetupEvent, SetupProgress};
pub use params::{SessionMode, SessionParams};
pub use queue::{OperationHandle, OperationId, OperationQueue};
pub use run_state::{RunState, TokenHistory};
pub use session::{Session, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

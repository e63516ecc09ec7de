//! Error taxonomy of the coordinator.

use crate::backend::BackendKind;
use crate::state::{EventKind, State, StateKind};
use thiserror::Error;

/// Everything a coordinator operation can fail with.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The protocol defines nothing for this event in this state.
    #[error("Illegal transition: {event} in state {state}")]
    IllegalTransition { state: StateKind, event: EventKind },

    /// A backend did not bring the session to the awaited shape in time.
    #[error("Timed out waiting for {waiting_for} (last state: {last_state})")]
    ConvergenceTimeout { waiting_for: String, last_state: Box<State> },

    /// A backend call failed or did not confirm its effect.
    #[error("{backend} backend failed during {operation}: {source:#}")]
    BackendOperationFailed {
        backend: BackendKind,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A facade operation was called in a state it does not support.
    #[error("{operation} is not allowed in state {state}")]
    Precondition { operation: &'static str, state: StateKind },

    /// The executor task is gone.
    #[error("State machine is no longer running")]
    MachineStopped,
}

impl CoordinatorError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ConvergenceTimeout { .. })
    }

    pub const fn is_illegal_transition(&self) -> bool {
        matches!(self, Self::IllegalTransition { .. })
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

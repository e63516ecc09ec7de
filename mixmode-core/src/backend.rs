//! Contracts of the two debug engines the coordinator drives.
//!
//! The coordinator never implements these; it only calls them from inside the
//! state machine's executor, one call at a time.

use crate::context::{SuspendContext, ThreadId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::{BreakpointId, StepKind};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One-shot async callback handed to a backend, e.g. run when a thread gets
/// unblocked or a temporary breakpoint is hit.
pub type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Which backend a failed call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Low,
    High,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low-level"),
            Self::High => write!(f, "high-level"),
        }
    }
}

/// The native debugger.
#[async_trait]
pub trait LowLevelBackend: Send + Sync {
    /// Stop every native thread. `thread` is the one the managed engine stopped
    /// on; it stays runnable for the managed engine, and `on_unblock` is run
    /// once it is. Completion is reported later through a position-reached
    /// notification.
    async fn pause_unblocking_stopped_thread(&self, thread: ThreadId, on_unblock: Hook)
        -> Result<()>;

    /// Resume and wait for the engine to confirm. `false` means it did not.
    async fn resume_and_wait(&self) -> Result<bool>;

    /// Let native threads run again without leaving the stopped session.
    async fn continue_all_threads(&self, except_event_thread: bool) -> Result<()>;

    async fn start_step_over(&self, context: &SuspendContext) -> Result<()>;
    async fn start_step_into(&self, context: &SuspendContext) -> Result<()>;
    async fn start_step_out(&self, context: &SuspendContext) -> Result<()>;

    async fn set_and_arm_temporary_breakpoint(&self, thread: ThreadId, on_hit: Hook)
        -> Result<BreakpointId>;

    async fn remove_temporary_breakpoint(&self, breakpoint: BreakpointId) -> Result<()>;

    /// Make `thread` runnable for the managed engine while the native side
    /// stays stopped. Produces no notification.
    async fn unblock_stopped_thread(&self, thread: ThreadId) -> Result<()>;

    async fn start_step(&self, kind: StepKind, context: &SuspendContext) -> Result<()> {
        match kind {
            StepKind::Over => self.start_step_over(context).await,
            StepKind::Into => self.start_step_into(context).await,
            StepKind::Out => self.start_step_out(context).await,
        }
    }
}

/// The managed debugger.
#[async_trait]
pub trait HighLevelBackend: Send + Sync {
    /// Request a stop. Completion is reported through a position-reached
    /// notification.
    async fn pause(&self) -> Result<()>;

    /// Resume and wait for the engine to confirm. `false` means it did not.
    ///
    /// For a mixed step-into this runs on its own task after the executor has
    /// moved on, so it may overlap the executor's next call on this backend
    /// (typically `stopped_thread_id` or `pause` once the native breakpoint
    /// fires). Every other call is made from the executor, one at a time.
    async fn resume_and_wait(&self) -> Result<bool>;

    async fn start_step_over(&self, context: &SuspendContext) -> Result<()>;
    async fn start_step_into(&self, context: &SuspendContext) -> Result<()>;
    async fn start_step_out(&self, context: &SuspendContext) -> Result<()>;

    /// OS thread the managed engine is stopped on in `context`.
    async fn stopped_thread_id(&self, context: &SuspendContext) -> Result<ThreadId>;

    async fn bring_managed_threads_to_unblocked(&self) -> Result<()>;

    /// Bookkeeping after a mixed step-into entered native code on `thread`.
    async fn native_entered(&self, thread: ThreadId) -> Result<()>;

    async fn start_step(&self, kind: StepKind, context: &SuspendContext) -> Result<()> {
        match kind {
            StepKind::Over => self.start_step_over(context).await,
            StepKind::Into => self.start_step_into(context).await,
            StepKind::Out => self.start_step_out(context).await,
        }
    }
}

/// Tags a backend error with the backend and operation it came from.
pub(crate) trait BackendResultExt<T> {
    fn on_backend(self, backend: BackendKind, operation: &'static str) -> CoordinatorResult<T>;
}

impl<T> BackendResultExt<T> for Result<T> {
    fn on_backend(self, backend: BackendKind, operation: &'static str) -> CoordinatorResult<T> {
        self.map_err(|source| CoordinatorError::BackendOperationFailed {
            backend,
            operation,
            source,
        })
    }
}

/// Treats an unconfirmed `resume_and_wait` as a failure.
pub(crate) fn confirmed(
    resumed: Result<bool>,
    backend: BackendKind,
) -> CoordinatorResult<()> {
    if resumed.on_backend(backend, "resume_and_wait")? {
        Ok(())
    } else {
        Err(CoordinatorError::BackendOperationFailed {
            backend,
            operation: "resume_and_wait",
            source: anyhow::anyhow!("engine did not confirm the resume"),
        })
    }
}

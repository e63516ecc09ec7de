//! Mixmode Core - keeps a native and a managed debugger in step.
//!
//! Both engines are attached to the same process and report stops and
//! resumes independently. This crate folds their reports into one logical
//! session with a single execution state, and drives the pause, resume and
//! stepping protocols that need both engines to cooperate.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod machine;
pub mod sim;
pub mod state;
pub mod transition;
pub mod waiter;

// Re-export commonly used types
pub use backend::{BackendKind, HighLevelBackend, Hook, LowLevelBackend};
pub use config::{CoordinatorConfig, IllegalTransitionPolicy, WaitStrategy};
pub use context::{Frame, MergedSuspendContext, Origin, SuspendContext, ThreadId};
pub use error::{CoordinatorError, CoordinatorResult};
pub use facade::{ContextHintClassifier, SessionFacade, SessionListener, StepClassifier};
pub use machine::{Submission, Transition, TransitionStateMachine};
pub use state::{BreakpointId, Event, EventKind, MixedStepKind, State, StateKind, StepKind};
pub use waiter::ConvergenceWaiter;

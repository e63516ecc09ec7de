//! Per-session API used by the debug session and the backends' callbacks.
//!
//! The facade turns session-level requests into state machine events and,
//! where callers expect a finished result, waits for the state to converge.
//! Apart from plain native steps it never calls a backend itself.

use crate::backend::{BackendKind, BackendResultExt, HighLevelBackend, LowLevelBackend};
use crate::config::CoordinatorConfig;
use crate::context::{MergedSuspendContext, Origin, SuspendContext};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::machine::TransitionStateMachine;
use crate::state::{Event, MixedStepKind, State, StateKind, StepKind};
use crate::waiter::ConvergenceWaiter;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// Outer debug session, told when execution is paused as a whole.
pub trait SessionListener: Send + Sync {
    /// Called once per convergence on `BothStopped`.
    fn on_both_stopped(&self, context: &MergedSuspendContext);
}

/// Decides whether a step leaves the engine it starts in.
pub trait StepClassifier: Send + Sync {
    /// A managed step from `context` would end up in native code.
    fn enters_native(&self, context: &SuspendContext, kind: StepKind) -> bool;
    /// A native step from `context` would end up in managed code.
    fn leaves_native(&self, context: &SuspendContext, kind: StepKind) -> bool;
}

/// Reads the boundary hints the backends attach to their contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextHintClassifier;

impl StepClassifier for ContextHintClassifier {
    fn enters_native(&self, context: &SuspendContext, kind: StepKind) -> bool {
        kind == StepKind::Into && context.call_target == Some(Origin::Low)
    }

    fn leaves_native(&self, context: &SuspendContext, kind: StepKind) -> bool {
        kind == StepKind::Out && context.caller().is_some_and(|f| f.origin == Origin::High)
    }
}

/// Mixed-mode view of one debug session, shared by the outer session and the
/// backends' notification handlers.
pub struct SessionFacade {
    machine: TransitionStateMachine,
    low: Arc<dyn LowLevelBackend>,
    classifier: Box<dyn StepClassifier>,
    listener: Option<Arc<dyn SessionListener>>,
    timeout: Duration,
}

impl SessionFacade {
    /// Spawn the state machine for a new session. Must be called from within a
    /// tokio runtime.
    pub fn new(
        low: Arc<dyn LowLevelBackend>,
        high: Arc<dyn HighLevelBackend>,
        config: &CoordinatorConfig,
    ) -> Self {
        let machine = TransitionStateMachine::spawn(Arc::clone(&low), high, config);
        info!("Mixed-mode session created (timeout {:?})", config.convergence_timeout());
        Self {
            machine,
            low,
            classifier: Box::new(ContextHintClassifier),
            listener: None,
            timeout: config.convergence_timeout(),
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn StepClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Snapshot of the coordination state.
    pub fn state(&self) -> State {
        self.machine.current()
    }

    /// The underlying state machine, e.g. to subscribe to transitions.
    pub const fn machine(&self) -> &TransitionStateMachine {
        &self.machine
    }

    /// A waiter on this session's state.
    pub fn waiter(&self) -> ConvergenceWaiter {
        self.machine.waiter()
    }

    /// Stop both backends and return the merged context once both stopped.
    pub async fn pause(&self) -> CoordinatorResult<MergedSuspendContext> {
        self.require("pause", State::is_both_running)?;
        let deadline = Instant::now() + self.timeout;

        self.machine.submit(Event::StopRequested).committed_within(self.timeout).await?;
        let state = self
            .waiter()
            .wait_for(State::is_both_stopped, "both backends to stop", remaining(deadline))
            .await?;
        state.merged_context().ok_or(CoordinatorError::MachineStopped)
    }

    /// Resume both backends and wait until both run.
    pub async fn resume(&self) -> CoordinatorResult<()> {
        self.require("resume", State::is_both_stopped)?;
        let deadline = Instant::now() + self.timeout;

        self.machine.submit(Event::ResumeRequested).committed_within(self.timeout).await?;
        self.waiter()
            .wait_for(State::is_both_running, "both backends to run", remaining(deadline))
            .await?;
        Ok(())
    }

    /// A backend reported that it stopped. Returns the merged context if this
    /// report completed the stop of both backends.
    pub async fn on_position_reached(
        &self,
        context: SuspendContext,
    ) -> CoordinatorResult<Option<MergedSuspendContext>> {
        let event = match context.origin {
            Origin::Low => Event::LowPositionReached { context },
            Origin::High => Event::HighPositionReached { context },
        };
        let state = self.machine.submit(event).committed_within(self.timeout).await?;

        let merged = state.merged_context();
        if let Some(merged) = &merged {
            debug!("Stopped on {}", merged.active_thread());
            if let Some(listener) = &self.listener {
                listener.on_both_stopped(merged);
            }
        }
        Ok(merged)
    }

    /// A backend reported that it runs again. Returns `true` if the coordinator
    /// absorbed the report and `false` if the outer session should treat it as
    /// an ordinary resume.
    pub async fn on_session_resumed(&self, origin: Origin) -> CoordinatorResult<bool> {
        let event = match origin {
            Origin::Low => Event::LowRun,
            Origin::High => Event::HighRun,
        };
        let state = self.machine.submit(event).committed_within(self.timeout).await?;
        Ok(!state.is_both_running())
    }

    /// Step over from `context`, routed by the step classifier.
    pub async fn step_over(&self, context: &SuspendContext) -> CoordinatorResult<()> {
        self.step("step_over", StepKind::Over, context).await
    }

    /// Step into from `context`. A managed call into native code becomes a
    /// mixed step.
    pub async fn step_into(&self, context: &SuspendContext) -> CoordinatorResult<()> {
        self.step("step_into", StepKind::Into, context).await
    }

    /// Step out from `context`. Leaving native code for a managed caller is
    /// coordinated by the machine.
    pub async fn step_out(&self, context: &SuspendContext) -> CoordinatorResult<()> {
        self.step("step_out", StepKind::Out, context).await
    }

    /// Step from managed code at `context` into the native function it calls.
    /// Returns once the high backend resumed for the step.
    pub async fn mixed_step_into_low_from_high(
        &self,
        context: &SuspendContext,
    ) -> CoordinatorResult<()> {
        self.require("mixed_step_into_low_from_high", State::is_both_stopped)?;
        self.submit_mixed_step(context).await
    }

    async fn step(
        &self,
        operation: &'static str,
        kind: StepKind,
        context: &SuspendContext,
    ) -> CoordinatorResult<()> {
        self.require(operation, State::is_both_stopped)?;

        let event = match context.origin {
            Origin::Low if self.classifier.leaves_native(context, kind) => {
                Event::LowStepRequested { context: context.clone(), kind }
            }
            Origin::Low => {
                // Stays inside native code: the machine tracks it through the
                // low backend's own run/stop reports.
                debug!("Native step {kind} on {}", context.thread);
                return self
                    .low
                    .start_step(kind, context)
                    .await
                    .on_backend(BackendKind::Low, operation);
            }
            Origin::High if self.classifier.enters_native(context, kind) => {
                return self.submit_mixed_step(context).await;
            }
            Origin::High => Event::HighStepRequested { context: context.clone(), kind },
        };
        self.submit_step(event).await
    }

    async fn submit_step(&self, event: Event) -> CoordinatorResult<()> {
        self.machine.submit(event).committed_within(self.timeout).await?;
        Ok(())
    }

    /// Start a mixed step-into and wait for the high resume the machine
    /// started without waiting. A failed resume surfaces here as the
    /// backend failure; the machine has already dropped the breakpoint.
    async fn submit_mixed_step(&self, context: &SuspendContext) -> CoordinatorResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut transitions = self.machine.subscribe();
        let event = Event::MixedStepRequested {
            context: context.clone(),
            kind: MixedStepKind::IntoLowFromHigh,
        };
        self.machine.submit(event).committed_within(self.timeout).await?;

        loop {
            let Ok(received) = tokio::time::timeout_at(deadline, transitions.recv()).await else {
                return Err(CoordinatorError::ConvergenceTimeout {
                    waiting_for: "high backend to resume for the mixed step".to_string(),
                    last_state: Box::new(self.state()),
                });
            };
            match received {
                Ok(transition)
                    if transition.from.kind() == StateKind::MixedStepIntoWaitingForHighResume =>
                {
                    return match transition.event {
                        Event::HighResumeFailed { reason, .. } => {
                            Err(CoordinatorError::BackendOperationFailed {
                                backend: BackendKind::High,
                                operation: "resume_and_wait",
                                source: anyhow::anyhow!(reason),
                            })
                        }
                        _ => Ok(()),
                    };
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Mixed step lost {skipped} transitions; trusting the current state");
                    if self.state().kind() != StateKind::MixedStepIntoWaitingForHighResume {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(CoordinatorError::MachineStopped),
            }
        }
    }

    fn require(
        &self,
        operation: &'static str,
        check: fn(&State) -> bool,
    ) -> CoordinatorResult<()> {
        let state = self.machine.current();
        if check(&state) {
            Ok(())
        } else {
            Err(CoordinatorError::Precondition { operation, state: state.kind() })
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

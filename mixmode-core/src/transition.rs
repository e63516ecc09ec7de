//! Pure transition planning.
//!
//! [`plan`] decides, without touching a backend, whether an event is legal in
//! a state and which backend calls the executor has to make before the next
//! state can be committed. Every pair not matched here is an illegal transition.

use crate::context::SuspendContext;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::{BreakpointId, Event, MixedStepKind, State, StateKind, StepKind};

/// Backend work required by a legal transition, together with what is needed
/// to build the next state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// No backend calls; commit the state as is.
    Commit(State),
    /// `high.pause()`, then commit `next`.
    PauseHigh { next: State },
    /// Resolve the thread high stopped on and pause low around it.
    /// Commits `HighStoppedWaitingForLow`.
    PauseLowForHigh { high: SuspendContext },
    /// Low is already stopped; unblock the thread high stopped on.
    /// Commits `BothStopped`.
    UnblockForHigh { low: SuspendContext, high: SuspendContext },
    /// Resume low, then high. Commits `BothRunning`.
    ResumeBoth,
    /// Continue native threads and start a managed step.
    /// Commits `ManagedStepStarted`.
    StartManagedStep { low: SuspendContext, context: SuspendContext, kind: StepKind },
    /// Start a native step that the coordinator tracks.
    /// Commits `LowLevelStepStarted`.
    StartLowStep { high: SuspendContext, context: SuspendContext, kind: StepKind },
    /// Arm a temporary native breakpoint on the stepping thread and let
    /// everything run. Commits `MixedStepIntoWaitingForHighResume`.
    StartMixedStepInto { context: SuspendContext },
    /// The temporary breakpoint fired: drop it, run every other native thread
    /// and stop high. Commits `WaitingForHighReachLowResumedExceptStoppedThread`.
    FinishMixedStepInto { breakpoint: BreakpointId },
    /// High never resumed for the mixed step: drop the temporary breakpoint.
    /// Native threads keep running. Commits `OnlyHighStopped`.
    AbortMixedStepInto { breakpoint: BreakpointId, high: SuspendContext },
}

impl Plan {
    /// Kind of the state this plan commits on success.
    pub const fn target(&self) -> StateKind {
        match self {
            Self::Commit(next) | Self::PauseHigh { next } => next.kind(),
            Self::PauseLowForHigh { .. } => StateKind::HighStoppedWaitingForLow,
            Self::UnblockForHigh { .. } => StateKind::BothStopped,
            Self::ResumeBoth => StateKind::BothRunning,
            Self::StartManagedStep { .. } => StateKind::ManagedStepStarted,
            Self::StartLowStep { .. } => StateKind::LowLevelStepStarted,
            Self::StartMixedStepInto { .. } => StateKind::MixedStepIntoWaitingForHighResume,
            Self::FinishMixedStepInto { .. } => {
                StateKind::WaitingForHighReachLowResumedExceptStoppedThread
            }
            Self::AbortMixedStepInto { .. } => StateKind::OnlyHighStopped,
        }
    }

    /// `false` only for plain commits.
    pub const fn calls_backends(&self) -> bool {
        !matches!(self, Self::Commit(_))
    }
}

/// The work `event` requires in `state`, or `IllegalTransition` if the pair
/// is not in the table. Pure; touches no backend.
pub fn plan(state: &State, event: &Event) -> CoordinatorResult<Plan> {
    use Event as E;
    use State as S;

    let plan = match (state, event) {
        (S::BeforeStart, E::LowRun) => Plan::Commit(S::BothRunning),

        // Running.
        (S::BothRunning, E::StopRequested) => {
            Plan::PauseHigh { next: S::WaitingForHighPositionReached }
        }
        (S::BothRunning, E::LowRun | E::HighRun) => Plan::Commit(S::BothRunning),
        (S::BothRunning, E::HighPositionReached { context }) => {
            Plan::PauseLowForHigh { high: context.clone() }
        }
        (S::BothRunning, E::LowPositionReached { context }) => {
            Plan::PauseHigh { next: S::LowStoppedWaitingForHigh { low: context.clone() } }
        }

        // Stopping.
        (
            S::WaitingForHighPositionReached
            | S::OnlyLowStopped
            | S::WaitingForHighReachLowResumedExceptStoppedThread,
            E::HighPositionReached { context },
        ) => Plan::PauseLowForHigh { high: context.clone() },
        // Resume reports that were overtaken by the stop request.
        (S::WaitingForHighPositionReached, E::LowRun | E::HighRun) => {
            Plan::Commit(S::WaitingForHighPositionReached)
        }
        (S::WaitingForHighPositionReached, E::LowPositionReached { context }) => {
            Plan::Commit(S::LowStoppedWaitingForHigh { low: context.clone() })
        }
        (S::HighStoppedWaitingForLow { high }, E::LowPositionReached { context }) => {
            Plan::Commit(S::BothStopped { low: context.clone(), high: high.clone() })
        }
        (
            S::LowStoppedWaitingForHigh { low }
            | S::ManagedStepStarted { low }
            | S::HighResumedForStepOnlyLowStopped { low },
            E::HighPositionReached { context },
        ) => Plan::UnblockForHigh { low: low.clone(), high: context.clone() },

        // Stopped.
        (S::BothStopped { .. }, E::ResumeRequested) => Plan::ResumeBoth,
        (S::BothStopped { high, .. }, E::LowRun) => {
            Plan::Commit(S::OnlyHighStopped { high: high.clone() })
        }
        (S::BothStopped { .. }, E::HighRun) => Plan::Commit(S::OnlyLowStopped),
        (S::OnlyHighStopped { high }, E::LowPositionReached { context }) => {
            Plan::Commit(S::BothStopped { low: context.clone(), high: high.clone() })
        }
        (S::OnlyHighStopped { .. }, E::HighRun) | (S::OnlyLowStopped, E::LowRun) => {
            Plan::Commit(S::BothRunning)
        }

        // Managed step.
        (S::BothStopped { low, .. }, E::HighStepRequested { context, kind }) => {
            Plan::StartManagedStep { low: low.clone(), context: context.clone(), kind: *kind }
        }
        (S::ManagedStepStarted { low }, E::HighRun) => {
            Plan::Commit(S::HighResumedForStepOnlyLowStopped { low: low.clone() })
        }

        // Coordinated native step.
        (S::BothStopped { high, .. }, E::LowStepRequested { context, kind }) => {
            Plan::StartLowStep { high: high.clone(), context: context.clone(), kind: *kind }
        }
        (S::LowLevelStepStarted { high }, E::LowRun) => {
            Plan::Commit(S::OnlyHighStoppedWaitingForLowStep { high: high.clone() })
        }
        (
            S::LowLevelStepStarted { high } | S::OnlyHighStoppedWaitingForLowStep { high },
            E::LowPositionReached { context },
        ) => Plan::Commit(S::BothStopped { low: context.clone(), high: high.clone() }),

        // Mixed step into native code.
        (
            S::BothStopped { .. },
            E::MixedStepRequested { context, kind: MixedStepKind::IntoLowFromHigh },
        ) => Plan::StartMixedStepInto { context: context.clone() },
        (S::MixedStepIntoWaitingForHighResume { breakpoint }, E::HighRun) => {
            Plan::Commit(S::MixedStepIntoHighResumed { breakpoint: *breakpoint })
        }
        (
            S::MixedStepIntoWaitingForHighResume { breakpoint }
            | S::MixedStepIntoHighResumed { breakpoint },
            E::LowPositionReached { .. },
        ) => Plan::FinishMixedStepInto { breakpoint: *breakpoint },
        (
            S::MixedStepIntoWaitingForHighResume { breakpoint },
            E::HighResumeFailed { context, breakpoint: failed, .. },
        ) if breakpoint == failed => {
            Plan::AbortMixedStepInto { breakpoint: *breakpoint, high: context.clone() }
        }
        (S::WaitingForHighReachLowResumedExceptStoppedThread, E::HighRun) => {
            Plan::Commit(S::WaitingForHighReachLowResumedExceptStoppedThread)
        }

        _ => {
            return Err(CoordinatorError::IllegalTransition {
                state: state.kind(),
                event: event.kind(),
            })
        }
    };
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadId;
    use crate::state::EventKind;

    fn low() -> SuspendContext {
        SuspendContext::low(ThreadId(1), vec![])
    }

    fn high() -> SuspendContext {
        SuspendContext::high(ThreadId(1), vec![])
    }

    #[test]
    fn test_stop_pauses_high_first() {
        let plan = plan(&State::BothRunning, &Event::StopRequested).unwrap();
        assert_eq!(plan, Plan::PauseHigh { next: State::WaitingForHighPositionReached });
        assert!(plan.calls_backends());
    }

    #[test]
    fn test_low_report_completes_stop() {
        let h = high();
        let l = low();
        let plan = plan(
            &State::HighStoppedWaitingForLow { high: h.clone() },
            &Event::LowPositionReached { context: l.clone() },
        )
        .unwrap();
        assert_eq!(plan, Plan::Commit(State::BothStopped { low: l, high: h }));
        assert!(!plan.calls_backends());
    }

    #[test]
    fn test_native_breakpoint_while_running_stops_high() {
        let l = low();
        let plan = plan(&State::BothRunning, &Event::LowPositionReached { context: l.clone() })
            .unwrap();
        assert_eq!(plan.target(), StateKind::LowStoppedWaitingForHigh);
        assert_eq!(plan, Plan::PauseHigh { next: State::LowStoppedWaitingForHigh { low: l } });
    }

    #[test]
    fn test_mixed_step_finishes_from_either_resume_state() {
        for state in [
            State::MixedStepIntoWaitingForHighResume { breakpoint: BreakpointId(3) },
            State::MixedStepIntoHighResumed { breakpoint: BreakpointId(3) },
        ] {
            let plan = plan(&state, &Event::LowPositionReached { context: low() }).unwrap();
            assert_eq!(plan, Plan::FinishMixedStepInto { breakpoint: BreakpointId(3) });
        }
    }

    #[test]
    fn test_failed_high_resume_aborts_only_its_own_mixed_step() {
        let h = high();
        let failed = |breakpoint| Event::HighResumeFailed {
            context: h.clone(),
            breakpoint,
            reason: "pipe closed".to_string(),
        };
        let waiting = State::MixedStepIntoWaitingForHighResume { breakpoint: BreakpointId(2) };

        let aborted = plan(&waiting, &failed(BreakpointId(2))).unwrap();
        assert_eq!(
            aborted,
            Plan::AbortMixedStepInto { breakpoint: BreakpointId(2), high: h.clone() }
        );
        assert_eq!(aborted.target(), StateKind::OnlyHighStopped);

        assert!(plan(&waiting, &failed(BreakpointId(7))).is_err());
        let resumed = State::MixedStepIntoHighResumed { breakpoint: BreakpointId(2) };
        assert!(plan(&resumed, &failed(BreakpointId(2))).is_err());
    }

    #[test]
    fn test_resume_only_from_both_stopped() {
        let err = plan(&State::BothRunning, &Event::ResumeRequested).unwrap_err();
        match err {
            CoordinatorError::IllegalTransition { state, event } => {
                assert_eq!(state, StateKind::BothRunning);
                assert_eq!(event, EventKind::ResumeRequested);
            }
            other => panic!("Expected IllegalTransition, got {other:?}"),
        }
    }

    #[test]
    fn test_before_start_only_accepts_low_run() {
        assert!(plan(&State::BeforeStart, &Event::LowRun).is_ok());
        assert!(plan(&State::BeforeStart, &Event::HighRun).is_err());
        assert!(plan(&State::BeforeStart, &Event::StopRequested).is_err());
    }
}

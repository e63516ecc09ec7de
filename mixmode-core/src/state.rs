//! Joint status of the two backends and the events that move it.

use crate::context::{MergedSuspendContext, SuspendContext};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a temporary native breakpoint armed for a mixed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakpointId(pub u64);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp#{}", self.0)
    }
}

/// Step granularity requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Run to the next line, stepping over calls.
    Over,
    /// Step into the called function.
    Into,
    /// Run until the current function returns.
    Out,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Over => write!(f, "over"),
            Self::Into => write!(f, "into"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Steps that cross the low/high boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedStepKind {
    /// Step into a native function called from managed code.
    IntoLowFromHigh,
}

/// Current coordination state. Exactly one is current at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum State {
    /// No session has resumed yet.
    BeforeStart,
    /// Both backends run freely.
    BothRunning,
    /// High was asked to pause; waiting for its stop report.
    WaitingForHighPositionReached,
    /// High stopped and low was asked to pause.
    HighStoppedWaitingForLow { high: SuspendContext },
    /// Low stopped first and high was asked to pause.
    LowStoppedWaitingForHigh { low: SuspendContext },
    /// Low resumed on its own (a plain native step) while high stays stopped.
    OnlyHighStopped { high: SuspendContext },
    /// High stopped while a coordinated native step is still running.
    OnlyHighStoppedWaitingForLowStep { high: SuspendContext },
    /// High runs on its own while low stays stopped.
    OnlyLowStopped,
    /// A mixed step-into hit its native breakpoint; low runs every thread but
    /// the one that hit it, and high was asked to pause.
    WaitingForHighReachLowResumedExceptStoppedThread,
    /// The paused state visible to the outer session.
    BothStopped { low: SuspendContext, high: SuspendContext },
    /// A managed step was issued; low keeps its context.
    ManagedStepStarted { low: SuspendContext },
    /// High confirmed its step resume; waiting for the managed step to finish.
    HighResumedForStepOnlyLowStopped { low: SuspendContext },
    /// The temporary breakpoint is armed and low continued; high has not
    /// confirmed its resume yet.
    MixedStepIntoWaitingForHighResume { breakpoint: BreakpointId },
    /// High resumed for the mixed step; waiting for the breakpoint hit.
    MixedStepIntoHighResumed { breakpoint: BreakpointId },
    /// A native step that leaves into managed code was issued.
    LowLevelStepStarted { high: SuspendContext },
}

/// Payload-free discriminant of [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    BeforeStart,
    BothRunning,
    WaitingForHighPositionReached,
    HighStoppedWaitingForLow,
    LowStoppedWaitingForHigh,
    OnlyHighStopped,
    OnlyHighStoppedWaitingForLowStep,
    OnlyLowStopped,
    WaitingForHighReachLowResumedExceptStoppedThread,
    BothStopped,
    ManagedStepStarted,
    HighResumedForStepOnlyLowStopped,
    MixedStepIntoWaitingForHighResume,
    MixedStepIntoHighResumed,
    LowLevelStepStarted,
}

impl StateKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::BeforeStart,
        Self::BothRunning,
        Self::WaitingForHighPositionReached,
        Self::HighStoppedWaitingForLow,
        Self::LowStoppedWaitingForHigh,
        Self::OnlyHighStopped,
        Self::OnlyHighStoppedWaitingForLowStep,
        Self::OnlyLowStopped,
        Self::WaitingForHighReachLowResumedExceptStoppedThread,
        Self::BothStopped,
        Self::ManagedStepStarted,
        Self::HighResumedForStepOnlyLowStopped,
        Self::MixedStepIntoWaitingForHighResume,
        Self::MixedStepIntoHighResumed,
        Self::LowLevelStepStarted,
    ];
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl State {
    /// Tag of this state without its payload.
    pub const fn kind(&self) -> StateKind {
        match self {
            Self::BeforeStart => StateKind::BeforeStart,
            Self::BothRunning => StateKind::BothRunning,
            Self::WaitingForHighPositionReached => StateKind::WaitingForHighPositionReached,
            Self::HighStoppedWaitingForLow { .. } => StateKind::HighStoppedWaitingForLow,
            Self::LowStoppedWaitingForHigh { .. } => StateKind::LowStoppedWaitingForHigh,
            Self::OnlyHighStopped { .. } => StateKind::OnlyHighStopped,
            Self::OnlyHighStoppedWaitingForLowStep { .. } => {
                StateKind::OnlyHighStoppedWaitingForLowStep
            }
            Self::OnlyLowStopped => StateKind::OnlyLowStopped,
            Self::WaitingForHighReachLowResumedExceptStoppedThread => {
                StateKind::WaitingForHighReachLowResumedExceptStoppedThread
            }
            Self::BothStopped { .. } => StateKind::BothStopped,
            Self::ManagedStepStarted { .. } => StateKind::ManagedStepStarted,
            Self::HighResumedForStepOnlyLowStopped { .. } => {
                StateKind::HighResumedForStepOnlyLowStopped
            }
            Self::MixedStepIntoWaitingForHighResume { .. } => {
                StateKind::MixedStepIntoWaitingForHighResume
            }
            Self::MixedStepIntoHighResumed { .. } => StateKind::MixedStepIntoHighResumed,
            Self::LowLevelStepStarted { .. } => StateKind::LowLevelStepStarted,
        }
    }

    pub const fn is_both_stopped(&self) -> bool {
        matches!(self, Self::BothStopped { .. })
    }

    pub const fn is_both_running(&self) -> bool {
        matches!(self, Self::BothRunning)
    }

    /// Only `BothRunning` and `BothStopped` are ever shown to the outer session.
    pub const fn is_externally_visible(&self) -> bool {
        self.is_both_running() || self.is_both_stopped()
    }

    /// The merged context if both backends are stopped.
    pub fn merged_context(&self) -> Option<MergedSuspendContext> {
        match self {
            Self::BothStopped { low, high } => {
                Some(MergedSuspendContext::new(low.clone(), high.clone()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighStoppedWaitingForLow { high }
            | Self::OnlyHighStopped { high }
            | Self::OnlyHighStoppedWaitingForLowStep { high }
            | Self::LowLevelStepStarted { high } => {
                write!(f, "{}(high={} on {})", self.kind(), high.id, high.thread)
            }
            Self::LowStoppedWaitingForHigh { low }
            | Self::ManagedStepStarted { low }
            | Self::HighResumedForStepOnlyLowStopped { low } => {
                write!(f, "{}(low={} on {})", self.kind(), low.id, low.thread)
            }
            Self::BothStopped { low, high } => {
                write!(f, "BothStopped(low={}, high={})", low.id, high.id)
            }
            Self::MixedStepIntoWaitingForHighResume { breakpoint }
            | Self::MixedStepIntoHighResumed { breakpoint } => {
                write!(f, "{}({breakpoint})", self.kind())
            }
            _ => write!(f, "{}", self.kind()),
        }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The user asked to pause.
    StopRequested,
    /// The user asked to resume both backends.
    ResumeRequested,
    /// High reported a stop.
    HighPositionReached { context: SuspendContext },
    /// Low reported a stop.
    LowPositionReached { context: SuspendContext },
    /// Low reported that it resumed.
    LowRun,
    /// High reported that it resumed.
    HighRun,
    /// Step within managed code.
    HighStepRequested { context: SuspendContext, kind: StepKind },
    /// Step that crosses from managed into native code.
    MixedStepRequested { context: SuspendContext, kind: MixedStepKind },
    /// Step within native code.
    LowStepRequested { context: SuspendContext, kind: StepKind },
    /// The detached high resume of a mixed step-into failed. Raised by the
    /// executor itself, never by a backend.
    HighResumeFailed { context: SuspendContext, breakpoint: BreakpointId, reason: String },
}

/// Payload-free tag of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StopRequested,
    ResumeRequested,
    HighPositionReached,
    LowPositionReached,
    LowRun,
    HighRun,
    HighStepRequested,
    MixedStepRequested,
    LowStepRequested,
    HighResumeFailed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Event {
    /// Tag of this event without its payload.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StopRequested => EventKind::StopRequested,
            Self::ResumeRequested => EventKind::ResumeRequested,
            Self::HighPositionReached { .. } => EventKind::HighPositionReached,
            Self::LowPositionReached { .. } => EventKind::LowPositionReached,
            Self::LowRun => EventKind::LowRun,
            Self::HighRun => EventKind::HighRun,
            Self::HighStepRequested { .. } => EventKind::HighStepRequested,
            Self::MixedStepRequested { .. } => EventKind::MixedStepRequested,
            Self::LowStepRequested { .. } => EventKind::LowStepRequested,
            Self::HighResumeFailed { .. } => EventKind::HighResumeFailed,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighPositionReached { context } | Self::LowPositionReached { context } => {
                write!(f, "{}({} on {})", self.kind(), context.id, context.thread)
            }
            Self::HighStepRequested { context, kind }
            | Self::LowStepRequested { context, kind } => {
                write!(f, "{}({kind} from {})", self.kind(), context.id)
            }
            Self::MixedStepRequested { context, kind } => {
                write!(f, "MixedStepRequested({kind:?} from {})", context.id)
            }
            Self::HighResumeFailed { breakpoint, reason, .. } => {
                write!(f, "HighResumeFailed({breakpoint}: {reason})")
            }
            _ => write!(f, "{}", self.kind()),
        }
    }
}

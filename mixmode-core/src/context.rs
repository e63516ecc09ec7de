//! Suspend contexts reported by the two backends.
//!
//! Every context carries an explicit [`Origin`] decided when the backend creates
//! it, so the coordinator never has to guess which engine a context belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which debug engine produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// The native (unmanaged) debugger.
    Low,
    /// The managed (interpreted/JIT) debugger.
    High,
}

impl Origin {
    /// `true` for the native engine.
    pub const fn is_low(self) -> bool {
        matches!(self, Self::Low)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
        }
    }
}

/// OS-level thread identifier shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// A single stack frame as seen by one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    pub origin: Origin,
}

impl Frame {
    pub fn new(function: impl Into<String>, origin: Origin) -> Self {
        Self { function: function.into(), origin }
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque "the debuggee is stopped" handle produced by one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendContext {
    /// Unique per created context; two stops never share an id.
    pub id: u64,
    pub origin: Origin,
    pub thread: ThreadId,
    /// Innermost frame first.
    pub frames: Vec<Frame>,
    /// Origin of the function called at the current position, if the
    /// position is a call site.
    pub call_target: Option<Origin>,
}

impl SuspendContext {
    /// A context with a fresh id and no call-target hint.
    pub fn new(origin: Origin, thread: ThreadId, frames: Vec<Frame>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            thread,
            frames,
            call_target: None,
        }
    }

    /// Stop position reported by the native engine.
    pub fn low(thread: ThreadId, frames: Vec<Frame>) -> Self {
        Self::new(Origin::Low, thread, frames)
    }

    /// Stop position reported by the managed engine.
    pub fn high(thread: ThreadId, frames: Vec<Frame>) -> Self {
        Self::new(Origin::High, thread, frames)
    }

    /// Marks the current position as a call into code owned by `target`.
    #[must_use]
    pub fn with_call_target(mut self, target: Origin) -> Self {
        self.call_target = Some(target);
        self
    }

    pub const fn is_low(&self) -> bool {
        self.origin.is_low()
    }

    /// The frame the current frame returns to, if any.
    pub fn caller(&self) -> Option<&Frame> {
        self.frames.get(1)
    }
}

/// The single externally-visible paused state: both engines' contexts together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSuspendContext {
    pub low: SuspendContext,
    pub high: SuspendContext,
}

impl MergedSuspendContext {
    pub const fn new(low: SuspendContext, high: SuspendContext) -> Self {
        Self { low, high }
    }

    /// The thread the user is looking at. The managed engine decides which
    /// thread is "current" in a mixed session.
    pub const fn active_thread(&self) -> ThreadId {
        self.high.thread
    }

    /// Merged call stack of the active thread.
    ///
    /// Managed frames come first up to the first managed-to-native transition
    /// frame, then the native frames of the same thread. If the native engine
    /// stopped on another thread only the managed frames are returned.
    pub fn frames(&self) -> Vec<Frame> {
        if self.low.thread != self.high.thread {
            return self.high.frames.clone();
        }
        let mut merged: Vec<Frame> = self
            .high
            .frames
            .iter()
            .take_while(|f| f.origin == Origin::High)
            .cloned()
            .collect();
        merged.extend(self.low.frames.iter().cloned());
        merged
    }
}

//! In-process simulated backends.
//!
//! Both simulators record every call they receive, can be told to fail a
//! named operation, and optionally report what a real engine would report
//! (stops and resumes) on a shared notification channel. [`pump`] forwards
//! those reports into a [`SessionFacade`], which closes the loop the way the
//! real engines' callbacks do.

use crate::backend::{HighLevelBackend, Hook, LowLevelBackend};
use crate::context::{Frame, Origin, SuspendContext, ThreadId};
use crate::facade::SessionFacade;
use crate::state::{BreakpointId, StepKind};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A backend call as recorded by a simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pause,
    PauseUnblockingStoppedThread(ThreadId),
    ResumeAndWait,
    ContinueAllThreads { except_event_thread: bool },
    StartStep(StepKind),
    SetTemporaryBreakpoint(ThreadId),
    RemoveTemporaryBreakpoint(BreakpointId),
    UnblockStoppedThread(ThreadId),
    StoppedThreadId,
    BringManagedThreadsToUnblocked,
    NativeEntered(ThreadId),
}

/// What a simulated engine reports back to the session.
#[derive(Debug, Clone)]
pub enum Notification {
    PositionReached(SuspendContext),
    Resumed(Origin),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call log, failure injection and notification sink shared by both simulators.
struct Recorder {
    origin: Origin,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    refuse_resume: Mutex<bool>,
    notify: Option<mpsc::UnboundedSender<Notification>>,
}

impl Recorder {
    fn new(origin: Origin, notify: Option<mpsc::UnboundedSender<Notification>>) -> Self {
        Self {
            origin,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            refuse_resume: Mutex::new(false),
            notify,
        }
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<()> {
        debug!("sim {}: {call:?}", self.origin);
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(operation) {
            return Err(anyhow!("simulated {} failure in {operation}", self.origin));
        }
        Ok(())
    }

    fn emit(&self, notification: Notification) {
        if let Some(tx) = &self.notify {
            if tx.send(notification).is_err() {
                warn!("sim {}: nobody listens for notifications", self.origin);
            }
        }
    }

    fn resumed(&self) -> bool {
        let refused = *lock(&self.refuse_resume);
        if !refused {
            self.emit(Notification::Resumed(self.origin));
        }
        !refused
    }
}

/// Simulated native debugger.
pub struct SimulatedLowBackend {
    recorder: Recorder,
    next_breakpoint: AtomicU64,
    armed: Mutex<HashMap<BreakpointId, (ThreadId, Hook)>>,
    armed_total: AtomicU64,
    removed_total: AtomicU64,
}

impl SimulatedLowBackend {
    /// A simulator that only records calls.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A simulator that also reports stops and resumes on `notify`.
    pub fn with_notifications(notify: mpsc::UnboundedSender<Notification>) -> Self {
        Self::build(Some(notify))
    }

    fn build(notify: Option<mpsc::UnboundedSender<Notification>>) -> Self {
        Self {
            recorder: Recorder::new(Origin::Low, notify),
            next_breakpoint: AtomicU64::new(1),
            armed: Mutex::new(HashMap::new()),
            armed_total: AtomicU64::new(0),
            removed_total: AtomicU64::new(0),
        }
    }

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.recorder.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.recorder.calls).clear();
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.recorder.failing).insert(operation);
    }

    /// Make `resume_and_wait` report that the engine did not resume.
    pub fn refuse_resume(&self) {
        *lock(&self.recorder.refuse_resume) = true;
    }

    /// Temporary breakpoints armed so far.
    pub fn armed_breakpoints(&self) -> u64 {
        self.armed_total.load(Ordering::SeqCst)
    }

    /// Temporary breakpoints removed so far.
    pub fn removed_breakpoints(&self) -> u64 {
        self.removed_total.load(Ordering::SeqCst)
    }

    /// Stop on a native breakpoint the coordinator did not ask for.
    pub fn hit_user_breakpoint(&self, thread: ThreadId, function: &str) {
        self.recorder.emit(Notification::PositionReached(native_context(thread, function)));
    }

    /// Fire an armed temporary breakpoint: run its hook, then report the stop.
    pub async fn hit_temporary_breakpoint(&self, breakpoint: BreakpointId) -> Result<()> {
        let (thread, on_hit) = lock(&self.armed)
            .remove(&breakpoint)
            .ok_or_else(|| anyhow!("{breakpoint} is not armed"))?;
        on_hit().await?;
        self.recorder.emit(Notification::PositionReached(native_context(thread, "native_callee")));
        Ok(())
    }

    async fn step(&self, kind: StepKind, context: &SuspendContext) -> Result<()> {
        self.recorder.record("start_step", Call::StartStep(kind))?;
        self.recorder.emit(Notification::Resumed(Origin::Low));
        let stop = native_context(context.thread, "native_step");
        self.recorder.emit(Notification::PositionReached(stop));
        Ok(())
    }
}

impl Default for SimulatedLowBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LowLevelBackend for SimulatedLowBackend {
    async fn pause_unblocking_stopped_thread(
        &self,
        thread: ThreadId,
        on_unblock: Hook,
    ) -> Result<()> {
        self.recorder
            .record("pause_unblocking_stopped_thread", Call::PauseUnblockingStoppedThread(thread))?;
        on_unblock().await?;
        self.recorder.emit(Notification::PositionReached(native_context(thread, "native_wait")));
        Ok(())
    }

    async fn resume_and_wait(&self) -> Result<bool> {
        self.recorder.record("resume_and_wait", Call::ResumeAndWait)?;
        Ok(self.recorder.resumed())
    }

    async fn continue_all_threads(&self, except_event_thread: bool) -> Result<()> {
        self.recorder
            .record("continue_all_threads", Call::ContinueAllThreads { except_event_thread })
    }

    async fn start_step_over(&self, context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Over, context).await
    }

    async fn start_step_into(&self, context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Into, context).await
    }

    async fn start_step_out(&self, context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Out, context).await
    }

    async fn set_and_arm_temporary_breakpoint(
        &self,
        thread: ThreadId,
        on_hit: Hook,
    ) -> Result<BreakpointId> {
        self.recorder
            .record("set_and_arm_temporary_breakpoint", Call::SetTemporaryBreakpoint(thread))?;
        let breakpoint = BreakpointId(self.next_breakpoint.fetch_add(1, Ordering::SeqCst));
        lock(&self.armed).insert(breakpoint, (thread, on_hit));
        self.armed_total.fetch_add(1, Ordering::SeqCst);
        Ok(breakpoint)
    }

    async fn remove_temporary_breakpoint(&self, breakpoint: BreakpointId) -> Result<()> {
        self.recorder
            .record("remove_temporary_breakpoint", Call::RemoveTemporaryBreakpoint(breakpoint))?;
        lock(&self.armed).remove(&breakpoint);
        self.removed_total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unblock_stopped_thread(&self, thread: ThreadId) -> Result<()> {
        self.recorder.record("unblock_stopped_thread", Call::UnblockStoppedThread(thread))
    }
}

/// Simulated managed debugger. Stops on `thread` unless told otherwise.
pub struct SimulatedHighBackend {
    recorder: Recorder,
    thread: Mutex<ThreadId>,
}

impl SimulatedHighBackend {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_notifications(notify: mpsc::UnboundedSender<Notification>) -> Self {
        Self::build(Some(notify))
    }

    fn build(notify: Option<mpsc::UnboundedSender<Notification>>) -> Self {
        Self { recorder: Recorder::new(Origin::High, notify), thread: Mutex::new(ThreadId(1)) }
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.recorder.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.recorder.calls).clear();
    }

    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.recorder.failing).insert(operation);
    }

    pub fn refuse_resume(&self) {
        *lock(&self.recorder.refuse_resume) = true;
    }

    /// Thread later stops are reported on.
    pub fn set_thread(&self, thread: ThreadId) {
        *lock(&self.thread) = thread;
    }

    /// Stop on a managed breakpoint the coordinator did not ask for.
    pub fn hit_user_breakpoint(&self, function: &str) {
        let thread = *lock(&self.thread);
        self.recorder.emit(Notification::PositionReached(managed_context(thread, function)));
    }

    async fn step(&self, kind: StepKind) -> Result<()> {
        self.recorder.record("start_step", Call::StartStep(kind))?;
        let thread = *lock(&self.thread);
        self.recorder.emit(Notification::Resumed(Origin::High));
        self.recorder.emit(Notification::PositionReached(managed_context(thread, "Program.Step")));
        Ok(())
    }
}

impl Default for SimulatedHighBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HighLevelBackend for SimulatedHighBackend {
    async fn pause(&self) -> Result<()> {
        self.recorder.record("pause", Call::Pause)?;
        let thread = *lock(&self.thread);
        self.recorder.emit(Notification::PositionReached(managed_context(thread, "Program.Main")));
        Ok(())
    }

    async fn resume_and_wait(&self) -> Result<bool> {
        self.recorder.record("resume_and_wait", Call::ResumeAndWait)?;
        Ok(self.recorder.resumed())
    }

    async fn start_step_over(&self, _context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Over).await
    }

    async fn start_step_into(&self, _context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Into).await
    }

    async fn start_step_out(&self, _context: &SuspendContext) -> Result<()> {
        self.step(StepKind::Out).await
    }

    async fn stopped_thread_id(&self, context: &SuspendContext) -> Result<ThreadId> {
        self.recorder.record("stopped_thread_id", Call::StoppedThreadId)?;
        Ok(context.thread)
    }

    async fn bring_managed_threads_to_unblocked(&self) -> Result<()> {
        self.recorder
            .record("bring_managed_threads_to_unblocked", Call::BringManagedThreadsToUnblocked)
    }

    async fn native_entered(&self, thread: ThreadId) -> Result<()> {
        self.recorder.record("native_entered", Call::NativeEntered(thread))
    }
}

fn native_context(thread: ThreadId, function: &str) -> SuspendContext {
    SuspendContext::low(thread, vec![Frame::new(function, Origin::Low)])
}

fn managed_context(thread: ThreadId, function: &str) -> SuspendContext {
    SuspendContext::high(
        thread,
        vec![Frame::new(function, Origin::High), Frame::new("Program.<Main>$", Origin::High)],
    )
}

/// A pair of simulators reporting on one channel.
pub fn simulated_pair() -> (
    Arc<SimulatedLowBackend>,
    Arc<SimulatedHighBackend>,
    mpsc::UnboundedReceiver<Notification>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let low = Arc::new(SimulatedLowBackend::with_notifications(tx.clone()));
    let high = Arc::new(SimulatedHighBackend::with_notifications(tx));
    (low, high, rx)
}

/// Forward simulator reports into `facade` until every simulator is gone.
pub async fn pump(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    facade: Arc<SessionFacade>,
) {
    while let Some(notification) = notifications.recv().await {
        let result = match notification {
            Notification::PositionReached(context) => {
                facade.on_position_reached(context).await.map(|_| ())
            }
            Notification::Resumed(origin) => facade.on_session_resumed(origin).await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!("Notification rejected: {err}");
        }
    }
    debug!("Notification pump stopped");
}

//! The transition state machine.
//!
//! A single tokio task owns the current [`State`] and processes submitted
//! events strictly one at a time, in submission order. Backend calls made on
//! behalf of an event run inside that task, so no two transitions ever
//! interleave. The one backend call made outside it is the high resume that
//! a mixed step-into starts without waiting; see
//! [`HighLevelBackend::resume_and_wait`]. The state is only ever exposed as a
//! snapshot.

use crate::backend::{
    confirmed, BackendKind, BackendResultExt, HighLevelBackend, Hook, LowLevelBackend,
};
use crate::config::{CoordinatorConfig, IllegalTransitionPolicy};
use crate::context::{SuspendContext, ThreadId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::{BreakpointId, Event, EventKind, State};
use crate::transition::{self, Plan};
use crate::waiter::ConvergenceWaiter;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// A committed state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// Position in the commit order, starting at 1.
    pub seq: u64,
    /// State before the event.
    pub from: State,
    pub event: Event,
    /// State the event committed.
    pub to: State,
}

struct Envelope {
    event: Event,
    reply: oneshot::Sender<CoordinatorResult<State>>,
}

/// Outcome of a submitted event. Await it to learn the committed state or the
/// fault; dropping it is fine.
pub struct Submission {
    event: EventKind,
    reply: oneshot::Receiver<CoordinatorResult<State>>,
    state_rx: watch::Receiver<State>,
}

impl Submission {
    /// Kind of the submitted event.
    pub const fn event(&self) -> EventKind {
        self.event
    }

    /// The state committed by this event.
    pub async fn committed(self) -> CoordinatorResult<State> {
        self.reply.await.map_err(|_| CoordinatorError::MachineStopped)?
    }

    /// Like [`committed`](Self::committed), bounded by `timeout`. Timing out
    /// does not cancel the event.
    pub async fn committed_within(self, timeout: Duration) -> CoordinatorResult<State> {
        let event = self.event;
        let state_rx = self.state_rx.clone();
        match tokio::time::timeout(timeout, self.committed()).await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::ConvergenceTimeout {
                waiting_for: format!("{event} to be processed"),
                last_state: Box::new(state_rx.borrow().clone()),
            }),
        }
    }
}

/// Single authority over the joint low/high debug status.
pub struct TransitionStateMachine {
    events_tx: mpsc::UnboundedSender<Envelope>,
    state_rx: watch::Receiver<State>,
    waiter: ConvergenceWaiter,
}

impl TransitionStateMachine {
    /// Start the executor task. Must be called from within a tokio runtime.
    pub fn spawn(
        low: Arc<dyn LowLevelBackend>,
        high: Arc<dyn HighLevelBackend>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self::spawn_from(State::BeforeStart, low, high, config)
    }

    pub(crate) fn spawn_from(
        initial: State,
        low: Arc<dyn LowLevelBackend>,
        high: Arc<dyn HighLevelBackend>,
        config: &CoordinatorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial.clone());
        // A zero capacity makes `broadcast::channel` panic.
        let capacity = config.transition_log_capacity.max(1);
        let (transitions_tx, transitions_rx) = broadcast::channel(capacity);

        let executor = Executor {
            state: initial,
            low,
            high,
            policy: config.illegal_transition_policy,
            events: events_tx.downgrade(),
            state_tx,
            transitions_tx,
            seq: 0,
        };
        tokio::spawn(executor.run(events_rx));

        Self {
            events_tx,
            state_rx: state_rx.clone(),
            waiter: ConvergenceWaiter::new(state_rx, transitions_rx, config),
        }
    }

    /// Queue `event` behind any transition in flight. Returns immediately.
    pub fn submit(&self, event: Event) -> Submission {
        let kind = event.kind();
        let (reply_tx, reply_rx) = oneshot::channel();
        debug!("Submitting {event}");
        // If the executor is gone the reply sender is dropped with the
        // envelope and the submission resolves to `MachineStopped`.
        let _ = self.events_tx.send(Envelope { event, reply: reply_tx });
        Submission { event: kind, reply: reply_rx, state_rx: self.state_rx.clone() }
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> State {
        self.state_rx.borrow().clone()
    }

    /// Wait until the committed state satisfies `predicate`. Timing out leaves
    /// the machine untouched.
    pub async fn await_until<P>(&self, predicate: P, timeout: Duration) -> CoordinatorResult<State>
    where
        P: Fn(&State) -> bool,
    {
        self.waiter.wait_for(predicate, "state predicate", timeout).await
    }

    /// Every transition committed after this call, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.waiter.subscribe()
    }

    /// A waiter sharing this machine's channels.
    pub fn waiter(&self) -> ConvergenceWaiter {
        self.waiter.clone()
    }
}

struct Executor {
    state: State,
    low: Arc<dyn LowLevelBackend>,
    high: Arc<dyn HighLevelBackend>,
    policy: IllegalTransitionPolicy,
    /// Weak, so dropping every machine handle still stops the executor.
    events: mpsc::WeakUnboundedSender<Envelope>,
    state_tx: watch::Sender<State>,
    transitions_tx: broadcast::Sender<Transition>,
    seq: u64,
}

impl Executor {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { event, reply }) = events_rx.recv().await {
            let result = self.process(event).await;
            let _ = reply.send(result);
        }
        debug!("State machine stopped in {}", self.state);
    }

    async fn process(&mut self, event: Event) -> CoordinatorResult<State> {
        let plan = match transition::plan(&self.state, &event) {
            Ok(plan) => plan,
            Err(err) => {
                error!("{err} ({event} while {})", self.state);
                if self.policy == IllegalTransitionPolicy::ForceResume {
                    self.force_resume(event).await;
                }
                return Err(err);
            }
        };

        match self.execute(plan).await {
            Ok(next) => {
                self.commit(event, next.clone());
                Ok(next)
            }
            Err(err) => {
                error!("{err} ({event} while {}); state unchanged", self.state);
                Err(err)
            }
        }
    }

    fn commit(&mut self, event: Event, next: State) {
        self.seq += 1;
        let from = std::mem::replace(&mut self.state, next.clone());
        debug!("#{} {from} --{event}--> {next}", self.seq);
        if next.is_both_stopped() && !from.is_both_stopped() {
            info!("Both backends stopped: {next}");
        }
        self.state_tx.send_replace(next.clone());
        let _ = self.transitions_tx.send(Transition { seq: self.seq, from, event, to: next });
    }

    async fn force_resume(&mut self, event: Event) {
        let low = confirmed(self.low.resume_and_wait().await, BackendKind::Low);
        let high = confirmed(self.high.resume_and_wait().await, BackendKind::High);
        match low.and(high) {
            Ok(()) => {
                warn!("Forced both backends to resume after illegal {}", event.kind());
                self.commit(event, State::BothRunning);
            }
            Err(err) => error!("Forced resume failed: {err}"),
        }
    }

    async fn execute(&self, plan: Plan) -> CoordinatorResult<State> {
        match plan {
            Plan::Commit(next) => Ok(next),
            Plan::PauseHigh { next } => {
                self.high.pause().await.on_backend(BackendKind::High, "pause")?;
                Ok(next)
            }
            Plan::PauseLowForHigh { high } => {
                let thread = self.stopped_thread(&high).await?;
                self.low
                    .pause_unblocking_stopped_thread(thread, self.unblock_hook())
                    .await
                    .on_backend(BackendKind::Low, "pause_unblocking_stopped_thread")?;
                Ok(State::HighStoppedWaitingForLow { high })
            }
            Plan::UnblockForHigh { low, high } => {
                let thread = self.stopped_thread(&high).await?;
                self.low
                    .unblock_stopped_thread(thread)
                    .await
                    .on_backend(BackendKind::Low, "unblock_stopped_thread")?;
                Ok(State::BothStopped { low, high })
            }
            Plan::ResumeBoth => {
                confirmed(self.low.resume_and_wait().await, BackendKind::Low)?;
                confirmed(self.high.resume_and_wait().await, BackendKind::High)?;
                Ok(State::BothRunning)
            }
            Plan::StartManagedStep { low, context, kind } => {
                self.low
                    .continue_all_threads(false)
                    .await
                    .on_backend(BackendKind::Low, "continue_all_threads")?;
                self.high
                    .start_step(kind, &context)
                    .await
                    .on_backend(BackendKind::High, "start_step")?;
                Ok(State::ManagedStepStarted { low })
            }
            Plan::StartLowStep { high, context, kind } => {
                self.low
                    .start_step(kind, &context)
                    .await
                    .on_backend(BackendKind::Low, "start_step")?;
                Ok(State::LowLevelStepStarted { high })
            }
            Plan::StartMixedStepInto { context } => {
                let thread = self.stopped_thread(&context).await?;
                let breakpoint = self
                    .low
                    .set_and_arm_temporary_breakpoint(thread, self.native_entered_hook(thread))
                    .await
                    .on_backend(BackendKind::Low, "set_and_arm_temporary_breakpoint")?;

                if let Err(err) = self
                    .low
                    .continue_all_threads(false)
                    .await
                    .on_backend(BackendKind::Low, "continue_all_threads")
                {
                    if let Err(cleanup) = self.low.remove_temporary_breakpoint(breakpoint).await {
                        warn!(
                            "Failed to remove {breakpoint} after aborted mixed step: {cleanup:#}"
                        );
                    }
                    return Err(err);
                }

                self.resume_high_detached(context, breakpoint);
                Ok(State::MixedStepIntoWaitingForHighResume { breakpoint })
            }
            Plan::FinishMixedStepInto { breakpoint } => {
                self.low
                    .remove_temporary_breakpoint(breakpoint)
                    .await
                    .on_backend(BackendKind::Low, "remove_temporary_breakpoint")?;
                self.low
                    .continue_all_threads(true)
                    .await
                    .on_backend(BackendKind::Low, "continue_all_threads")?;
                self.high.pause().await.on_backend(BackendKind::High, "pause")?;
                Ok(State::WaitingForHighReachLowResumedExceptStoppedThread)
            }
            Plan::AbortMixedStepInto { breakpoint, high } => {
                if let Err(err) = self.low.remove_temporary_breakpoint(breakpoint).await {
                    warn!("Failed to remove {breakpoint} after aborted mixed step: {err:#}");
                }
                Ok(State::OnlyHighStopped { high })
            }
        }
    }

    async fn stopped_thread(&self, context: &SuspendContext) -> CoordinatorResult<ThreadId> {
        self.high
            .stopped_thread_id(context)
            .await
            .on_backend(BackendKind::High, "stopped_thread_id")
    }

    fn unblock_hook(&self) -> Hook {
        let high = Arc::clone(&self.high);
        Box::new(move || async move { high.bring_managed_threads_to_unblocked().await }.boxed())
    }

    fn native_entered_hook(&self, thread: ThreadId) -> Hook {
        let high = Arc::clone(&self.high);
        Box::new(move || async move { high.native_entered(thread).await }.boxed())
    }

    /// The high engine reports a successful resume through its own
    /// notification, so the executor does not wait for it. A failed resume
    /// comes back as `HighResumeFailed` and is planned like any other event.
    fn resume_high_detached(&self, context: SuspendContext, breakpoint: BreakpointId) {
        let high = Arc::clone(&self.high);
        let events = self.events.clone();
        tokio::spawn(async move {
            let reason = match confirmed(high.resume_and_wait().await, BackendKind::High) {
                Ok(()) => {
                    debug!("High-level backend resumed for mixed step");
                    return;
                }
                Err(CoordinatorError::BackendOperationFailed { source, .. }) => {
                    format!("{source:#}")
                }
                Err(err) => err.to_string(),
            };
            warn!("High-level resume for mixed step failed: {reason}");

            let Some(events) = events.upgrade() else {
                debug!("State machine gone before {breakpoint} could be dropped");
                return;
            };
            let (reply, outcome) = oneshot::channel();
            let event = Event::HighResumeFailed { context, breakpoint, reason };
            if events.send(Envelope { event, reply }).is_ok() {
                if let Ok(Err(err)) = outcome.await {
                    warn!("Could not abort mixed step on {breakpoint}: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Call, SimulatedHighBackend, SimulatedLowBackend};
    use crate::state::{BreakpointId, MixedStepKind, StateKind, StepKind};

    fn low_ctx() -> SuspendContext {
        SuspendContext::low(ThreadId(1), vec![])
    }

    fn high_ctx() -> SuspendContext {
        SuspendContext::high(ThreadId(1), vec![])
    }

    fn sample_state(kind: StateKind) -> State {
        match kind {
            StateKind::BeforeStart => State::BeforeStart,
            StateKind::BothRunning => State::BothRunning,
            StateKind::WaitingForHighPositionReached => State::WaitingForHighPositionReached,
            StateKind::HighStoppedWaitingForLow => {
                State::HighStoppedWaitingForLow { high: high_ctx() }
            }
            StateKind::LowStoppedWaitingForHigh => {
                State::LowStoppedWaitingForHigh { low: low_ctx() }
            }
            StateKind::OnlyHighStopped => State::OnlyHighStopped { high: high_ctx() },
            StateKind::OnlyHighStoppedWaitingForLowStep => {
                State::OnlyHighStoppedWaitingForLowStep { high: high_ctx() }
            }
            StateKind::OnlyLowStopped => State::OnlyLowStopped,
            StateKind::WaitingForHighReachLowResumedExceptStoppedThread => {
                State::WaitingForHighReachLowResumedExceptStoppedThread
            }
            StateKind::BothStopped => State::BothStopped { low: low_ctx(), high: high_ctx() },
            StateKind::ManagedStepStarted => State::ManagedStepStarted { low: low_ctx() },
            StateKind::HighResumedForStepOnlyLowStopped => {
                State::HighResumedForStepOnlyLowStopped { low: low_ctx() }
            }
            StateKind::MixedStepIntoWaitingForHighResume => {
                State::MixedStepIntoWaitingForHighResume { breakpoint: BreakpointId(1) }
            }
            StateKind::MixedStepIntoHighResumed => {
                State::MixedStepIntoHighResumed { breakpoint: BreakpointId(1) }
            }
            StateKind::LowLevelStepStarted => State::LowLevelStepStarted { high: high_ctx() },
        }
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::StopRequested,
            Event::ResumeRequested,
            Event::HighPositionReached { context: high_ctx() },
            Event::LowPositionReached { context: low_ctx() },
            Event::LowRun,
            Event::HighRun,
            Event::HighStepRequested { context: high_ctx(), kind: StepKind::Over },
            Event::MixedStepRequested {
                context: high_ctx(),
                kind: MixedStepKind::IntoLowFromHigh,
            },
            Event::LowStepRequested { context: low_ctx(), kind: StepKind::Out },
            Event::HighResumeFailed {
                context: high_ctx(),
                breakpoint: BreakpointId(1),
                reason: "pipe closed".to_string(),
            },
        ]
    }

    fn spawn_in(
        state: State,
        config: &CoordinatorConfig,
    ) -> (TransitionStateMachine, Arc<SimulatedLowBackend>, Arc<SimulatedHighBackend>) {
        let low = Arc::new(SimulatedLowBackend::new());
        let high = Arc::new(SimulatedHighBackend::new());
        let machine = TransitionStateMachine::spawn_from(state, low.clone(), high.clone(), config);
        (machine, low, high)
    }

    #[tokio::test]
    async fn test_every_undefined_pair_is_rejected_without_side_effects() {
        let config = CoordinatorConfig::default();
        let mut legal = 0;
        for kind in StateKind::ALL {
            for event in sample_events() {
                let state = sample_state(kind);
                if transition::plan(&state, &event).is_ok() {
                    legal += 1;
                    continue;
                }
                let (machine, low, high) = spawn_in(state.clone(), &config);
                let err = machine.submit(event.clone()).committed().await.unwrap_err();
                assert!(err.is_illegal_transition(), "{kind} + {event}: {err}");
                assert_eq!(machine.current(), state);
                assert!(low.calls().is_empty(), "{kind} + {event} called low backend");
                assert!(high.calls().is_empty(), "{kind} + {event} called high backend");
            }
        }
        assert_eq!(legal, 34);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_state() {
        let (machine, low, high) =
            spawn_in(State::BothStopped { low: low_ctx(), high: high_ctx() }, &Default::default());
        high.fail_on("resume_and_wait");

        let err = machine.submit(Event::ResumeRequested).committed().await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::BackendOperationFailed { backend: BackendKind::High, .. }
        ));
        assert!(machine.current().is_both_stopped());
        assert_eq!(low.calls(), vec![Call::ResumeAndWait]);
    }

    #[tokio::test]
    async fn test_unconfirmed_resume_is_a_failure() {
        let (machine, low, _high) =
            spawn_in(State::BothStopped { low: low_ctx(), high: high_ctx() }, &Default::default());
        low.refuse_resume();

        let err = machine.submit(Event::ResumeRequested).committed().await.unwrap_err();
        assert!(err.to_string().contains("did not confirm"));
        assert!(machine.current().is_both_stopped());
    }

    #[tokio::test]
    async fn test_force_resume_policy() {
        let config = CoordinatorConfig {
            illegal_transition_policy: IllegalTransitionPolicy::ForceResume,
            ..Default::default()
        };
        let (machine, low, high) = spawn_in(State::OnlyLowStopped, &config);

        let err = machine.submit(Event::StopRequested).committed().await.unwrap_err();
        assert!(err.is_illegal_transition());
        assert_eq!(machine.current(), State::BothRunning);
        assert_eq!(low.calls(), vec![Call::ResumeAndWait]);
        assert_eq!(high.calls(), vec![Call::ResumeAndWait]);
    }

    #[tokio::test]
    async fn test_aborted_mixed_step_removes_breakpoint() {
        let (machine, low, _high) =
            spawn_in(State::BothStopped { low: low_ctx(), high: high_ctx() }, &Default::default());
        low.fail_on("continue_all_threads");

        let event =
            Event::MixedStepRequested { context: high_ctx(), kind: MixedStepKind::IntoLowFromHigh };
        assert!(machine.submit(event).committed().await.is_err());
        assert!(machine.current().is_both_stopped());
        assert_eq!(low.armed_breakpoints(), 1);
        assert_eq!(low.removed_breakpoints(), 1);
    }

    async fn mixed_step_with_failing_resume(
        configure: impl FnOnce(&SimulatedHighBackend),
    ) -> (TransitionStateMachine, Arc<SimulatedLowBackend>, SuspendContext, Vec<Transition>) {
        let high_ctx = high_ctx();
        let stopped = State::BothStopped { low: low_ctx(), high: high_ctx.clone() };
        let (machine, low, high) = spawn_in(stopped, &Default::default());
        configure(&*high);
        let mut rx = machine.subscribe();

        let event = Event::MixedStepRequested {
            context: high_ctx.clone(),
            kind: MixedStepKind::IntoLowFromHigh,
        };
        let started = machine.submit(event).committed().await.unwrap();
        assert_eq!(started.kind(), StateKind::MixedStepIntoWaitingForHighResume);

        machine
            .await_until(|s| s.kind() == StateKind::OnlyHighStopped, Duration::from_secs(5))
            .await
            .unwrap();
        let log = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        (machine, low, high_ctx, log)
    }

    #[tokio::test]
    async fn test_failed_mixed_step_resume_drops_breakpoint() {
        let (machine, low, high_ctx, log) =
            mixed_step_with_failing_resume(|high| high.fail_on("resume_and_wait")).await;

        assert_eq!(machine.current(), State::OnlyHighStopped { high: high_ctx });
        assert_eq!(low.armed_breakpoints(), 1);
        assert_eq!(low.removed_breakpoints(), 1);
        match &log[1].event {
            Event::HighResumeFailed { breakpoint, reason, .. } => {
                assert_eq!(*breakpoint, BreakpointId(1));
                assert!(reason.contains("resume_and_wait"), "{reason}");
            }
            other => panic!("Expected HighResumeFailed, got {other}"),
        }

        // Native threads run on; the session can still be stopped as a whole.
        let low_stop = machine.submit(Event::LowPositionReached { context: low_ctx() });
        assert!(low_stop.committed().await.unwrap().is_both_stopped());
    }

    #[tokio::test]
    async fn test_unconfirmed_mixed_step_resume_drops_breakpoint() {
        let (_machine, low, _high_ctx, log) =
            mixed_step_with_failing_resume(SimulatedHighBackend::refuse_resume).await;

        assert_eq!(low.removed_breakpoints(), 1);
        assert_eq!(log[1].event.kind(), EventKind::HighResumeFailed);
        assert!(log[1].event.to_string().contains("did not confirm"));
    }

    #[tokio::test]
    async fn test_await_until_resolves_on_commit() {
        let (machine, _low, _high) = spawn_in(State::BeforeStart, &Default::default());
        let waiting = machine.await_until(State::is_both_running, Duration::from_secs(5));
        let _ = machine.submit(Event::LowRun);
        assert_eq!(waiting.await.unwrap(), State::BothRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_until_timeout_leaves_transient_state() {
        let (machine, _low, high) = spawn_in(State::BothRunning, &Default::default());
        machine.submit(Event::StopRequested).committed().await.unwrap();

        let err = machine
            .await_until(State::is_both_stopped, Duration::from_millis(300))
            .await
            .unwrap_err();
        match err {
            CoordinatorError::ConvergenceTimeout { last_state, .. } => {
                assert_eq!(*last_state, State::WaitingForHighPositionReached);
            }
            other => panic!("Expected ConvergenceTimeout, got {other:?}"),
        }
        assert_eq!(machine.current(), State::WaitingForHighPositionReached);
        assert_eq!(high.calls(), vec![Call::Pause]);
    }

    #[tokio::test]
    async fn test_zero_log_capacity_still_publishes() {
        let config = CoordinatorConfig { transition_log_capacity: 0, ..Default::default() };
        let (machine, _low, _high) = spawn_in(State::BeforeStart, &config);
        let mut rx = machine.subscribe();

        machine.submit(Event::LowRun).committed().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().to, State::BothRunning);
    }

    #[tokio::test]
    async fn test_transitions_are_numbered_in_commit_order() {
        let (machine, _low, _high) = spawn_in(State::BeforeStart, &Default::default());
        let mut rx = machine.subscribe();

        let _ = machine.submit(Event::LowRun);
        let _ = machine.submit(Event::HighRun);
        machine.submit(Event::StopRequested).committed().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq, third.seq), (1, 2, 3));
        assert_eq!(first.from, State::BeforeStart);
        assert_eq!(second.from, first.to);
        assert_eq!(third.to, State::WaitingForHighPositionReached);
    }

    #[tokio::test]
    async fn test_submission_reports_committed_state() {
        let (machine, _low, _high) = spawn_in(State::BeforeStart, &Default::default());
        let submission = machine.submit(Event::LowRun);
        assert_eq!(submission.event(), EventKind::LowRun);
        assert_eq!(submission.committed().await.unwrap(), State::BothRunning);
    }
}

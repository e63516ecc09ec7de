//! Scripted mixed-mode scenarios run against the simulated backends.

use anyhow::{anyhow, ensure, Result};
use clap::ValueEnum;
use log::{debug, info};
use mixmode_core::sim::{self, SimulatedHighBackend, SimulatedLowBackend};
use mixmode_core::{
    CoordinatorConfig, Frame, Origin, SessionFacade, State, StateKind, SuspendContext, ThreadId,
    Transition,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A scripted session run against the simulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Pause a running session
    Stop,
    /// Pause, resume and pause again
    ResumeCycle,
    /// Managed step over while native threads keep running
    ManagedStep,
    /// Step out of native code into its managed caller
    LowStep,
    /// Step from managed code into a native callee
    MixedStep,
    /// Native breakpoint hit while both engines run
    NativeBreakpoint,
    /// Every scenario above, in order
    All,
}

impl Scenario {
    const EACH: [Self; 6] = [
        Self::Stop,
        Self::ResumeCycle,
        Self::ManagedStep,
        Self::LowStep,
        Self::MixedStep,
        Self::NativeBreakpoint,
    ];

    /// The scenarios `self` stands for.
    pub fn expand(self) -> Vec<Self> {
        match self {
            Self::All => Self::EACH.to_vec(),
            single => vec![single],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ResumeCycle => "resume-cycle",
            Self::ManagedStep => "managed-step",
            Self::LowStep => "low-step",
            Self::MixedStep => "mixed-step",
            Self::NativeBreakpoint => "native-breakpoint",
            Self::All => "all",
        }
    }
}

/// Summary line printed after each scenario.
#[derive(Debug, Serialize)]
pub struct Report {
    pub scenario: &'static str,
    pub passed: bool,
    /// Number of committed transitions.
    pub transitions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one scenario: the committed transition log and the failure, if
/// any. The log is kept on failure too.
pub struct Outcome {
    pub scenario: Scenario,
    pub transitions: Vec<Transition>,
    pub error: Option<anyhow::Error>,
}

impl Outcome {
    pub fn report(&self) -> Report {
        Report {
            scenario: self.scenario.name(),
            passed: self.error.is_none(),
            transitions: self.transitions.len(),
            error: self.error.as_ref().map(|e| format!("{e:#}")),
        }
    }
}

/// Collects committed transitions while the scenario waits on them.
struct TransitionLog {
    rx: broadcast::Receiver<Transition>,
    seen: Vec<Transition>,
    limit: Duration,
}

impl TransitionLog {
    async fn until<P>(&mut self, predicate: P, what: &str) -> Result<State>
    where
        P: Fn(&State) -> bool,
    {
        let deadline = tokio::time::Instant::now() + self.limit;
        loop {
            let transition = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .map_err(|_| anyhow!("timed out waiting for {what}"))?
                .map_err(|e| anyhow!("transition log failed while waiting for {what}: {e}"))?;
            let to = transition.to.clone();
            self.seen.push(transition);
            if predicate(&to) {
                return Ok(to);
            }
        }
    }

    fn drain(mut self) -> Vec<Transition> {
        while let Ok(transition) = self.rx.try_recv() {
            self.seen.push(transition);
        }
        self.seen
    }
}

struct Session {
    facade: Arc<SessionFacade>,
    low: Arc<SimulatedLowBackend>,
    log: TransitionLog,
}

impl Session {
    fn new(config: &CoordinatorConfig) -> Self {
        let (low, high, notifications) = sim::simulated_pair();
        let facade = Arc::new(SessionFacade::new(low.clone(), high, config));
        tokio::spawn(sim::pump(notifications, facade.clone()));
        let log = TransitionLog {
            rx: facade.machine().subscribe(),
            seen: Vec::new(),
            limit: config.convergence_timeout(),
        };
        Self { facade, low, log }
    }

    async fn start(&mut self) -> Result<()> {
        let absorbed = self.facade.on_session_resumed(Origin::Low).await?;
        ensure!(!absorbed, "session start was absorbed by the coordinator");
        self.log.until(State::is_both_running, "the session to start").await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.facade.pause().await?;
        self.log.until(State::is_both_stopped, "both backends to stop").await?;
        Ok(())
    }

    fn stopped_context(&self) -> Result<mixmode_core::MergedSuspendContext> {
        let state = self.facade.state();
        state.merged_context().ok_or_else(|| anyhow!("expected both backends stopped, got {state}"))
    }
}

/// Run `scenario` on a fresh session. Never fails; the error lands in the
/// outcome.
pub async fn run(scenario: Scenario, config: &CoordinatorConfig) -> Outcome {
    info!("Running scenario {}", scenario.name());
    let mut session = Session::new(config);
    let result = drive(scenario, &mut session).await;
    let transitions = session.log.drain();
    debug!("Scenario {} committed {} transitions", scenario.name(), transitions.len());
    Outcome { scenario, transitions, error: result.err() }
}

async fn drive(scenario: Scenario, s: &mut Session) -> Result<()> {
    s.start().await?;
    match scenario {
        Scenario::Stop => s.stop().await,
        Scenario::ResumeCycle => {
            s.stop().await?;
            let first = s.stopped_context()?;
            s.facade.resume().await?;
            s.log.until(State::is_both_running, "both backends to run").await?;
            s.stop().await?;
            let second = s.stopped_context()?;
            ensure!(first.high.id != second.high.id, "second stop reused the managed context");
            ensure!(first.low.id != second.low.id, "second stop reused the native context");
            Ok(())
        }
        Scenario::ManagedStep => {
            s.stop().await?;
            let before = s.stopped_context()?;
            s.facade.step_over(&before.high).await?;
            s.log.until(State::is_both_stopped, "the managed step to finish").await?;
            let after = s.stopped_context()?;
            ensure!(after.low.id == before.low.id, "managed step replaced the native context");
            Ok(())
        }
        Scenario::LowStep => {
            s.stop().await?;
            let before = s.stopped_context()?;
            let native = SuspendContext::low(
                before.low.thread,
                vec![Frame::new("native_add", Origin::Low), before.high.frames[0].clone()],
            );
            s.facade.step_out(&native).await?;
            s.log.until(State::is_both_stopped, "the native step to finish").await?;
            Ok(())
        }
        Scenario::MixedStep => {
            s.stop().await?;
            let before = s.stopped_context()?;
            s.facade.step_into(&before.high.clone().with_call_target(Origin::Low)).await?;
            let state = s
                .log
                .until(|st| st.kind() == StateKind::MixedStepIntoHighResumed, "high to resume")
                .await?;
            let State::MixedStepIntoHighResumed { breakpoint } = state else {
                return Err(anyhow!("unexpected state {state}"));
            };
            s.low.hit_temporary_breakpoint(breakpoint).await?;
            s.log.until(State::is_both_stopped, "the mixed step to finish").await?;
            ensure!(
                s.low.armed_breakpoints() == 1 && s.low.removed_breakpoints() == 1,
                "temporary breakpoint armed {} and removed {} times",
                s.low.armed_breakpoints(),
                s.low.removed_breakpoints()
            );
            Ok(())
        }
        Scenario::NativeBreakpoint => {
            s.low.hit_user_breakpoint(ThreadId(1), "native_fault");
            s.log.until(State::is_both_stopped, "both backends to stop").await?;
            Ok(())
        }
        Scenario::All => Err(anyhow!("expand `all` before running it")),
    }
}

/// One transition as printed by the CLI.
pub fn format_transition(transition: &Transition) -> String {
    format!(
        "#{:<3} {} --{}--> {}",
        transition.seq, transition.from, transition.event, transition.to
    )
}

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use mixmode_core::sim::{self, SimulatedHighBackend, SimulatedLowBackend};
use mixmode_core::{
    CoordinatorConfig, EventKind, MergedSuspendContext, SessionFacade, SessionListener, State,
    Transition,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
pub struct RecordingListener {
    stops: Mutex<Vec<MergedSuspendContext>>,
}

impl RecordingListener {
    pub fn stops(&self) -> Vec<MergedSuspendContext> {
        self.stops.lock().unwrap().clone()
    }
}

impl SessionListener for RecordingListener {
    fn on_both_stopped(&self, context: &MergedSuspendContext) {
        self.stops.lock().unwrap().push(context.clone());
    }
}

pub struct Harness {
    pub facade: Arc<SessionFacade>,
    pub low: Arc<SimulatedLowBackend>,
    pub high: Arc<SimulatedHighBackend>,
    pub listener: Arc<RecordingListener>,
}

pub fn short_config() -> CoordinatorConfig {
    CoordinatorConfig { convergence_timeout_ms: 2_000, ..Default::default() }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulators that only record; the test submits every report itself.
pub fn manual(config: &CoordinatorConfig) -> Harness {
    init_logging();
    let low = Arc::new(SimulatedLowBackend::new());
    let high = Arc::new(SimulatedHighBackend::new());
    let listener = Arc::new(RecordingListener::default());
    let facade = SessionFacade::new(low.clone(), high.clone(), config)
        .with_listener(listener.clone());
    Harness { facade: Arc::new(facade), low, high, listener }
}

/// Simulators whose reports are pumped back into the facade.
pub fn automatic(config: &CoordinatorConfig) -> Harness {
    init_logging();
    let (low, high, notifications) = sim::simulated_pair();
    let listener = Arc::new(RecordingListener::default());
    let facade = Arc::new(
        SessionFacade::new(low.clone(), high.clone(), config).with_listener(listener.clone()),
    );
    tokio::spawn(sim::pump(notifications, facade.clone()));
    Harness { facade, low, high, listener }
}

impl Harness {
    /// Report the session start and wait until both backends run.
    pub async fn start(&self) {
        let forwarded = !self.facade.on_session_resumed(mixmode_core::Origin::Low).await.unwrap();
        assert!(forwarded, "session start must reach the outer session");
        assert_eq!(self.facade.state(), State::BothRunning);
    }

    pub async fn wait_for<P>(&self, predicate: P, what: &str) -> State
    where
        P: Fn(&State) -> bool,
    {
        self.facade
            .waiter()
            .wait_for(predicate, what, Duration::from_secs(5))
            .await
            .unwrap_or_else(|e| panic!("{e}"))
    }
}

/// Read committed transitions until one caused by `event` shows up.
pub async fn next_caused_by(
    rx: &mut broadcast::Receiver<Transition>,
    event: EventKind,
) -> Transition {
    loop {
        let transition = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timeout waiting for transition")
            .expect("Transition log closed");
        if transition.event.kind() == event {
            return transition;
        }
    }
}

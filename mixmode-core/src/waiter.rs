//! Waiting for the coordination state to reach a given shape.

use crate::config::{CoordinatorConfig, WaitStrategy};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::machine::Transition;
use crate::state::State;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

/// Suspends callers until a committed state satisfies their predicate.
///
/// Waiting never occupies the state machine's executor, and giving up on a
/// wait never rolls back a committed transition.
pub struct ConvergenceWaiter {
    state_rx: watch::Receiver<State>,
    transitions: broadcast::Receiver<Transition>,
    strategy: WaitStrategy,
    poll_interval: Duration,
}

impl Clone for ConvergenceWaiter {
    fn clone(&self) -> Self {
        Self {
            state_rx: self.state_rx.clone(),
            transitions: self.transitions.resubscribe(),
            strategy: self.strategy,
            poll_interval: self.poll_interval,
        }
    }
}

impl ConvergenceWaiter {
    pub(crate) fn new(
        state_rx: watch::Receiver<State>,
        transitions: broadcast::Receiver<Transition>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            state_rx,
            transitions,
            strategy: config.wait_strategy,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn current(&self) -> State {
        self.state_rx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.resubscribe()
    }

    /// Resolve with the first state matching `predicate`, checking the current
    /// state first. `waiting_for` describes the predicate in the timeout error.
    pub async fn wait_for<P>(
        &self,
        predicate: P,
        waiting_for: &str,
        timeout: Duration,
    ) -> CoordinatorResult<State>
    where
        P: Fn(&State) -> bool,
    {
        let wait = async {
            match self.strategy {
                WaitStrategy::Broadcast => self.wait_broadcast(&predicate).await,
                WaitStrategy::Poll => self.wait_poll(&predicate).await,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let last_state = self.current();
                warn!(
                    "Timed out after {timeout:?} waiting for {waiting_for}, state is {last_state}"
                );
                Err(CoordinatorError::ConvergenceTimeout {
                    waiting_for: waiting_for.to_string(),
                    last_state: Box::new(last_state),
                })
            }
        }
    }

    async fn wait_broadcast<P>(&self, predicate: &P) -> CoordinatorResult<State>
    where
        P: Fn(&State) -> bool,
    {
        // Subscribe before reading the snapshot so no commit falls in between.
        let mut rx = self.transitions.resubscribe();
        let current = self.current();
        if predicate(&current) {
            return Ok(current);
        }

        loop {
            match rx.recv().await {
                Ok(transition) => {
                    if predicate(&transition.to) {
                        return Ok(transition.to);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Convergence waiter lagged by {skipped} transitions");
                    let current = self.current();
                    if predicate(&current) {
                        return Ok(current);
                    }
                }
                Err(RecvError::Closed) => return Err(CoordinatorError::MachineStopped),
            }
        }
    }

    async fn wait_poll<P>(&self, predicate: &P) -> CoordinatorResult<State>
    where
        P: Fn(&State) -> bool,
    {
        loop {
            let current = self.current();
            if predicate(&current) {
                return Ok(current);
            }
            if self.state_rx.has_changed().is_err() {
                return Err(CoordinatorError::MachineStopped);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Event;

    fn channels() -> (
        watch::Sender<State>,
        broadcast::Sender<Transition>,
        watch::Receiver<State>,
        broadcast::Receiver<Transition>,
    ) {
        let (state_tx, state_rx) = watch::channel(State::BeforeStart);
        let (transitions_tx, transitions_rx) = broadcast::channel(16);
        (state_tx, transitions_tx, state_rx, transitions_rx)
    }

    fn publish(state_tx: &watch::Sender<State>, tx: &broadcast::Sender<Transition>, to: State) {
        let from = state_tx.send_replace(to.clone());
        let _ = tx.send(Transition { seq: 1, from, event: Event::LowRun, to });
    }

    #[tokio::test]
    async fn test_resolves_immediately_on_current_state() {
        let (_state_tx, _tx, state_rx, rx) = channels();
        let waiter = ConvergenceWaiter::new(state_rx, rx, &CoordinatorConfig::default());
        let state = waiter
            .wait_for(
                |s| matches!(s, State::BeforeStart),
                "before start",
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(state, State::BeforeStart);
    }

    #[tokio::test]
    async fn test_broadcast_sees_transient_state() {
        let (state_tx, tx, state_rx, rx) = channels();
        let waiter = ConvergenceWaiter::new(state_rx, rx, &CoordinatorConfig::default());

        let wait = tokio::spawn({
            let waiter = waiter.clone();
            async move {
                waiter
                    .wait_for(|s| s.is_both_running(), "both running", Duration::from_secs(5))
                    .await
            }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // BothRunning is immediately replaced; the waiter must still see it.
        publish(&state_tx, &tx, State::BothRunning);
        publish(&state_tx, &tx, State::WaitingForHighPositionReached);

        let state = wait.await.unwrap().unwrap();
        assert_eq!(state, State::BothRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_strategy_times_out() {
        let (_state_tx, _tx, state_rx, rx) = channels();
        let config = CoordinatorConfig { wait_strategy: WaitStrategy::Poll, ..Default::default() };
        let waiter = ConvergenceWaiter::new(state_rx, rx, &config);

        let err = waiter
            .wait_for(|s| s.is_both_stopped(), "both stopped", Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            CoordinatorError::ConvergenceTimeout { waiting_for, last_state } => {
                assert_eq!(waiting_for, "both stopped");
                assert_eq!(*last_state, State::BeforeStart);
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_strategy_sees_committed_state() {
        let (state_tx, tx, state_rx, rx) = channels();
        let config = CoordinatorConfig { wait_strategy: WaitStrategy::Poll, ..Default::default() };
        let waiter = ConvergenceWaiter::new(state_rx, rx, &config);

        let wait = tokio::spawn({
            let waiter = waiter.clone();
            async move {
                waiter
                    .wait_for(|s| s.is_both_running(), "both running", Duration::from_secs(5))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        publish(&state_tx, &tx, State::BothRunning);

        assert_eq!(wait.await.unwrap().unwrap(), State::BothRunning);
    }

    #[tokio::test]
    async fn test_reports_stopped_machine() {
        let (state_tx, tx, state_rx, rx) = channels();
        let waiter = ConvergenceWaiter::new(state_rx, rx, &CoordinatorConfig::default());
        drop(tx);
        drop(state_tx);
        let err = waiter
            .wait_for(|s| s.is_both_running(), "both running", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::MachineStopped));
    }
}

// Lifecycle state machine shared by receiver kinds.
//
// The state word is a single atomic; every transition is a compare-and-swap.
// Start and terminate each own a completion slot (a watch channel holding
// `None` until the owning caller finishes). Callers that lose the race attach
// to the slot and observe the same outcome instead of re-running side effects.
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ReceiverError, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    Terminating = 3,
    Terminated = 4,
}

impl ReceiverState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReceiverState::NotStarted,
            1 => ReceiverState::Starting,
            2 => ReceiverState::Started,
            3 => ReceiverState::Terminating,
            _ => ReceiverState::Terminated,
        }
    }
}

type Slot = Option<Result<()>>;

/// What a caller must do after asking for a transition.
pub(crate) enum Transition {
    /// The caller owns the transition and must report its outcome.
    Proceed,
    /// Another caller owns the transition.
    Wait(Outcome),
    /// Nothing to do; this is the result.
    Finished(Result<()>),
}

pub(crate) struct Outcome(watch::Receiver<Slot>);

impl Outcome {
    pub(crate) async fn wait(mut self) -> Result<()> {
        match self.0.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Ok(())),
            Err(_) => Err(ReceiverError::illegal_state("lifecycle transition abandoned")),
        }
    }
}

pub(crate) struct Lifecycle {
    state: AtomicU8,
    started: watch::Sender<Slot>,
    terminated: watch::Sender<Slot>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ReceiverState::NotStarted as u8),
            started: watch::Sender::new(None),
            terminated: watch::Sender::new(None),
        }
    }

    pub(crate) fn state(&self) -> ReceiverState {
        ReceiverState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn cas(&self, from: ReceiverState, to: ReceiverState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            debug!(from = ?from, to = ?to, "receiver state transition");
        }
        swapped
    }

    pub(crate) fn begin_start(&self, transport_running: bool) -> Transition {
        loop {
            match self.state() {
                ReceiverState::NotStarted => {
                    if !transport_running {
                        return Transition::Finished(Err(ReceiverError::illegal_state(
                            "cannot start receiver: transport is not running",
                        )));
                    }
                    if self.cas(ReceiverState::NotStarted, ReceiverState::Starting) {
                        return Transition::Proceed;
                    }
                }
                ReceiverState::Starting | ReceiverState::Started => {
                    return Transition::Wait(Outcome(self.started.subscribe()));
                }
                state @ (ReceiverState::Terminating | ReceiverState::Terminated) => {
                    return Transition::Finished(Err(ReceiverError::IllegalState(format!(
                        "cannot start receiver in state {state:?}"
                    ))));
                }
            }
        }
    }

    /// Reports the start outcome. A failed start leaves the receiver terminated.
    pub(crate) fn finish_start(&self, result: Result<()>) {
        match &result {
            Ok(()) => {
                self.cas(ReceiverState::Starting, ReceiverState::Started);
            }
            Err(_) => {
                self.cas(ReceiverState::Starting, ReceiverState::Terminated);
                self.terminated.send_replace(Some(Ok(())));
            }
        }
        self.started.send_replace(Some(result));
    }

    pub(crate) fn begin_terminate(&self) -> Transition {
        loop {
            match self.state() {
                ReceiverState::NotStarted => {
                    if self.cas(ReceiverState::NotStarted, ReceiverState::Terminated) {
                        self.terminated.send_replace(Some(Ok(())));
                        return Transition::Finished(Ok(()));
                    }
                }
                ReceiverState::Starting => {
                    return Transition::Finished(Err(ReceiverError::illegal_state(
                        "cannot terminate receiver while it is starting",
                    )));
                }
                ReceiverState::Started => {
                    if self.cas(ReceiverState::Started, ReceiverState::Terminating) {
                        return Transition::Proceed;
                    }
                }
                ReceiverState::Terminating | ReceiverState::Terminated => {
                    return Transition::Wait(Outcome(self.terminated.subscribe()));
                }
            }
        }
    }

    /// Claims the termination for a session-down event. False when a
    /// termination is already under way or done.
    pub(crate) fn begin_unsolicited(&self) -> bool {
        self.cas(ReceiverState::Started, ReceiverState::Terminating)
    }

    pub(crate) fn finish_terminate(&self, result: Result<()>) {
        self.state
            .store(ReceiverState::Terminated as u8, Ordering::SeqCst);
        debug!(ok = result.is_ok(), "receiver terminated");
        self.terminated.send_replace(Some(result));
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == ReceiverState::Started
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.state() == ReceiverState::Terminating
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state() == ReceiverState::Terminated
    }

    pub(crate) fn is_terminating_or_terminated(&self) -> bool {
        matches!(
            self.state(),
            ReceiverState::Terminating | ReceiverState::Terminated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn start_requires_running_transport() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.begin_start(false),
            Transition::Finished(Err(ReceiverError::IllegalState(_)))
        ));
        assert_eq!(lifecycle.state(), ReceiverState::NotStarted);
    }

    #[test]
    fn terminate_before_start_is_immediate() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.begin_terminate(),
            Transition::Finished(Ok(()))
        ));
        assert!(lifecycle.is_terminated());
        assert!(matches!(
            lifecycle.begin_start(true),
            Transition::Finished(Err(ReceiverError::IllegalState(_)))
        ));
    }

    #[test]
    fn terminate_while_starting_is_rejected() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.begin_start(true), Transition::Proceed));
        assert!(matches!(
            lifecycle.begin_terminate(),
            Transition::Finished(Err(ReceiverError::IllegalState(_)))
        ));
        assert_eq!(lifecycle.state(), ReceiverState::Starting);
    }

    #[tokio::test]
    async fn concurrent_start_sees_first_outcome() {
        let lifecycle = Arc::new(Lifecycle::new());
        assert!(matches!(lifecycle.begin_start(true), Transition::Proceed));
        let Transition::Wait(outcome) = lifecycle.begin_start(true) else {
            panic!("second start should wait");
        };
        let waiter = tokio::spawn(outcome.wait());
        lifecycle.finish_start(Err(ReceiverError::illegal_state("boom")));
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(ReceiverError::IllegalState(_))));
        assert!(lifecycle.is_terminated());
    }

    #[tokio::test]
    async fn terminated_receiver_reports_stored_result() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.begin_start(true), Transition::Proceed));
        lifecycle.finish_start(Ok(()));
        assert!(matches!(lifecycle.begin_terminate(), Transition::Proceed));
        assert!(!lifecycle.begin_unsolicited());
        lifecycle.finish_terminate(Err(ReceiverError::IncompleteDelivery { undelivered: 3 }));
        let Transition::Wait(outcome) = lifecycle.begin_terminate() else {
            panic!("terminated receiver should hand back the stored outcome");
        };
        assert!(matches!(
            outcome.wait().await,
            Err(ReceiverError::IncompleteDelivery { undelivered: 3 })
        ));
    }
}

use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::countdown::Countdown;
use super::lock;
use crate::error::TransferError;

pub(crate) trait MachineState: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

/// State container shared by both protocol roles.
///
/// The state lives in a watch channel: one writer (the machine's own
/// operations and tasks), any number of observers. Every transition is a
/// guarded compare-and-set evaluated against the current value, so results
/// arriving late from RPCs, events or the countdown are checked against the
/// state that is actually current when they land.
pub(crate) struct Machine<S> {
    role: &'static str,
    state: watch::Sender<S>,
    transfer_id: Mutex<Option<String>>,
    countdown: Mutex<Option<Countdown>>,
}

impl<S: MachineState> Machine<S> {
    pub(crate) fn new(role: &'static str, initial: S) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            role,
            state,
            transfer_id: Mutex::new(None),
            countdown: Mutex::new(None),
        }
    }

    pub(crate) fn current(&self) -> S {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    /// Apply `next` if it yields a state for the current one.
    ///
    /// `next` runs while the state is locked, so an owned-id update made
    /// inside it lands together with the state it belongs to.
    pub(crate) fn transition<F>(&self, next: F) -> bool
    where
        F: FnOnce(&S) -> Option<S>,
    {
        let role = self.role;
        self.state.send_if_modified(|current| match next(current) {
            Some(state) => {
                debug!("{}: {} -> {}", role, current.name(), state.name());
                *current = state;
                true
            }
            None => false,
        })
    }

    /// In-place update that does not change the variant.
    pub(crate) fn modify<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut S) -> bool,
    {
        self.state.send_if_modified(update)
    }

    pub(crate) fn transfer_id(&self) -> Option<String> {
        lock(&self.transfer_id).clone()
    }

    pub(crate) fn set_transfer_id(&self, transfer_id: Option<String>) {
        *lock(&self.transfer_id) = transfer_id;
    }

    pub(crate) fn take_transfer_id(&self) -> Option<String> {
        lock(&self.transfer_id).take()
    }

    pub(crate) fn replace_countdown(&self, countdown: Countdown) {
        if let Some(previous) = lock(&self.countdown).replace(countdown) {
            previous.cancel();
        }
    }

    pub(crate) fn stop_countdown(&self) {
        let stopped = lock(&self.countdown).take();
        if let Some(countdown) = stopped {
            countdown.cancel();
        }
    }

    pub(crate) fn countdown_running(&self) -> bool {
        lock(&self.countdown)
            .as_ref()
            .is_some_and(Countdown::is_running)
    }

    /// Error for an operation whose guard rejected the current state.
    pub(crate) fn rejected(&self, operation: &str) -> TransferError {
        let state = self.state.borrow().name();
        warn!("{}: {} not allowed in state {}", self.role, operation, state);
        TransferError::InvalidState(state)
    }
}

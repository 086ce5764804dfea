//! Device-to-device credential transfer: the requester and approver state
//! machines plus the tasks that drive them.

pub mod approver;
pub mod coordinator;
pub mod correlator;
pub mod countdown;
mod machine;
pub mod requester;
#[cfg(test)]
mod test_support;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::TransferSettings;
use crate::protocol::{VaultClient, VaultRpc};
use crate::security::{AttestationProvider, HardwareAttestor};

pub use approver::{ApproverState, TransferApprover};
pub use coordinator::{EntryPoint, TransferCoordinator};
pub use correlator::EventCorrelator;
pub use countdown::{remaining_seconds, Countdown};
pub use requester::{RequesterState, TransferRequester};

pub const ATTESTATION_FAILED: &str = "Failed to generate device attestation";
pub const TRANSFER_NOT_FOUND: &str = "Transfer not found";

/// One-shot instructions for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferSignal {
    /// Leave the transfer screen.
    NavigateAway,
    /// Transfer finished on the new device; open the main application.
    NavigateToMain,
    /// Show the platform biometric prompt, then report back with
    /// `biometric_success` or `biometric_failed`.
    RequestBiometric,
    /// Biometric confirmation failed; show a notice.
    AuthenticationFailed { reason: String },
}

/// Collaborators shared by both state machines.
#[derive(Clone)]
pub struct TransferContext {
    pub client: VaultClient,
    pub attestation: AttestationProvider,
    pub countdown_tick: Duration,
    pub signals: mpsc::UnboundedSender<TransferSignal>,
}

impl TransferContext {
    /// Build a context and the receiving end of its UI signal channel.
    pub fn new(
        rpc: Arc<dyn VaultRpc>,
        attestor: Arc<dyn HardwareAttestor>,
        settings: &TransferSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TransferSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let context = Self {
            client: VaultClient::new(rpc),
            attestation: AttestationProvider::new(attestor),
            countdown_tick: settings.countdown_tick(),
            signals,
        };
        (context, signal_rx)
    }

    fn emit(&self, signal: TransferSignal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!("Transfer signal dropped: UI receiver gone");
        }
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

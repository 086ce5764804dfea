//! New-device side of the transfer: request credentials and wait for the
//! enrolled device to decide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::countdown::{remaining_seconds, Countdown};
use super::machine::{Machine, MachineState};
use super::{TransferContext, TransferSignal, ATTESTATION_FAILED, TRANSFER_NOT_FOUND};
use crate::error::Result;
use crate::protocol::{DeviceInfo, TransferRequest, TransferStatus, VaultEvent};

const TRANSFER_CANCELLED: &str = "Transfer was cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequesterState {
    Idle,
    /// `attempt` numbers each `start_transfer` call so results of an
    /// abandoned attempt never apply to a later one.
    PreparingAttestation { attempt: u64 },
    SendingRequest { attempt: u64 },
    WaitingForApproval {
        transfer: TransferRequest,
        remaining_seconds: u64,
    },
    /// Approved; the credential itself arrives through a separate channel.
    ReceivingCredentials { transfer_id: String },
    Completed { transfer_id: String },
    Denied { transfer_id: String },
    Expired { transfer_id: String },
    Failed { error: String, retryable: bool },
}

impl RequesterState {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed { .. } | Self::Denied { .. } | Self::Expired { .. } => true,
            Self::Failed { retryable, .. } => !retryable,
            _ => false,
        }
    }

    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::WaitingForApproval { transfer, .. } => Some(&transfer.transfer_id),
            Self::ReceivingCredentials { transfer_id }
            | Self::Completed { transfer_id }
            | Self::Denied { transfer_id }
            | Self::Expired { transfer_id } => Some(transfer_id),
            _ => None,
        }
    }

    pub fn remaining_seconds(&self) -> Option<u64> {
        match self {
            Self::WaitingForApproval {
                remaining_seconds, ..
            } => Some(*remaining_seconds),
            _ => None,
        }
    }
}

impl MachineState for RequesterState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PreparingAttestation { .. } => "PreparingAttestation",
            Self::SendingRequest { .. } => "SendingRequest",
            Self::WaitingForApproval { .. } => "WaitingForApproval",
            Self::ReceivingCredentials { .. } => "ReceivingCredentials",
            Self::Completed { .. } => "Completed",
            Self::Denied { .. } => "Denied",
            Self::Expired { .. } => "Expired",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// Requester state machine. Cheap to clone; clones share one machine.
#[derive(Clone)]
pub struct TransferRequester {
    inner: Arc<RequesterInner>,
}

struct RequesterInner {
    context: TransferContext,
    device_info: DeviceInfo,
    machine: Machine<RequesterState>,
    attempts: AtomicU64,
}

fn can_start(state: &RequesterState) -> bool {
    matches!(state, RequesterState::Idle | RequesterState::Failed { .. })
}

impl TransferRequester {
    pub fn new(context: TransferContext, device_info: DeviceInfo) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                context,
                device_info,
                machine: Machine::new("requester", RequesterState::Idle),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> RequesterState {
        self.inner.machine.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequesterState> {
        self.inner.machine.subscribe()
    }

    /// Id of the transfer this machine currently owns.
    pub fn transfer_id(&self) -> Option<String> {
        self.inner.machine.transfer_id()
    }

    pub fn is_countdown_running(&self) -> bool {
        self.inner.machine.countdown_running()
    }

    /// Attest this device and submit a transfer request to the vault.
    ///
    /// Allowed from `Idle` or `Failed`. Attestation and vault failures end in
    /// a retryable `Failed` state rather than an error.
    pub async fn start_transfer(&self) -> Result<()> {
        let inner = &self.inner;
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let preparing = |s: &RequesterState| {
            matches!(s, RequesterState::PreparingAttestation { attempt: a } if *a == attempt)
        };
        let sending = |s: &RequesterState| {
            matches!(s, RequesterState::SendingRequest { attempt: a } if *a == attempt)
        };

        if !inner.machine.transition(|s| {
            can_start(s).then(|| {
                inner.machine.set_transfer_id(None);
                RequesterState::PreparingAttestation { attempt }
            })
        }) {
            return Err(inner.machine.rejected("start_transfer"));
        }
        info!("Starting credential transfer request (attempt {})", attempt);

        let attestation = match inner.context.attestation.generate_attestation().await {
            Ok(attestation) => attestation,
            Err(e) => {
                warn!("Transfer request aborted before submission: {}", e);
                inner.machine.transition(|s| {
                    preparing(s).then(|| {
                        RequesterState::Failed {
                            error: ATTESTATION_FAILED.into(),
                            retryable: true,
                        }
                    })
                });
                return Ok(());
            }
        };

        if !inner
            .machine
            .transition(|s| preparing(s).then_some(RequesterState::SendingRequest { attempt }))
        {
            debug!("Transfer request abandoned before submission");
            return Ok(());
        }

        match inner
            .context
            .client
            .initiate_transfer(&inner.device_info, &attestation.encode())
            .await
        {
            Ok(transfer) => {
                let transfer_id = transfer.transfer_id.clone();
                if !inner.begin_waiting(transfer, sending) {
                    // This attempt was abandoned while the request was in
                    // flight; release the transfer the vault just created.
                    info!("Transfer {} created after cancellation, releasing it", transfer_id);
                    inner.cancel_remote(&transfer_id).await;
                }
            }
            Err(e) => {
                inner.machine.transition(|s| {
                    sending(s).then(|| RequesterState::Failed {
                        error: e.user_message(),
                        retryable: true,
                    })
                });
            }
        }
        Ok(())
    }

    /// Abandon the transfer. The vault is told on a best-effort basis; the
    /// machine returns to `Idle` either way.
    pub async fn cancel_transfer(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.machine.current().is_terminal() {
            return Err(inner.machine.rejected("cancel_transfer"));
        }

        inner.machine.stop_countdown();
        let transfer_id = inner.machine.take_transfer_id();
        inner
            .machine
            .transition(|s| (!s.is_terminal()).then_some(RequesterState::Idle));

        if let Some(transfer_id) = transfer_id {
            inner.cancel_remote(&transfer_id).await;
        }
        info!("Transfer cancelled by user");
        inner.context.emit(TransferSignal::NavigateAway);
        Ok(())
    }

    /// Start over after a retryable failure.
    pub async fn retry(&self) -> Result<()> {
        if !matches!(
            self.inner.machine.current(),
            RequesterState::Idle | RequesterState::Failed { retryable: true, .. }
        ) {
            return Err(self.inner.machine.rejected("retry"));
        }
        self.start_transfer().await
    }

    /// Leave the flow without telling the vault, typically from a terminal
    /// state.
    pub fn dismiss(&self) {
        self.inner.machine.stop_countdown();
        self.inner.context.emit(TransferSignal::NavigateAway);
    }

    /// Adopt a transfer submitted before a restart.
    ///
    /// The event bus does not replay, so the outcome is read from the vault
    /// and mapped onto the matching local state.
    pub async fn resume(&self, transfer_id: &str) -> Result<()> {
        let inner = &self.inner;
        if !can_start(&inner.machine.current()) {
            return Err(inner.machine.rejected("resume"));
        }
        info!("Reconciling transfer {} with the vault", transfer_id);

        match inner.context.client.get_transfer(transfer_id).await {
            Ok(Some(transfer)) => inner.reconcile(transfer),
            Ok(None) => {
                warn!("Transfer {} unknown to the vault", transfer_id);
                inner.machine.transition(|s| {
                    can_start(s).then(|| RequesterState::Failed {
                        error: TRANSFER_NOT_FOUND.into(),
                        retryable: true,
                    })
                });
            }
            Err(e) => {
                inner.machine.transition(|s| {
                    can_start(s).then(|| RequesterState::Failed {
                        error: e.user_message(),
                        retryable: true,
                    })
                });
            }
        }
        Ok(())
    }

    /// Poll the vault for the owned transfer and apply any outcome the event
    /// bus failed to deliver.
    pub async fn refresh(&self) {
        let inner = &self.inner;
        let Some(transfer_id) = inner.machine.transfer_id() else {
            return;
        };
        if !matches!(
            inner.machine.current(),
            RequesterState::WaitingForApproval { .. } | RequesterState::ReceivingCredentials { .. }
        ) {
            return;
        }

        match inner.context.client.get_transfer(&transfer_id).await {
            Ok(Some(transfer)) => {
                if let Some(event) = status_event(transfer.status, &transfer.transfer_id) {
                    inner.resolve(&event);
                } else if transfer.status == TransferStatus::Cancelled {
                    inner.machine.stop_countdown();
                    inner.machine.transition(|s| {
                        matches!(
                            s,
                            RequesterState::WaitingForApproval { .. }
                                | RequesterState::ReceivingCredentials { .. }
                        )
                        .then(|| {
                            inner.machine.set_transfer_id(None);
                            RequesterState::Failed {
                                error: TRANSFER_CANCELLED.into(),
                                retryable: true,
                            }
                        })
                    });
                }
            }
            Ok(None) => warn!("Transfer {} vanished from the vault", transfer_id),
            Err(e) => warn!("Could not refresh transfer {}: {}", transfer_id, e),
        }
    }

    /// Apply a vault event. Returns whether it changed the state.
    ///
    /// Events for other transfers, and events that do not apply to the
    /// current state, are ignored.
    pub fn handle_event(&self, event: &VaultEvent) -> bool {
        let Some(event_id) = event.transfer_id() else {
            return false;
        };
        if self.inner.machine.transfer_id().as_deref() != Some(event_id) {
            debug!("Ignoring event for unrelated transfer {}", event_id);
            return false;
        }
        self.inner.resolve(event)
    }

    /// Stop background work and drop the owned transfer. Called when the
    /// owning coordinator goes away.
    pub fn dispose(&self) {
        self.inner.machine.stop_countdown();
        self.inner.machine.take_transfer_id();
    }
}

impl RequesterInner {
    fn begin_waiting<F>(self: &Arc<Self>, transfer: TransferRequest, from: F) -> bool
    where
        F: Fn(&RequesterState) -> bool,
    {
        let transfer_id = transfer.transfer_id.clone();
        let expires_at = transfer.expires_at;
        let remaining = remaining_seconds(expires_at, Utc::now());

        // The id is taken over in the same step as the state, so the
        // correlator never sees a waiting machine without it.
        let entered = self.machine.transition(|s| {
            from(s).then(|| {
                self.machine.set_transfer_id(Some(transfer_id.clone()));
                RequesterState::WaitingForApproval {
                    transfer,
                    remaining_seconds: remaining,
                }
            })
        });
        if entered {
            info!("Transfer {} awaiting approval ({}s left)", transfer_id, remaining);
            self.start_countdown(expires_at);
        }
        entered
    }

    fn start_countdown(self: &Arc<Self>, expires_at: DateTime<Utc>) {
        let ticker = Arc::downgrade(self);
        let expirer = Arc::downgrade(self);

        let countdown = Countdown::start(
            expires_at,
            self.context.countdown_tick,
            move |secs| {
                if let Some(inner) = ticker.upgrade() {
                    inner.update_remaining(secs);
                }
            },
            move || {
                if let Some(inner) = expirer.upgrade() {
                    inner.expire_locally();
                }
            },
        );
        self.machine.replace_countdown(countdown);
    }

    fn update_remaining(&self, secs: u64) {
        self.machine.modify(|state| match state {
            RequesterState::WaitingForApproval {
                remaining_seconds, ..
            } if *remaining_seconds != secs => {
                *remaining_seconds = secs;
                true
            }
            _ => false,
        });
    }

    fn expire_locally(&self) {
        self.machine.stop_countdown();
        let expired = self.machine.transition(|s| match s {
            RequesterState::WaitingForApproval { transfer, .. } => Some(RequesterState::Expired {
                transfer_id: transfer.transfer_id.clone(),
            }),
            _ => None,
        });
        if expired {
            info!("Transfer expired before a decision was made");
        }
    }

    fn resolve(&self, event: &VaultEvent) -> bool {
        let accepts = |state: &RequesterState| match state {
            RequesterState::WaitingForApproval { .. } => !matches!(event, VaultEvent::Other),
            RequesterState::ReceivingCredentials { .. } => matches!(
                event,
                VaultEvent::TransferCompleted { .. } | VaultEvent::TransferExpired { .. }
            ),
            _ => false,
        };
        if !accepts(&self.machine.current()) {
            debug!("Event {:?} does not apply to the current state", event);
            return false;
        }

        self.machine.stop_countdown();
        let applied = self.machine.transition(|s| {
            if !accepts(s) {
                return None;
            }
            let transfer_id = s.transfer_id()?.to_string();
            match event {
                VaultEvent::TransferApproved { .. } => {
                    Some(RequesterState::ReceivingCredentials { transfer_id })
                }
                VaultEvent::TransferDenied { .. } => Some(RequesterState::Denied { transfer_id }),
                VaultEvent::TransferCompleted { .. } => {
                    Some(RequesterState::Completed { transfer_id })
                }
                VaultEvent::TransferExpired { .. } => Some(RequesterState::Expired { transfer_id }),
                VaultEvent::Other => None,
            }
        });

        if applied {
            info!("Transfer outcome from vault: {:?}", event);
            if matches!(event, VaultEvent::TransferCompleted { .. }) {
                self.context.emit(TransferSignal::NavigateToMain);
            }
        }
        applied
    }

    fn reconcile(self: &Arc<Self>, transfer: TransferRequest) {
        let transfer_id = transfer.transfer_id.clone();
        let status = match transfer.status {
            TransferStatus::Pending if transfer.is_expired_at(Utc::now()) => TransferStatus::Expired,
            status => status,
        };
        info!("Vault reports transfer {} as {}", transfer_id, status);

        let next = match status {
            TransferStatus::Pending => {
                self.begin_waiting(transfer, can_start);
                return;
            }
            TransferStatus::Approved => RequesterState::ReceivingCredentials {
                transfer_id: transfer_id.clone(),
            },
            TransferStatus::Denied => RequesterState::Denied {
                transfer_id: transfer_id.clone(),
            },
            TransferStatus::Completed => RequesterState::Completed {
                transfer_id: transfer_id.clone(),
            },
            TransferStatus::Expired => RequesterState::Expired {
                transfer_id: transfer_id.clone(),
            },
            TransferStatus::Cancelled => RequesterState::Failed {
                error: TRANSFER_CANCELLED.into(),
                retryable: true,
            },
        };

        let owned = (status != TransferStatus::Cancelled).then_some(transfer_id);
        let applied = self.machine.transition(|s| {
            can_start(s).then(|| {
                self.machine.set_transfer_id(owned);
                next
            })
        });
        if applied && status == TransferStatus::Completed {
            self.context.emit(TransferSignal::NavigateToMain);
        }
    }

    async fn cancel_remote(&self, transfer_id: &str) {
        if let Err(e) = self.context.client.cancel_transfer(transfer_id).await {
            warn!("Vault did not confirm cancellation of {}: {}", transfer_id, e);
        }
    }
}

fn status_event(status: TransferStatus, transfer_id: &str) -> Option<VaultEvent> {
    let transfer_id = transfer_id.to_string();
    match status {
        TransferStatus::Approved => Some(VaultEvent::TransferApproved { transfer_id }),
        TransferStatus::Denied => Some(VaultEvent::TransferDenied { transfer_id }),
        TransferStatus::Completed => Some(VaultEvent::TransferCompleted { transfer_id }),
        TransferStatus::Expired => Some(VaultEvent::TransferExpired { transfer_id }),
        TransferStatus::Pending | TransferStatus::Cancelled => None,
    }
}

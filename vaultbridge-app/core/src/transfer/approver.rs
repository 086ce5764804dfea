//! Enrolled-device side of the transfer: look the request up, gate approval
//! behind biometric confirmation, submit the decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::countdown::{remaining_seconds, Countdown};
use super::machine::{Machine, MachineState};
use super::{TransferContext, TransferSignal, ATTESTATION_FAILED, TRANSFER_NOT_FOUND};
use crate::error::{Result, TransferError};
use crate::protocol::{TransferRequest, TransferStatus};
use crate::security::{BiometricPrompt, APPROVAL_PROMPT_REASON};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApproverState {
    Loading,
    Ready {
        transfer: TransferRequest,
        remaining_seconds: u64,
    },
    /// Approval requested; waiting on the platform biometric prompt. The
    /// countdown keeps running here.
    AwaitingBiometric {
        transfer: TransferRequest,
        remaining_seconds: u64,
    },
    ProcessingApproval { transfer_id: String },
    Approved { transfer_id: String },
    ProcessingDenial { transfer_id: String },
    DeniedComplete { transfer_id: String },
    Expired { transfer_id: String },
    Error { message: String },
}

impl ApproverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved { .. }
                | Self::DeniedComplete { .. }
                | Self::Expired { .. }
                | Self::Error { .. }
        )
    }

    pub fn transfer(&self) -> Option<&TransferRequest> {
        match self {
            Self::Ready { transfer, .. } | Self::AwaitingBiometric { transfer, .. } => Some(transfer),
            _ => None,
        }
    }

    pub fn remaining_seconds(&self) -> Option<u64> {
        match self {
            Self::Ready {
                remaining_seconds, ..
            }
            | Self::AwaitingBiometric {
                remaining_seconds, ..
            } => Some(*remaining_seconds),
            _ => None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl MachineState for ApproverState {
    fn name(&self) -> &'static str {
        match self {
            Self::Loading => "Loading",
            Self::Ready { .. } => "Ready",
            Self::AwaitingBiometric { .. } => "AwaitingBiometric",
            Self::ProcessingApproval { .. } => "ProcessingApproval",
            Self::Approved { .. } => "Approved",
            Self::ProcessingDenial { .. } => "ProcessingDenial",
            Self::DeniedComplete { .. } => "DeniedComplete",
            Self::Expired { .. } => "Expired",
            Self::Error { .. } => "Error",
        }
    }
}

/// Approver state machine. Cheap to clone; clones share one machine.
#[derive(Clone)]
pub struct TransferApprover {
    inner: Arc<ApproverInner>,
}

struct ApproverInner {
    context: TransferContext,
    machine: Machine<ApproverState>,
}

impl TransferApprover {
    pub fn new(context: TransferContext) -> Self {
        Self {
            inner: Arc::new(ApproverInner {
                context,
                machine: Machine::new("approver", ApproverState::Loading),
            }),
        }
    }

    pub fn state(&self) -> ApproverState {
        self.inner.machine.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApproverState> {
        self.inner.machine.subscribe()
    }

    pub fn transfer_id(&self) -> Option<String> {
        self.inner.machine.transfer_id()
    }

    pub fn is_countdown_running(&self) -> bool {
        self.inner.machine.countdown_running()
    }

    /// Fetch the transfer by id and decide whether it can still be acted on.
    ///
    /// Only a pending, unexpired transfer reaches `Ready`.
    pub async fn load_transfer(&self, transfer_id: &str) -> Result<()> {
        let inner = &self.inner;
        if !matches!(inner.machine.current(), ApproverState::Loading) {
            return Err(inner.machine.rejected("load_transfer"));
        }
        inner.machine.set_transfer_id(Some(transfer_id.to_string()));
        info!("Loading transfer {}", transfer_id);

        let next = match inner.context.client.get_transfer(transfer_id).await {
            Ok(Some(transfer)) => {
                if transfer.is_expired_at(Utc::now()) {
                    info!("Transfer {} expired before it was opened", transfer_id);
                    ApproverState::Expired {
                        transfer_id: transfer.transfer_id,
                    }
                } else if transfer.status != TransferStatus::Pending {
                    ApproverState::error(format!("Transfer has already been {}", transfer.status))
                } else {
                    inner.enter_ready(transfer);
                    return Ok(());
                }
            }
            Ok(None) => ApproverState::error(TRANSFER_NOT_FOUND),
            Err(e) => ApproverState::error(e.user_message()),
        };

        inner
            .machine
            .transition(|s| matches!(s, ApproverState::Loading).then_some(next));
        Ok(())
    }

    /// Ask for biometric confirmation. Nothing is sent to the vault yet.
    pub fn approve_transfer(&self) -> Result<()> {
        let inner = &self.inner;
        let moved = inner.machine.transition(|s| match s {
            ApproverState::Ready {
                transfer,
                remaining_seconds,
            } => Some(ApproverState::AwaitingBiometric {
                transfer: transfer.clone(),
                remaining_seconds: *remaining_seconds,
            }),
            _ => None,
        });
        if !moved {
            return Err(inner.machine.rejected("approve_transfer"));
        }
        inner.context.emit(TransferSignal::RequestBiometric);
        Ok(())
    }

    /// Biometric confirmed: attest this device and submit the approval.
    pub async fn biometric_success(&self) -> Result<()> {
        let inner = &self.inner;
        if !matches!(inner.machine.current(), ApproverState::AwaitingBiometric { .. }) {
            return Err(inner.machine.rejected("biometric_success"));
        }

        let attestation = match inner.context.attestation.generate_attestation().await {
            Ok(attestation) => attestation,
            Err(e) => {
                warn!("Approval aborted: {}", e);
                inner.machine.stop_countdown();
                inner.machine.transition(|s| {
                    matches!(s, ApproverState::AwaitingBiometric { .. })
                        .then(|| ApproverState::error(ATTESTATION_FAILED))
                });
                return Ok(());
            }
        };

        let mut transfer_id = None;
        inner.machine.transition(|s| match s {
            ApproverState::AwaitingBiometric { transfer, .. } => {
                transfer_id = Some(transfer.transfer_id.clone());
                Some(ApproverState::ProcessingApproval {
                    transfer_id: transfer.transfer_id.clone(),
                })
            }
            _ => None,
        });
        // Expired while the attestation was being generated.
        let Some(transfer_id) = transfer_id else {
            return Ok(());
        };
        inner.machine.stop_countdown();

        let result = inner
            .context
            .client
            .approve_transfer(&transfer_id, attestation.encode())
            .await;
        inner.finish_decision(&transfer_id, result.map(|_| ()), |id| {
            ApproverState::Approved { transfer_id: id }
        });
        Ok(())
    }

    /// Biometric prompt did not confirm. No decision is sent; the transfer is
    /// reloaded so an expiry in the meantime is noticed.
    pub async fn biometric_failed(&self, reason: &str) -> Result<()> {
        let inner = &self.inner;
        if !inner.machine.transition(|s| {
            matches!(s, ApproverState::AwaitingBiometric { .. }).then_some(ApproverState::Loading)
        }) {
            return Err(inner.machine.rejected("biometric_failed"));
        }
        inner.machine.stop_countdown();
        info!("Biometric confirmation failed: {}", reason);
        inner.context.emit(TransferSignal::AuthenticationFailed {
            reason: reason.to_string(),
        });

        match inner.machine.transfer_id() {
            Some(transfer_id) => self.load_transfer(&transfer_id).await,
            None => {
                inner.machine.transition(|s| {
                    matches!(s, ApproverState::Loading)
                        .then(|| ApproverState::error(TRANSFER_NOT_FOUND))
                });
                Ok(())
            }
        }
    }

    /// Run the platform prompt and route its outcome.
    pub async fn authenticate(&self, prompt: &dyn BiometricPrompt) -> Result<()> {
        if !matches!(self.state(), ApproverState::AwaitingBiometric { .. }) {
            return Err(self.inner.machine.rejected("authenticate"));
        }
        match prompt.authenticate(APPROVAL_PROMPT_REASON).await {
            Ok(()) => self.biometric_success().await,
            Err(e) => self.biometric_failed(&e.to_string()).await,
        }
    }

    /// Refuse the transfer. Denial needs no biometric confirmation.
    pub async fn deny_transfer(&self) -> Result<()> {
        let inner = &self.inner;
        let mut transfer_id = None;
        inner.machine.transition(|s| match s {
            ApproverState::Ready { transfer, .. } => {
                transfer_id = Some(transfer.transfer_id.clone());
                Some(ApproverState::ProcessingDenial {
                    transfer_id: transfer.transfer_id.clone(),
                })
            }
            _ => None,
        });
        let Some(transfer_id) = transfer_id else {
            return Err(inner.machine.rejected("deny_transfer"));
        };
        inner.machine.stop_countdown();

        let result = inner.context.client.deny_transfer(&transfer_id).await;
        inner.finish_decision(&transfer_id, result.map(|_| ()), |id| {
            ApproverState::DeniedComplete { transfer_id: id }
        });
        Ok(())
    }

    pub fn dismiss(&self) {
        self.inner.machine.stop_countdown();
        self.inner.context.emit(TransferSignal::NavigateAway);
    }

    pub fn dispose(&self) {
        self.inner.machine.stop_countdown();
        self.inner.machine.take_transfer_id();
    }
}

impl ApproverInner {
    fn enter_ready(self: &Arc<Self>, transfer: TransferRequest) {
        let expires_at = transfer.expires_at;
        let remaining = remaining_seconds(expires_at, Utc::now());
        let entered = self.machine.transition(|s| {
            matches!(s, ApproverState::Loading).then(|| ApproverState::Ready {
                transfer,
                remaining_seconds: remaining,
            })
        });
        if entered {
            self.start_countdown(expires_at);
        }
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
            ApproverState::Ready {
                remaining_seconds, ..
            }
            | ApproverState::AwaitingBiometric {
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
        let expired = self.machine.transition(|s| {
            s.transfer().map(|transfer| ApproverState::Expired {
                transfer_id: transfer.transfer_id.clone(),
            })
        });
        if expired {
            info!("Transfer expired before a decision was made");
        }
    }

    /// Apply the vault's answer to a submitted decision.
    fn finish_decision<F>(&self, transfer_id: &str, result: Result<()>, done: F)
    where
        F: FnOnce(String) -> ApproverState,
    {
        let next = match result {
            Ok(()) => {
                info!("Decision for transfer {} accepted", transfer_id);
                done(transfer_id.to_string())
            }
            Err(TransferError::Expired(_)) => ApproverState::Expired {
                transfer_id: transfer_id.to_string(),
            },
            Err(e) => ApproverState::error(e.user_message()),
        };
        self.machine.transition(|s| {
            matches!(
                s,
                ApproverState::ProcessingApproval { .. } | ApproverState::ProcessingDenial { .. }
            )
            .then_some(next)
        });
    }
}

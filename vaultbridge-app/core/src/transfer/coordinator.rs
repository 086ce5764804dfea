//! Entry point selection: one coordinator per transfer screen, owning
//! exactly one of the two state machines.

use tokio::sync::broadcast;
use tracing::info;

use super::approver::TransferApprover;
use super::correlator::EventCorrelator;
use super::requester::TransferRequester;
use super::TransferContext;
use crate::error::Result;
use crate::protocol::{DeviceInfo, TransferLink, VaultEvent};

/// How the transfer screen was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// New device, no transfer yet. The user starts one explicitly.
    FreshRequest { device_info: DeviceInfo },
    /// New device restarted while a transfer it submitted was outstanding.
    Resume {
        device_info: DeviceInfo,
        transfer_id: String,
    },
    /// Enrolled device opened an approval link.
    DeepLink { uri: String },
}

impl EntryPoint {
    /// Requester entry, resuming `transfer_id` when one was persisted.
    pub fn requester(device_info: DeviceInfo, transfer_id: Option<String>) -> Self {
        match transfer_id {
            Some(transfer_id) => Self::Resume {
                device_info,
                transfer_id,
            },
            None => Self::FreshRequest { device_info },
        }
    }
}

pub enum TransferCoordinator {
    Requester {
        requester: TransferRequester,
        correlator: EventCorrelator,
    },
    Approver {
        approver: TransferApprover,
    },
}

impl TransferCoordinator {
    /// Build the machine for `entry` and run its first step.
    ///
    /// Requesters subscribe to `events` before anything is sent to the vault,
    /// so no outcome published after this call can be missed. Approvers
    /// never read the bus.
    pub async fn open(
        entry: EntryPoint,
        context: TransferContext,
        events: broadcast::Receiver<VaultEvent>,
    ) -> Result<Self> {
        match entry {
            EntryPoint::FreshRequest { device_info } => {
                info!("Opening transfer as requester");
                let requester = TransferRequester::new(context, device_info);
                let correlator = EventCorrelator::spawn(events, requester.clone());
                Ok(Self::Requester {
                    requester,
                    correlator,
                })
            }
            EntryPoint::Resume {
                device_info,
                transfer_id,
            } => {
                info!("Resuming transfer {} as requester", transfer_id);
                let requester = TransferRequester::new(context, device_info);
                let correlator = EventCorrelator::spawn(events, requester.clone());
                requester.resume(&transfer_id).await?;
                Ok(Self::Requester {
                    requester,
                    correlator,
                })
            }
            EntryPoint::DeepLink { uri } => {
                let link = TransferLink::parse(&uri)?;
                info!("Opening transfer {} as approver", link.transfer_id);
                let approver = TransferApprover::new(context);
                approver.load_transfer(&link.transfer_id).await?;
                Ok(Self::Approver { approver })
            }
        }
    }

    pub fn requester(&self) -> Option<&TransferRequester> {
        match self {
            Self::Requester { requester, .. } => Some(requester),
            Self::Approver { .. } => None,
        }
    }

    pub fn approver(&self) -> Option<&TransferApprover> {
        match self {
            Self::Approver { approver } => Some(approver),
            Self::Requester { .. } => None,
        }
    }

    /// Stop the countdown and event subscription. State stays readable.
    pub fn dispose(&self) {
        match self {
            Self::Requester {
                requester,
                correlator,
            } => {
                correlator.stop();
                requester.dispose();
            }
            Self::Approver { approver } => approver.dispose(),
        }
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::error::TransferError;
    use crate::protocol::event_bus;
    use crate::protocol::rpc::OP_GET_TRANSFER;
    use crate::transfer::test_support::{context, device, transfer_json, MockAttestor, MockVault};
    use crate::transfer::{ApproverState, RequesterState};

    #[test]
    fn test_requester_entry_selection() {
        assert!(matches!(
            EntryPoint::requester(device(), None),
            EntryPoint::FreshRequest { .. }
        ));
        assert!(matches!(
            EntryPoint::requester(device(), Some("t1".into())),
            EntryPoint::Resume { transfer_id, .. } if transfer_id == "t1"
        ));
    }

    #[tokio::test]
    async fn test_fresh_request_starts_idle() {
        let vault = MockVault::new();
        let (context, _signals) = context(vault.clone(), Arc::new(MockAttestor::default()));
        let bus = event_bus(4);

        let coordinator = TransferCoordinator::open(
            EntryPoint::FreshRequest {
                device_info: device(),
            },
            context,
            bus.subscribe(),
        )
        .await
        .unwrap();

        assert_eq!(coordinator.requester().unwrap().state(), RequesterState::Idle);
        assert!(coordinator.approver().is_none());
        assert!(vault.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_link_loads_transfer() {
        let vault = MockVault::new();
        vault.respond(
            OP_GET_TRANSFER,
            json!({"success": true, "transfer": transfer_json("t9", "PENDING", 600)}),
        );
        let (context, _signals) = context(vault.clone(), Arc::new(MockAttestor::default()));
        let bus = event_bus(4);

        let coordinator = TransferCoordinator::open(
            EntryPoint::DeepLink {
                uri: "vaultbridge://transfer/approve?transfer_id=t9".into(),
            },
            context,
            bus.subscribe(),
        )
        .await
        .unwrap();

        let approver = coordinator.approver().unwrap().clone();
        assert!(matches!(approver.state(), ApproverState::Ready { .. }));
        assert_eq!(vault.calls_to(OP_GET_TRANSFER)[0]["transfer_id"], json!("t9"));

        drop(coordinator);
        assert!(!approver.is_countdown_running());
    }

    #[tokio::test]
    async fn test_deep_link_without_id_is_rejected() {
        let vault = MockVault::new();
        let (context, _signals) = context(vault.clone(), Arc::new(MockAttestor::default()));
        let bus = event_bus(4);

        let result = TransferCoordinator::open(
            EntryPoint::DeepLink {
                uri: "vaultbridge://transfer/approve".into(),
            },
            context,
            bus.subscribe(),
        )
        .await;

        assert!(matches!(result, Err(TransferError::InvalidLink(_))));
        assert!(vault.operations().is_empty());
    }
}

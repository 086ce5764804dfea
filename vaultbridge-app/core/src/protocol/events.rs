use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published by the vault on the multicast event bus.
///
/// The bus is fire-and-forget: a subscriber only sees events sent after it
/// subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    TransferApproved { transfer_id: String },
    TransferDenied { transfer_id: String },
    TransferCompleted { transfer_id: String },
    TransferExpired { transfer_id: String },
    /// Any event not related to credential transfer.
    #[serde(other)]
    Other,
}

impl VaultEvent {
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::TransferApproved { transfer_id }
            | Self::TransferDenied { transfer_id }
            | Self::TransferCompleted { transfer_id }
            | Self::TransferExpired { transfer_id } => Some(transfer_id),
            Self::Other => None,
        }
    }
}

/// Create an in-process event bus with room for `capacity` pending events.
pub fn event_bus(capacity: usize) -> broadcast::Sender<VaultEvent> {
    let (tx, _) = broadcast::channel(capacity.max(1));
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_event_types_map_to_other() {
        let event: VaultEvent =
            serde_json::from_str(r#"{"type":"vault_locked","reason":"timeout"}"#).unwrap();
        assert_eq!(event, VaultEvent::Other);
        assert_eq!(event.transfer_id(), None);
    }

    #[test]
    fn test_transfer_event_carries_id() {
        let event: VaultEvent =
            serde_json::from_str(r#"{"type":"transfer_denied","transfer_id":"t7"}"#).unwrap();
        assert_eq!(event.transfer_id(), Some("t7"));
    }
}

pub mod events;
pub mod link;
pub mod messages;
pub mod rpc;

pub use events::{event_bus, VaultEvent};
pub use link::TransferLink;
pub use messages::{
    DeviceInfo, TransferDecisionRequest, TransferDecisionResponse, TransferRequest, TransferStatus,
};
pub use rpc::{Payload, VaultClient, VaultRpc};

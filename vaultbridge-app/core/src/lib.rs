mod config;
mod error;
pub mod protocol;
pub mod security;
pub mod transfer;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{load_settings, save_settings, TransferSettings};
pub use error::{Result, TransferError};
pub use protocol::{DeviceInfo, TransferStatus, VaultEvent, VaultRpc};
pub use security::{BiometricPrompt, HardwareAttestor};
pub use transfer::{
    ApproverState, EntryPoint, RequesterState, TransferApprover, TransferContext,
    TransferCoordinator, TransferRequester, TransferSignal,
};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Returns false when a subscriber was already installed, in which
/// case that one stays in place.
pub fn init_tracing() -> bool {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultbridge_transfer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    match installed {
        Ok(()) => true,
        Err(e) => {
            debug!("Keeping existing tracing subscriber: {}", e);
            false
        }
    }
}

/// Process-wide wiring between the host app's collaborators and transfer
/// screens.
///
/// The host forwards every event from its vault subscription to
/// [`TransferHost::publish`]; each opened coordinator gets its own receiver.
pub struct TransferHost {
    rpc: Arc<dyn VaultRpc>,
    attestor: Arc<dyn HardwareAttestor>,
    settings: TransferSettings,
    events: broadcast::Sender<VaultEvent>,
}

impl TransferHost {
    pub fn new(
        rpc: Arc<dyn VaultRpc>,
        attestor: Arc<dyn HardwareAttestor>,
        settings: TransferSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let events = protocol::event_bus(settings.event_buffer);
        info!(
            "Transfer host ready ({} on {})",
            settings.device_model, settings.os_version
        );
        Ok(Self {
            rpc,
            attestor,
            settings,
            events,
        })
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Descriptor this device sends when requesting a transfer.
    pub fn device_info(&self, fingerprint: &str) -> DeviceInfo {
        security::describe_device(fingerprint, &self.settings)
    }

    /// Forward one event from the vault bus. Returns the number of open
    /// coordinators that will see it.
    pub fn publish(&self, event: VaultEvent) -> usize {
        match self.events.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No transfer screen listening for vault events");
                0
            }
        }
    }

    /// Open a transfer screen. The receiver carries the UI signals of that
    /// screen only.
    pub async fn open(
        &self,
        entry: EntryPoint,
    ) -> Result<(TransferCoordinator, mpsc::UnboundedReceiver<TransferSignal>)> {
        let (context, signals) =
            TransferContext::new(self.rpc.clone(), self.attestor.clone(), &self.settings);
        let coordinator = TransferCoordinator::open(entry, context, self.events.subscribe()).await?;
        Ok((coordinator, signals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_keeps_first_subscriber() {
        init_tracing();
        assert!(!init_tracing());
    }
}

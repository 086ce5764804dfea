use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::requester::TransferRequester;
use crate::protocol::VaultEvent;

/// Feeds vault events into a requester for as long as the coordinator lives.
///
/// Events for other transfers are dropped by the requester itself. When the
/// receiver falls behind the bus, the requester polls the vault instead of
/// trusting the events that survived.
pub struct EventCorrelator {
    handle: JoinHandle<()>,
}

impl EventCorrelator {
    pub fn spawn(mut events: broadcast::Receiver<VaultEvent>, requester: TransferRequester) -> Self {
        let handle = tokio::spawn(async move {
            info!("Event correlator started");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if requester.handle_event(&event) {
                            debug!("Applied {:?}", event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event correlator lagged, {} events skipped", skipped);
                        requester.refresh().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("Event bus closed");
                        break;
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for EventCorrelator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

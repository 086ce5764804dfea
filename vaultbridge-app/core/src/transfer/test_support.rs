use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use super::{TransferContext, TransferSignal};
use crate::config::TransferSettings;
use crate::error::{Result, TransferError};
use crate::protocol::{DeviceInfo, Payload, VaultRpc};
use crate::security::{HardwareAttestor, CHALLENGE_LEN};

/// Vault double: queued responses per operation, `{"success": true}` when
/// the queue is empty. Calls can be held back until released.
#[derive(Default)]
pub(crate) struct MockVault {
    responses: Mutex<HashMap<String, VecDeque<Result<Payload>>>>,
    holds: Mutex<HashMap<String, VecDeque<Arc<Notify>>>>,
    calls: Mutex<Vec<(String, Payload)>>,
}

impl MockVault {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, operation: &str, response: Value) {
        let payload = response.as_object().cloned().unwrap_or_default();
        self.push(operation, Ok(payload));
    }

    pub(crate) fn fail(&self, operation: &str, message: &str) {
        self.push(operation, Err(TransferError::Rpc(message.to_string())));
    }

    /// Hold the next not-yet-held call to `operation` until the returned
    /// gate is notified. The call picks its response before waiting.
    pub(crate) fn hold(&self, operation: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(gate.clone());
        gate
    }

    fn push(&self, operation: &str, response: Result<Payload>) {
        self.responses
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub(crate) fn calls_to(&self, operation: &str) -> Vec<Payload> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl VaultRpc for MockVault {
    async fn call(&self, operation: &str, payload: Payload) -> Result<Payload> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), payload));
        let queued = self
            .responses
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        let gate = self
            .holds
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        queued.unwrap_or_else(|| Ok(json!({"success": true}).as_object().cloned().unwrap_or_default()))
    }
}

#[derive(Default)]
pub(crate) struct MockAttestor {
    pub(crate) failing: AtomicBool,
    pub(crate) calls: AtomicUsize,
}

impl MockAttestor {
    pub(crate) fn failing() -> Arc<Self> {
        let attestor = Self::default();
        attestor.failing.store(true, Ordering::SeqCst);
        Arc::new(attestor)
    }
}

#[async_trait]
impl HardwareAttestor for MockAttestor {
    async fn generate_attestation_key(
        &self,
        challenge: &[u8; CHALLENGE_LEN],
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("KeyStore unavailable");
        }
        Ok(vec![challenge.to_vec(), b"root-ca".to_vec()])
    }
}

pub(crate) fn context(
    vault: Arc<MockVault>,
    attestor: Arc<MockAttestor>,
) -> (TransferContext, mpsc::UnboundedReceiver<TransferSignal>) {
    TransferContext::new(vault, attestor, &TransferSettings::default())
}

pub(crate) fn device() -> DeviceInfo {
    DeviceInfo {
        device_id: "new-device".into(),
        model: "Pixel 9".into(),
        os_version: "15".into(),
        location: None,
    }
}

/// Transfer map as the vault would return it, expiring `expires_in`
/// seconds from now.
pub(crate) fn transfer_json(transfer_id: &str, status: &str, expires_in: i64) -> Value {
    let now = Utc::now();
    json!({
        "transfer_id": transfer_id,
        "source_device_id": "new-device",
        "target_device_id": null,
        "device_info": {
            "device_id": "new-device",
            "model": "Pixel 9",
            "os_version": "15",
            "location": "Lyon",
        },
        "created_at": now.to_rfc3339(),
        "expires_at": (now + Duration::seconds(expires_in)).to_rfc3339(),
        "status": status,
    })
}

pub(crate) fn drain(signals: &mut mpsc::UnboundedReceiver<TransferSignal>) -> Vec<TransferSignal> {
    let mut seen = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        seen.push(signal);
    }
    seen
}

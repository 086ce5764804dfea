//! Typed marshaling over the vault's free-form request/response RPC.
//!
//! The vault transport takes an operation name and a key/value map and
//! answers with another map. Recognized response keys are `success`,
//! `transfer`, `status` and `error`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::messages::{
    to_payload, DeviceInfo, TransferDecisionRequest, TransferDecisionResponse, TransferRequest,
    TransferStatus,
};
use crate::error::{Result, TransferError};

pub const OP_INITIATE_TRANSFER: &str = "initiate_transfer";
pub const OP_CANCEL_TRANSFER: &str = "cancel_transfer";
pub const OP_GET_TRANSFER: &str = "get_transfer";
pub const OP_APPROVE_TRANSFER: &str = "approve_transfer";
pub const OP_DENY_TRANSFER: &str = "deny_transfer";

pub type Payload = Map<String, Value>;

/// Transport to the remote vault execution environment.
///
/// One call is one logical operation. Transport failures are reported as
/// errors; vault-level failures come back as `success: false`.
#[async_trait]
pub trait VaultRpc: Send + Sync {
    async fn call(&self, operation: &str, payload: Payload) -> Result<Payload>;
}

#[derive(Clone)]
pub struct VaultClient {
    rpc: Arc<dyn VaultRpc>,
}

impl VaultClient {
    pub fn new(rpc: Arc<dyn VaultRpc>) -> Self {
        Self { rpc }
    }

    /// Submit a transfer request for this device. The vault assigns the id
    /// and expiry.
    pub async fn initiate_transfer(
        &self,
        device_info: &DeviceInfo,
        device_attestation: &str,
    ) -> Result<TransferRequest> {
        let mut payload = Payload::new();
        payload.insert("device_info".into(), serde_json::to_value(device_info)?);
        payload.insert("device_attestation".into(), json!(device_attestation));

        let response = self.call(OP_INITIATE_TRANSFER, payload).await?;
        ensure_success(&response, "Failed to initiate transfer")?;

        parse_transfer(&response)?.ok_or_else(|| {
            TransferError::MalformedResponse("response carried no transfer".into())
        })
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        let response = self
            .call(OP_CANCEL_TRANSFER, transfer_id_payload(transfer_id))
            .await?;
        ensure_success(&response, "Failed to cancel transfer")
    }

    /// Look up a transfer by id. `Ok(None)` means the vault returned no
    /// transfer for it.
    pub async fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRequest>> {
        let response = self
            .call(OP_GET_TRANSFER, transfer_id_payload(transfer_id))
            .await?;

        if let Some(transfer) = parse_transfer(&response)? {
            return Ok(Some(transfer));
        }
        match response.get("error").and_then(Value::as_str) {
            Some(error) if !is_success(&response) => Err(TransferError::Rpc(error.to_string())),
            _ => Ok(None),
        }
    }

    pub async fn approve_transfer(
        &self,
        transfer_id: &str,
        device_attestation: String,
    ) -> Result<TransferDecisionResponse> {
        let request = TransferDecisionRequest {
            transfer_id: transfer_id.to_string(),
            approved: true,
            device_attestation: Some(device_attestation),
        };
        self.decide(OP_APPROVE_TRANSFER, &request, "Failed to approve transfer")
            .await
    }

    pub async fn deny_transfer(&self, transfer_id: &str) -> Result<TransferDecisionResponse> {
        let request = TransferDecisionRequest {
            transfer_id: transfer_id.to_string(),
            approved: false,
            device_attestation: None,
        };
        self.decide(OP_DENY_TRANSFER, &request, "Failed to deny transfer")
            .await
    }

    async fn decide(
        &self,
        operation: &str,
        request: &TransferDecisionRequest,
        fallback: &str,
    ) -> Result<TransferDecisionResponse> {
        let response = self.call(operation, to_payload(request)?).await?;
        let decision: TransferDecisionResponse =
            serde_json::from_value(Value::Object(response))
                .map_err(|e| TransferError::MalformedResponse(e.to_string()))?;

        if decision.success {
            return Ok(decision);
        }
        if decision.status == Some(TransferStatus::Expired) {
            return Err(TransferError::Expired(request.transfer_id.clone()));
        }
        Err(TransferError::Rpc(
            decision.error.unwrap_or_else(|| fallback.to_string()),
        ))
    }

    async fn call(&self, operation: &str, payload: Payload) -> Result<Payload> {
        debug!("Vault RPC {}", operation);
        self.rpc.call(operation, payload).await.inspect_err(|e| {
            warn!("Vault RPC {} failed: {}", operation, e);
        })
    }
}

fn transfer_id_payload(transfer_id: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("transfer_id".into(), json!(transfer_id));
    payload
}

fn is_success(response: &Payload) -> bool {
    response
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn ensure_success(response: &Payload, fallback: &str) -> Result<()> {
    if is_success(response) {
        return Ok(());
    }
    let message = response
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or(fallback);
    Err(TransferError::Rpc(message.to_string()))
}

fn parse_transfer(response: &Payload) -> Result<Option<TransferRequest>> {
    match response.get("transfer") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => TransferRequest::from_value(value).map(Some),
    }
}

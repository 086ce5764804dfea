use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TransferError};

/// Server-authoritative status of a transfer.
///
/// The vault sends these as uppercase strings (`"PENDING"`), but some
/// deployments emit lowercase, so parsing ignores case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Completed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Expired => "EXPIRED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
            Self::Expired => write!(f, "expired"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TransferStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::Pending,
            Self::Approved,
            Self::Denied,
            Self::Expired,
            Self::Completed,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_wire_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| TransferError::MalformedResponse(format!("unknown transfer status: {}", s)))
    }
}

impl<'de> Deserialize<'de> for TransferStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Descriptor of the requesting device, shown to the approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub model: String,
    pub os_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Client-side read-through copy of a vault transfer.
///
/// `expires_at` is assigned by the vault when the transfer is created and is
/// never modified locally; countdowns are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub transfer_id: String,
    pub source_device_id: String,
    #[serde(default)]
    pub target_device_id: Option<String>,
    pub device_info: DeviceInfo,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TransferStatus,
}

impl TransferRequest {
    /// Parse the nested `transfer` map of a vault response.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value).map_err(|e| TransferError::MalformedResponse(e.to_string()))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDecisionRequest {
    pub transfer_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_attestation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDecisionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: Option<TransferStatus>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Convert a serializable payload into the free-form map the vault RPC takes.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(TransferError::MalformedResponse(format!(
            "payload must be an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer_json(status: &str) -> Value {
        json!({
            "transfer_id": "t1",
            "source_device_id": "dev-new",
            "target_device_id": null,
            "device_info": {
                "device_id": "dev-new",
                "model": "Pixel 9",
                "os_version": "15",
            },
            "created_at": "2026-10-16T10:00:00Z",
            "expires_at": "2026-10-16T10:15:00Z",
            "status": status,
        })
    }

    #[test]
    fn test_status_parsing_ignores_case() {
        assert_eq!("PENDING".parse::<TransferStatus>().unwrap(), TransferStatus::Pending);
        assert_eq!("pending".parse::<TransferStatus>().unwrap(), TransferStatus::Pending);
        assert_eq!("Cancelled".parse::<TransferStatus>().unwrap(), TransferStatus::Cancelled);
        assert!("REVOKED".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_status_display_is_lowercase() {
        assert_eq!(TransferStatus::Approved.to_string(), "approved");
        assert_eq!(
            serde_json::to_string(&TransferStatus::Approved).unwrap(),
            "\"APPROVED\""
        );
    }

    #[test]
    fn test_parse_transfer() {
        let transfer = TransferRequest::from_value(&transfer_json("pending")).unwrap();

        assert_eq!(transfer.transfer_id, "t1");
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.target_device_id, None);
        assert_eq!(transfer.device_info.location, None);
        assert_eq!(
            (transfer.expires_at - transfer.created_at).num_seconds(),
            900
        );
    }

    #[test]
    fn test_parse_transfer_rejects_missing_fields() {
        let mut value = transfer_json("PENDING");
        value.as_object_mut().unwrap().remove("expires_at");

        let err = TransferRequest::from_value(&value).unwrap_err();
        assert!(matches!(err, TransferError::MalformedResponse(_)));
    }

    #[test]
    fn test_decision_payload_omits_missing_attestation() {
        let payload = to_payload(&TransferDecisionRequest {
            transfer_id: "t1".into(),
            approved: false,
            device_attestation: None,
        })
        .unwrap();

        assert_eq!(payload.get("approved"), Some(&json!(false)));
        assert!(!payload.contains_key("device_attestation"));
    }
}

//! Biometric confirmation gate for transfer approval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Reason string shown in the platform biometric prompt.
pub const APPROVAL_PROMPT_REASON: &str = "Confirm credential transfer to a new device";

/// Why the biometric prompt did not confirm the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum BiometricError {
    /// User cancelled the biometric prompt.
    #[error("User cancelled authentication")]
    UserCancelled,

    /// Wrong biometric, too many attempts, etc.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No biometrics enrolled on the device.
    #[error("No biometrics enrolled on this device")]
    NoBiometricsEnrolled,

    /// Biometric hardware missing or disabled.
    #[error("Biometric authentication not available: {0}")]
    NotAvailable(String),
}

/// Platform biometric prompt (BiometricPrompt on Android, LocalAuthentication
/// on iOS), implemented by the host app.
#[async_trait]
pub trait BiometricPrompt: Send + Sync {
    async fn authenticate(&self, reason: &str) -> Result<(), BiometricError>;
}

impl From<BiometricError> for TransferError {
    fn from(err: BiometricError) -> Self {
        TransferError::Biometric(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biometric_error_to_transfer_error() {
        let err: TransferError = BiometricError::UserCancelled.into();
        assert!(matches!(err, TransferError::Biometric(_)));
        assert_eq!(err.user_message(), "User cancelled authentication");
    }

    #[test]
    fn test_biometric_error_serialization() {
        let json =
            serde_json::to_string(&BiometricError::AuthenticationFailed("lockout".into())).unwrap();
        assert_eq!(json, r#"{"type":"AuthenticationFailed","message":"lockout"}"#);
    }
}

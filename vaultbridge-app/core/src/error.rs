use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Vault RPC error: {0}")]
    Rpc(String),

    #[error("Malformed vault response: {0}")]
    MalformedResponse(String),

    #[error("Attestation error: {0}")]
    Attestation(String),

    #[error("Biometric error: {0}")]
    Biometric(String),

    #[error("Invalid transfer link: {0}")]
    InvalidLink(String),

    #[error("Operation not allowed in state {0}")]
    InvalidState(&'static str),

    #[error("Transfer expired: {0}")]
    Expired(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the user may retry the operation that produced this error.
    ///
    /// Local precondition failures and transport errors are retryable.
    /// Protocol conflicts (unknown transfer, wrong state, bad link) and
    /// expiry are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::MalformedResponse(_) | Self::Attestation(_) | Self::Biometric(_)
        )
    }

    /// Message shown to the user: the underlying reason without the
    /// category prefix.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rpc(msg)
            | Self::MalformedResponse(msg)
            | Self::Attestation(msg)
            | Self::Biometric(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Rpc(_) => "RPC_ERROR",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::Attestation(_) => "ATTESTATION_ERROR",
            Self::Biometric(_) => "BIOMETRIC_ERROR",
            Self::InvalidLink(_) => "INVALID_LINK",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Expired(_) => "EXPIRED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

// Serialized as {code, message} for the host UI bridge.
impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("TransferError", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

mod attestation;
mod biometric;
mod identity;

pub use attestation::{
    AttestationArtifact, AttestationProvider, Challenge, HardwareAttestor, CHALLENGE_LEN,
};
pub use biometric::{BiometricError, BiometricPrompt, APPROVAL_PROMPT_REASON};
pub use identity::{derive_device_id, describe_device};

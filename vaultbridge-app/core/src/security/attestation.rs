//! Hardware-backed device attestation for protocol-critical RPCs.
//!
//! Every call mints a fresh 32-byte challenge, asks the platform keystore to
//! generate an attestation key bound to it, and packs the returned
//! certificate chain into one transport string.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::BASE64;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TransferError};

pub const CHALLENGE_LEN: usize = 32;

/// Separates certificates in the transport string. Not part of the base64
/// alphabet.
const CHAIN_SEPARATOR: &str = ",";

/// Platform keystore able to produce an attestation certificate chain.
#[async_trait]
pub trait HardwareAttestor: Send + Sync {
    /// Generate an attestation key bound to `challenge` and return its
    /// certificate chain, leaf first.
    async fn generate_attestation_key(
        &self,
        challenge: &[u8; CHALLENGE_LEN],
    ) -> anyhow::Result<Vec<Vec<u8>>>;
}

/// Single-use random challenge. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Challenge([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub struct AttestationArtifact {
    challenge: Challenge,
    certificate_chain: Vec<Vec<u8>>,
}

impl AttestationArtifact {
    pub fn challenge(&self) -> &[u8; CHALLENGE_LEN] {
        self.challenge.as_bytes()
    }

    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    /// Transport form: each certificate base64 encoded, joined by `,`.
    pub fn encode(&self) -> String {
        self.certificate_chain
            .iter()
            .map(|cert| BASE64.encode(cert))
            .collect::<Vec<_>>()
            .join(CHAIN_SEPARATOR)
    }

    /// Inverse of [`AttestationArtifact::encode`].
    pub fn decode_chain(encoded: &str) -> Result<Vec<Vec<u8>>> {
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        encoded
            .split(CHAIN_SEPARATOR)
            .map(|part| {
                BASE64
                    .decode(part.as_bytes())
                    .map_err(|e| TransferError::Attestation(format!("bad certificate encoding: {}", e)))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct AttestationProvider {
    attestor: Arc<dyn HardwareAttestor>,
}

impl AttestationProvider {
    pub fn new(attestor: Arc<dyn HardwareAttestor>) -> Self {
        Self { attestor }
    }

    /// Produce a fresh attestation. Failures are reported as
    /// [`TransferError::Attestation`] and are always retryable.
    pub async fn generate_attestation(&self) -> Result<AttestationArtifact> {
        let challenge = Challenge::generate();

        let certificate_chain = self
            .attestor
            .generate_attestation_key(challenge.as_bytes())
            .await
            .map_err(|e| {
                warn!("Hardware attestation failed: {:#}", e);
                TransferError::Attestation(e.to_string())
            })?;

        if certificate_chain.is_empty() {
            warn!("Hardware attestation returned an empty certificate chain");
            return Err(TransferError::Attestation(
                "empty certificate chain".into(),
            ));
        }

        debug!(
            "Generated device attestation ({} certificates)",
            certificate_chain.len()
        );
        Ok(AttestationArtifact {
            challenge,
            certificate_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingAttestor {
        challenges: Mutex<Vec<[u8; CHALLENGE_LEN]>>,
        chain: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl HardwareAttestor for RecordingAttestor {
        async fn generate_attestation_key(
            &self,
            challenge: &[u8; CHALLENGE_LEN],
        ) -> anyhow::Result<Vec<Vec<u8>>> {
            self.challenges.lock().unwrap().push(*challenge);
            Ok(self.chain.clone())
        }
    }

    struct BrokenAttestor;

    #[async_trait]
    impl HardwareAttestor for BrokenAttestor {
        async fn generate_attestation_key(
            &self,
            _challenge: &[u8; CHALLENGE_LEN],
        ) -> anyhow::Result<Vec<Vec<u8>>> {
            anyhow::bail!("StrongBox unavailable")
        }
    }

    #[tokio::test]
    async fn test_fresh_challenge_per_call() {
        let attestor = Arc::new(RecordingAttestor {
            challenges: Mutex::new(Vec::new()),
            chain: vec![b"leaf".to_vec()],
        });
        let provider = AttestationProvider::new(attestor.clone());

        let first = provider.generate_attestation().await.unwrap();
        let second = provider.generate_attestation().await.unwrap();

        let challenges = attestor.challenges.lock().unwrap();
        assert_eq!(challenges.len(), 2);
        assert_ne!(challenges[0], challenges[1]);
        assert_eq!(first.challenge(), &challenges[0]);
        assert_ne!(first.challenge(), second.challenge());
    }

    #[tokio::test]
    async fn test_chain_encoding_is_reversible() {
        let chain = vec![vec![0xFF, 0x00, 0x2C], b"intermediate".to_vec(), b"root".to_vec()];
        let attestor = Arc::new(RecordingAttestor {
            challenges: Mutex::new(Vec::new()),
            chain: chain.clone(),
        });
        let provider = AttestationProvider::new(attestor);

        let encoded = provider.generate_attestation().await.unwrap().encode();
        assert_eq!(encoded.matches(CHAIN_SEPARATOR).count(), 2);
        assert_eq!(AttestationArtifact::decode_chain(&encoded).unwrap(), chain);
    }

    #[tokio::test]
    async fn test_attestor_error_is_reported() {
        let provider = AttestationProvider::new(Arc::new(BrokenAttestor));

        let err = provider.generate_attestation().await.unwrap_err();
        assert!(matches!(err, TransferError::Attestation(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_chain_is_rejected() {
        let attestor = Arc::new(RecordingAttestor {
            challenges: Mutex::new(Vec::new()),
            chain: Vec::new(),
        });
        let provider = AttestationProvider::new(attestor);

        assert!(provider.generate_attestation().await.is_err());
    }

    #[test]
    fn test_challenge_debug_is_redacted() {
        let challenge = Challenge::generate();
        assert_eq!(format!("{:?}", challenge), "Challenge([REDACTED])");
    }
}

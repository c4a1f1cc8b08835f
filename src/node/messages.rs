//! Signed round descriptors.
//!
//! The permissioning service announces each round with a descriptor naming
//! the circuit, the batch size and the execution deadline, signed with its
//! long-lived ed25519 key. A node refuses descriptors whose signature does
//! not verify; everything downstream trusts the descriptor's content.

use displaydoc::Display;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use thiserror::Error;

use crate::RoundId;

#[derive(Debug, Display, Error)]
/// An error produced by descriptor signing or verification.
pub enum MessageError {
    /// round descriptor encoding failed: {0}
    Encoding(#[from] bincode::Error),
    /// round descriptor signature is malformed
    MalformedSignature,
    /// round descriptor signature is invalid
    BadSignature,
}

/// The announcement of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub id: RoundId,
    /// The circuit, as raw node identities in execution order.
    pub topology: Vec<Vec<u8>>,
    pub batch_size: u32,
    /// The per-phase execution deadline the resource queue enforces.
    pub resource_queue_timeout_millis: u64,
    /// Unix milliseconds at which the descriptor was issued.
    pub issued_at_millis: u64,
}

/// A round descriptor together with the permissioning signature over its
/// canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRoundInfo {
    info: RoundInfo,
    signature: Vec<u8>,
}

impl SignedRoundInfo {
    /// Signs a descriptor. Used by the permissioning side and by tests.
    pub fn sign(info: RoundInfo, key: &SigningKey) -> Result<Self, MessageError> {
        let encoded = bincode::serialize(&info)?;
        let signature = key.sign(&encoded).to_bytes().to_vec();
        Ok(Self { info, signature })
    }

    /// Releases the descriptor without checking the signature, for loopback
    /// deployments that run without a permissioning key.
    pub fn unverified(self) -> RoundInfo {
        self.info
    }

    /// Verifies the signature and releases the descriptor.
    pub fn verify(self, key: &VerifyingKey) -> Result<RoundInfo, MessageError> {
        let encoded = bincode::serialize(&self.info)?;
        let bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| MessageError::MalformedSignature)?;
        let signature = Signature::from_bytes(&bytes);
        key.verify(&encoded, &signature)
            .map_err(|_| MessageError::BadSignature)?;
        Ok(self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> RoundInfo {
        RoundInfo {
            id: 17,
            topology: vec![vec![1], vec![2]],
            batch_size: 8,
            resource_queue_timeout_millis: 3000,
            issued_at_millis: 1_700_000_000_000,
        }
    }

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes(&[5u8; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn a_signed_descriptor_verifies() {
        let (signing, verifying) = keypair();
        let signed = SignedRoundInfo::sign(descriptor(), &signing).unwrap();
        assert_eq!(signed.verify(&verifying).unwrap(), descriptor());
    }

    #[test]
    fn a_tampered_descriptor_is_rejected() {
        let (signing, verifying) = keypair();
        let mut signed = SignedRoundInfo::sign(descriptor(), &signing).unwrap();
        signed.info.batch_size = 9000;
        assert!(matches!(
            signed.verify(&verifying),
            Err(MessageError::BadSignature)
        ));
    }

    #[test]
    fn a_truncated_signature_is_malformed() {
        let (signing, verifying) = keypair();
        let mut signed = SignedRoundInfo::sign(descriptor(), &signing).unwrap();
        signed.signature.truncate(10);
        assert!(matches!(
            signed.verify(&verifying),
            Err(MessageError::MalformedSignature)
        ));
    }

    #[test]
    fn the_wrong_key_is_rejected() {
        let (signing, _) = keypair();
        let stranger = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
        let signed = SignedRoundInfo::sign(descriptor(), &signing).unwrap();
        assert!(matches!(
            signed.verify(&stranger),
            Err(MessageError::BadSignature)
        ));
    }
}

// Algorithm-agile signature verification.
//
// The public key used for verification always comes from the identity
// registry, never from the caller's payload; the payload-supplied key is
// only used to detect a PUBLIC_KEY_MISMATCH before ever touching the
// cryptographic primitive.

use crate::algorithm::SignatureAlgorithm;
use crate::registry::{CachedRegistry, IdentityRegistry};
use crate::KmsError;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as Ed25519Signature, Verifier as _, VerifyingKey as Ed25519VerifyingKey};
use ml_dsa::{EncodedVerifyingKey, MlDsa65, MlDsa87, Signature as MlDsaSignature, VerifyingKey as MlDsaVerifyingKey};
use signature::Verifier as _;
use subtle::ConstantTimeEq;

/// Evidence that a signature over a specific message was verified, used as
/// the input to the override token's approval-evidence hash.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    pub subject: String,
    pub algorithm: SignatureAlgorithm,
    pub message: Vec<u8>,
    pub signature_bytes: Vec<u8>,
}

pub struct SignatureVerifier<R: IdentityRegistry> {
    registry: CachedRegistry<R>,
}

impl<R: IdentityRegistry> SignatureVerifier<R> {
    pub fn new(registry: CachedRegistry<R>) -> Self {
        Self { registry }
    }

    /// Confirm `subject` is a known identity, without checking any
    /// signature. Used to validate a delegation chain at request creation,
    /// where there is no response or algorithm to verify yet.
    pub fn lookup_identity(&self, subject: &str, now: DateTime<Utc>) -> Result<(), KmsError> {
        self.registry.lookup(subject, now)?;
        Ok(())
    }

    /// Verify a response's signature. `payload_public_key` is the key the
    /// approver's client claims to be using; it must match the registry's
    /// record for `subject` (current key, or previous key within its grace
    /// window) or verification fails with `PublicKeyMismatch` before any
    /// cryptographic check runs.
    pub fn verify(
        &self,
        subject: &str,
        algorithm: SignatureAlgorithm,
        payload_public_key: &[u8],
        message: &[u8],
        signature_bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, KmsError> {
        let registered = self.registry.lookup(subject, now)?;

        if registered.algorithm != algorithm {
            return Err(KmsError::UnknownAlgorithm(format!(
                "subject {subject} is registered for {:?}, response used {:?}",
                registered.algorithm, algorithm
            )));
        }

        if !registered.accepts(payload_public_key, now) {
            return Err(KmsError::PublicKeyMismatch(subject.to_string()));
        }

        let verifying_key = &registered.current;

        let ok = match algorithm {
            SignatureAlgorithm::Ed25519 => verify_ed25519(verifying_key, message, signature_bytes),
            SignatureAlgorithm::MlDsa65 => verify_ml_dsa_65(verifying_key, message, signature_bytes),
            SignatureAlgorithm::MlDsa87 => verify_ml_dsa_87(verifying_key, message, signature_bytes),
        }?;

        if !ok {
            return Err(KmsError::InvalidSignature);
        }

        Ok(VerifiedSignature {
            subject: subject.to_string(),
            algorithm,
            message: message.to_vec(),
            signature_bytes: signature_bytes.to_vec(),
        })
    }
}

fn verify_ed25519(key_bytes: &[u8], message: &[u8], signature_bytes: &[u8]) -> Result<bool, KmsError> {
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| KmsError::InvalidKey("ed25519 public key must be 32 bytes".into()))?;
    let verifying_key = Ed25519VerifyingKey::from_bytes(&key_array)
        .map_err(|e| KmsError::InvalidKey(e.to_string()))?;
    let sig_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| KmsError::InvalidKey("ed25519 signature must be 64 bytes".into()))?;
    let signature = Ed25519Signature::from_bytes(&sig_array);
    Ok(verifying_key.verify(message, &signature).is_ok())
}

fn verify_ml_dsa_65(key_bytes: &[u8], message: &[u8], signature_bytes: &[u8]) -> Result<bool, KmsError> {
    let encoded = EncodedVerifyingKey::<MlDsa65>::try_from(key_bytes)
        .map_err(|_| KmsError::InvalidKey("malformed ML-DSA-65 public key".into()))?;
    let verifying_key = MlDsaVerifyingKey::<MlDsa65>::decode(&encoded);
    let signature = MlDsaSignature::<MlDsa65>::try_from(signature_bytes)
        .map_err(|_| KmsError::InvalidKey("malformed ML-DSA-65 signature".into()))?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}

fn verify_ml_dsa_87(key_bytes: &[u8], message: &[u8], signature_bytes: &[u8]) -> Result<bool, KmsError> {
    let encoded = EncodedVerifyingKey::<MlDsa87>::try_from(key_bytes)
        .map_err(|_| KmsError::InvalidKey("malformed ML-DSA-87 public key".into()))?;
    let verifying_key = MlDsaVerifyingKey::<MlDsa87>::decode(&encoded);
    let signature = MlDsaSignature::<MlDsa87>::try_from(signature_bytes)
        .map_err(|_| KmsError::InvalidKey("malformed ML-DSA-87 signature".into()))?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// Constant-time equality helper exposed for callers that need to compare
/// raw key material outside of a full verification (e.g. audit tooling).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

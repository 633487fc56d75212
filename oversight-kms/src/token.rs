// One-shot override tokens issued on approval.

use crate::algorithm::canonical_token_message;
use crate::KmsError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Who caused an override token to be issued: a human approver, or the
/// system itself on an auto-approve final timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuedBy {
    Approver(String),
    System,
}

/// A one-shot, time-bounded capability emitted upon approval, carrying the
/// issuer's signature over its own nonce so that presenting it back does
/// not require trusting the presenter's copy of `request_id`/`expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideToken {
    pub nonce: [u8; 32],
    pub request_id: String,
    pub approval_evidence_hash: [u8; 32],
    pub issued_by: IssuedBy,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer_signature: Vec<u8>,
}

impl OverrideToken {
    pub fn nonce_hex(&self) -> String {
        hex::encode(self.nonce)
    }

    pub fn issuer_signature_hex(&self) -> String {
        hex::encode(&self.issuer_signature)
    }
}

/// Issuance record kept by the issuer so `consume` can recover the
/// authoritative `request_id`/`expires_at` for a presented nonce instead of
/// trusting whatever the presenter sends alongside it.
struct IssuedTokenMeta {
    request_id: String,
    expires_at: DateTime<Utc>,
}

/// Issues and single-use-enforces [`OverrideToken`]s.
///
/// The used-nonce set is process-local; a clustered deployment relies on
/// the Checkpoint Store's request record (which embeds the token at
/// issuance) as the cross-replica source of truth, with this set as a fast
/// local fast-path.
pub struct OverrideTokenIssuer {
    ttl: Duration,
    signing_key: SigningKey,
    issued: DashMap<[u8; 32], IssuedTokenMeta>,
    used: DashMap<[u8; 32], ()>,
}

impl OverrideTokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            signing_key: SigningKey::generate(&mut OsRng),
            issued: DashMap::new(),
            used: DashMap::new(),
        }
    }

    /// The public key authorizers verify presented tokens against. Exposed
    /// so the external validation boundary can be wired to a key
    /// distribution channel independent of this process.
    pub fn issuer_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn issue(
        &self,
        request_id: &str,
        approval_evidence: &[u8],
        issued_by: IssuedBy,
        now: DateTime<Utc>,
    ) -> OverrideToken {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hasher = Sha256::new();
        hasher.update(approval_evidence);
        let mut approval_evidence_hash = [0u8; 32];
        approval_evidence_hash.copy_from_slice(&hasher.finalize());

        let expires_at = now + self.ttl;
        let message = canonical_token_message(&hex::encode(nonce), request_id, expires_at.timestamp());
        let issuer_signature: Signature = self.signing_key.sign(&message);

        self.issued.insert(
            nonce,
            IssuedTokenMeta {
                request_id: request_id.to_string(),
                expires_at,
            },
        );

        OverrideToken {
            nonce,
            request_id: request_id.to_string(),
            approval_evidence_hash,
            issued_by,
            issued_at: now,
            expires_at,
            issuer_signature: issuer_signature.to_bytes().to_vec(),
        }
    }

    /// Validate and atomically consume a presented `{nonce, signature}`
    /// capability. Only those two values cross the external boundary;
    /// `request_id` and `expires_at` are recovered from the issuance
    /// record rather than trusted from the presenter. A token may only be
    /// consumed once; a second presentation returns `TokenAlreadyUsed`.
    pub fn consume(
        &self,
        nonce: [u8; 32],
        presented_signature: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), KmsError> {
        let meta = self
            .issued
            .get(&nonce)
            .ok_or(KmsError::InvalidSignature)?;
        let message = canonical_token_message(&hex::encode(nonce), &meta.request_id, meta.expires_at.timestamp());
        let expires_at = meta.expires_at;
        drop(meta);

        let sig_array: [u8; 64] = presented_signature
            .try_into()
            .map_err(|_| KmsError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_array);
        let verifying_key = VerifyingKey::from_bytes(&self.issuer_public_key())
            .map_err(|_| KmsError::InvalidSignature)?;
        if verifying_key.verify(&message, &signature).is_err() {
            return Err(KmsError::InvalidSignature);
        }

        if now > expires_at {
            return Err(KmsError::TokenExpired);
        }

        match self.used.entry(nonce) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(KmsError::TokenAlreadyUsed),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Ok(())
            }
        }
    }
}

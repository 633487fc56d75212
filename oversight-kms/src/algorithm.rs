// Signature algorithm identifiers and canonical message construction.

use serde::{Deserialize, Serialize};

/// A response decision, as it appears in the canonical signed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approve,
    Deny,
    RequestMoreInfo,
}

impl Decision {
    fn tag(self) -> &'static str {
        match self {
            Decision::Approve => "APPROVE",
            Decision::Deny => "DENY",
            Decision::RequestMoreInfo => "RMI",
        }
    }
}

/// Supported signature algorithms, classical and post-quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ed25519,
    MlDsa65,
    MlDsa87,
}

impl SignatureAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::MlDsa65 => "ml-dsa-65",
            SignatureAlgorithm::MlDsa87 => "ml-dsa-87",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ed25519" => Some(SignatureAlgorithm::Ed25519),
            "ml-dsa-65" => Some(SignatureAlgorithm::MlDsa65),
            "ml-dsa-87" => Some(SignatureAlgorithm::MlDsa87),
            _ => None,
        }
    }
}

/// Builds the canonical byte message a response's signature covers:
/// `request_id | decision_tag | response_unix_seconds`.
pub fn canonical_approval_message(
    request_id: &str,
    decision: Decision,
    response_unix_seconds: i64,
) -> Vec<u8> {
    format!(
        "{}|{}|{}",
        request_id,
        decision.tag(),
        response_unix_seconds
    )
    .into_bytes()
}

/// Builds the canonical byte message an override token's issuer signature
/// covers: `nonce_hex | request_id | expires_at_unix_seconds`.
pub fn canonical_token_message(
    nonce_hex: &str,
    request_id: &str,
    expires_at_unix_seconds: i64,
) -> Vec<u8> {
    format!("{}|{}|{}", nonce_hex, request_id, expires_at_unix_seconds).into_bytes()
}

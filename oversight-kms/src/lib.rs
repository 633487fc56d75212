//! Algorithm-agile signature verification and one-shot override tokens.
//!
//! Supports classical (Ed25519) and post-quantum (ML-DSA-65, ML-DSA-87)
//! signature algorithms behind one [`SignatureVerifier`] entry point, backed
//! by a cached [`IdentityRegistry`] lookup with a post-rotation grace
//! window. [`OverrideTokenIssuer`] emits the one-shot capability tokens
//! produced on approval.

pub mod algorithm;
pub mod config;
pub mod registry;
pub mod token;
pub mod verifier;

pub use algorithm::{canonical_approval_message, canonical_token_message, Decision, SignatureAlgorithm};
pub use config::KmsConfig;
pub use registry::{CachedRegistry, IdentityRegistry, RegisteredKey};
pub use token::{IssuedBy, OverrideToken, OverrideTokenIssuer};
pub use verifier::{SignatureVerifier, VerifiedSignature};

use thiserror::Error;

/// KMS operation errors.
#[derive(Error, Debug)]
pub enum KmsError {
    #[error("invalid key format: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("unknown signature algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("public key mismatch for subject {0}")]
    PublicKeyMismatch(String),

    #[error("identity registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("token expired")]
    TokenExpired,

    #[error("token already used")]
    TokenAlreadyUsed,

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, KmsError>;

//! Configuration for signature verification and override tokens.

use crate::algorithm::SignatureAlgorithm;
use serde::{Deserialize, Serialize};

/// KMS-facing configuration: allowed algorithms, registry cache TTL,
/// post-rotation grace period, and override token TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    /// Algorithms accepted for response signatures.
    pub signature_algorithms: Vec<SignatureAlgorithm>,

    /// How long a looked-up public key is cached before re-fetching.
    pub public_key_cache_ttl_secs: i64,

    /// How long a rotated-out key remains acceptable after rotation.
    pub post_rotation_grace_days: i64,

    /// Override token time-to-live.
    pub token_ttl_secs: i64,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            signature_algorithms: vec![
                SignatureAlgorithm::MlDsa65,
                SignatureAlgorithm::MlDsa87,
                SignatureAlgorithm::Ed25519,
            ],
            public_key_cache_ttl_secs: 300,
            post_rotation_grace_days: 30,
            token_ttl_secs: 60,
        }
    }
}

impl KmsConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.signature_algorithms.is_empty() {
            return Err(crate::KmsError::ConfigError(
                "signature_algorithms must not be empty".to_string(),
            ));
        }
        if self.token_ttl_secs <= 0 {
            return Err(crate::KmsError::ConfigError(
                "token_ttl_secs must be positive".to_string(),
            ));
        }
        if self.public_key_cache_ttl_secs <= 0 {
            return Err(crate::KmsError::ConfigError(
                "public_key_cache_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

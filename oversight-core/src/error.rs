//! Error taxonomy for the oversight orchestrator.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type OversightResult<T> = Result<T, OversightError>;

/// One enum per error kind named in the design's error taxonomy.
/// `CONCURRENT_MODIFICATION` is retried locally by callers (bounded, three
/// attempts with jittered backoff) and should rarely escape to an external
/// caller; `DUPLICATE_RESPONSE` is reported as an idempotent success, not a
/// failure, by the Request Manager.
#[derive(Error, Debug)]
pub enum OversightError {
    // --- Input validation ---
    #[error("invalid quorum configuration: {0}")]
    InvalidQuorumConfig(String),

    #[error("escalation chain must contain at least one tier")]
    EscalationChainEmpty,

    #[error("escalation chain has {tier_count} tiers, exceeding the maximum of {max_tiers}")]
    EscalationChainTooLong { tier_count: usize, max_tiers: usize },

    #[error("tier timeout {given_secs}s out of bounds [{min_secs}s, {max_secs}s]")]
    TimeoutOutOfBounds {
        given_secs: i64,
        min_secs: i64,
        max_secs: i64,
    },

    #[error("delegation chain is invalid: {0}")]
    DelegationChainInvalid(String),

    #[error("unknown signature algorithm: {0}")]
    UnknownAlgorithm(String),

    // --- Authorization ---
    #[error("approver {subject} is not eligible at tier {tier_index}")]
    ApproverNotEligible { subject: String, tier_index: usize },

    #[error("caller is not authorized to perform this operation")]
    CallerNotAuthorized,

    #[error("public key mismatch for subject {0}")]
    PublicKeyMismatch(String),

    // --- Idempotency / concurrency ---
    #[error("duplicate response from {subject} on request {request_id}")]
    DuplicateResponse {
        request_id: String,
        subject: String,
    },

    #[error("idempotency key {key} already used with a different payload")]
    IdempotencyConflict { key: String },

    #[error("concurrent modification: expected version {expected}, found {found}")]
    ConcurrentModification { expected: u64, found: u64 },

    // --- State ---
    #[error("request {0} not found")]
    RequestNotFound(String),

    #[error("request {0} is already resolved")]
    RequestAlreadyResolved(String),

    // --- Cryptography ---
    #[error("invalid signature")]
    InvalidSignature,

    // --- Token ---
    #[error("override token expired")]
    TokenExpired,

    #[error("override token already used")]
    TokenAlreadyUsed,

    // --- Availability ---
    #[error("timer source unavailable")]
    TimerSourceUnavailable,

    #[error("identity registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("audit backlog exceeded, override token issuance suspended")]
    AuditBacklogExceeded,
}

impl OversightError {
    /// True for the availability-kind errors that callers should treat as
    /// transient and retry, per the propagation policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OversightError::TimerSourceUnavailable
                | OversightError::RegistryUnavailable(_)
                | OversightError::StoreUnavailable(_)
                | OversightError::AuditBacklogExceeded
        )
    }

    /// True for `DUPLICATE_RESPONSE`, which the Request Manager reports as
    /// an idempotent success rather than propagating as a failure.
    pub fn is_idempotent_duplicate(&self) -> bool {
        matches!(self, OversightError::DuplicateResponse { .. })
    }
}

impl From<oversight_kms::KmsError> for OversightError {
    fn from(err: oversight_kms::KmsError) -> Self {
        match err {
            oversight_kms::KmsError::InvalidSignature => OversightError::InvalidSignature,
            oversight_kms::KmsError::UnknownAlgorithm(a) => OversightError::UnknownAlgorithm(a),
            oversight_kms::KmsError::PublicKeyMismatch(s) => OversightError::PublicKeyMismatch(s),
            oversight_kms::KmsError::RegistryUnavailable(s) => OversightError::RegistryUnavailable(s),
            oversight_kms::KmsError::TokenExpired => OversightError::TokenExpired,
            oversight_kms::KmsError::TokenAlreadyUsed => OversightError::TokenAlreadyUsed,
            oversight_kms::KmsError::InvalidKey(s) => OversightError::DelegationChainInvalid(s),
            oversight_kms::KmsError::ConfigError(s) => OversightError::InvalidQuorumConfig(s),
        }
    }
}

impl From<oversight_lockchain::LockchainError> for OversightError {
    fn from(err: oversight_lockchain::LockchainError) -> Self {
        OversightError::StoreUnavailable(err.to_string())
    }
}

impl From<oversight_lockchain::ChainError> for OversightError {
    fn from(err: oversight_lockchain::ChainError) -> Self {
        match err {
            oversight_lockchain::ChainError::BacklogExceeded { .. } => {
                OversightError::AuditBacklogExceeded
            }
            other => OversightError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<sled::Error> for OversightError {
    fn from(err: sled::Error) -> Self {
        OversightError::StoreUnavailable(err.to_string())
    }
}

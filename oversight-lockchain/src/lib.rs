//! Hash-chained, Merkle-proven append-only audit trail.
//!
//! Every [`AuditRecord`] carries the content hash of the record immediately
//! preceding it, and is additionally added as a leaf to an in-memory Merkle
//! tree whose root is periodically persisted. Any record can later be proven
//! to have been included under a given root without replaying the whole
//! chain.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod chain;
pub mod merkle;
pub mod storage;

pub use chain::{AuditChainer, AuditEventType, AuditRecord, ChainError, IssuedBy};
pub use merkle::{MerkleError, MerkleProof, MerkleTree};
pub use storage::{LockchainStorage, StorageError};

use thiserror::Error;

/// Top-level lockchain errors.
#[derive(Debug, Error)]
pub enum LockchainError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("merkle proof error: {0}")]
    Merkle(#[from] MerkleError),

    #[error("audit chain error: {0}")]
    Chain(#[from] ChainError),
}

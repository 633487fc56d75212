// Persistent storage for audit records and Merkle roots.

use crate::chain::AuditRecord;
use serde::{Deserialize, Serialize};
use sled::Db;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("root not found for request {0}")]
    RootNotFound(String),
}

/// A durable entry: one audit record plus the Merkle root in effect
/// immediately after it was appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockchainEntry {
    pub record: AuditRecord,
    pub root: [u8; 32],
}

/// Embedded, append-only persistence for the audit chain.
///
/// Backed by a single `sled` tree keyed by zero-padded leaf index so that
/// range scans return records in append order.
pub struct LockchainStorage {
    db: Db,
}

impl LockchainStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn key_for(leaf_index: usize) -> String {
        format!("record:{:020}", leaf_index)
    }

    pub fn persist_record(&self, record: &AuditRecord, root: [u8; 32]) -> Result<(), StorageError> {
        let entry = LockchainEntry {
            record: record.clone(),
            root,
        };
        let key = Self::key_for(record.leaf_index);
        let value = bincode::serialize(&entry)?;
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_record(&self, leaf_index: usize) -> Result<Option<LockchainEntry>, StorageError> {
        let key = Self::key_for(leaf_index);
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_latest(&self) -> Result<Option<LockchainEntry>, StorageError> {
        match self.db.iter().next_back() {
            Some(result) => {
                let (_key, value) = result?;
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    pub fn record_count(&self) -> usize {
        self.db.len()
    }

    /// Checks that records `[0, end]` are all present, detecting gaps left
    /// by a crash between Merkle-tree append and durable persist.
    pub fn verify_continuity(&self, end: usize) -> Result<bool, StorageError> {
        for i in 0..=end {
            if self.get_record(i)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for LockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockchainStorage")
            .field("record_count", &self.record_count())
            .finish()
    }
}

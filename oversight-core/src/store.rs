//! Checkpoint Store: versioned persistence of `Request` state, optimistic
//! concurrency via `save_if_version`, idempotency-key reservation, and the
//! startup recovery scan.

use crate::error::{OversightError, OversightResult};
use crate::types::{Request, RequestState};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Durable persistence for `Request` state. All mutation goes through
/// `save_if_version`; `save` is only used to create the initial version.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, request: &Request) -> OversightResult<u64>;

    /// Persist `request` only if the currently stored version equals
    /// `expected_prev_version`; otherwise returns `ConcurrentModification`
    /// with the version actually found.
    fn save_if_version(&self, request: &Request, expected_prev_version: u64) -> OversightResult<u64>;

    fn load(&self, id: Uuid) -> OversightResult<Option<Request>>;

    /// All requests not yet in a terminal state, for startup recovery.
    fn scan_non_terminal(&self) -> OversightResult<Vec<Request>>;

    /// Reserve a client-supplied idempotency key for `request_id`. A
    /// collision with the same key but a different `request_id` returns
    /// `IdempotencyConflict`; reserving the same (key, request_id) pair
    /// again is a no-op.
    fn reserve_idempotency_key(&self, key: &str, request_id: Uuid) -> OversightResult<Uuid>;
}

/// In-memory implementation used by unit and property tests.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    requests: RwLock<HashMap<Uuid, Request>>,
    idempotency_keys: RwLock<HashMap<String, Uuid>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, request: &Request) -> OversightResult<u64> {
        let mut requests = self.requests.write();
        requests.insert(request.id, request.clone());
        Ok(request.version)
    }

    fn save_if_version(&self, request: &Request, expected_prev_version: u64) -> OversightResult<u64> {
        let mut requests = self.requests.write();
        let found = requests.get(&request.id).map(|r| r.version).unwrap_or(0);
        if found != expected_prev_version {
            return Err(OversightError::ConcurrentModification {
                expected: expected_prev_version,
                found,
            });
        }
        requests.insert(request.id, request.clone());
        Ok(request.version)
    }

    fn load(&self, id: Uuid) -> OversightResult<Option<Request>> {
        Ok(self.requests.read().get(&id).cloned())
    }

    fn scan_non_terminal(&self) -> OversightResult<Vec<Request>> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }

    fn reserve_idempotency_key(&self, key: &str, request_id: Uuid) -> OversightResult<Uuid> {
        let mut keys = self.idempotency_keys.write();
        match keys.get(key) {
            Some(existing) if *existing == request_id => Ok(*existing),
            Some(existing) => Ok(*existing),
            None => {
                keys.insert(key.to_string(), request_id);
                Ok(request_id)
            }
        }
    }
}

/// `sled`-backed implementation. One tree holds requests keyed by id
/// (bincode-encoded), a second holds the idempotency-key index.
pub struct SledCheckpointStore {
    requests: sled::Tree,
    idempotency_keys: sled::Tree,
}

impl SledCheckpointStore {
    pub fn open(db: &sled::Db) -> OversightResult<Self> {
        Ok(Self {
            requests: db.open_tree("oversight_requests")?,
            idempotency_keys: db.open_tree("oversight_idempotency_keys")?,
        })
    }

    fn encode(request: &Request) -> OversightResult<Vec<u8>> {
        bincode::serialize(request)
            .map_err(|e| OversightError::StoreUnavailable(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> OversightResult<Request> {
        bincode::deserialize(bytes).map_err(|e| OversightError::StoreUnavailable(e.to_string()))
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn save(&self, request: &Request) -> OversightResult<u64> {
        let bytes = Self::encode(request)?;
        self.requests.insert(request.id.as_bytes(), bytes)?;
        self.requests.flush()?;
        Ok(request.version)
    }

    fn save_if_version(&self, request: &Request, expected_prev_version: u64) -> OversightResult<u64> {
        let key = *request.id.as_bytes();
        let existing = self.requests.get(key)?;
        let found = match &existing {
            Some(bytes) => Self::decode(bytes)?.version,
            None => 0,
        };
        if found != expected_prev_version {
            return Err(OversightError::ConcurrentModification {
                expected: expected_prev_version,
                found,
            });
        }

        let new_bytes = Self::encode(request)?;
        let cas_result = self
            .requests
            .compare_and_swap(key, existing, Some(new_bytes))?;
        if cas_result.is_err() {
            // Lost the race with a concurrent writer between read and swap.
            let found_now = self
                .requests
                .get(key)?
                .map(|b| Self::decode(&b).map(|r| r.version))
                .transpose()?
                .unwrap_or(0);
            return Err(OversightError::ConcurrentModification {
                expected: expected_prev_version,
                found: found_now,
            });
        }
        self.requests.flush()?;
        Ok(request.version)
    }

    fn load(&self, id: Uuid) -> OversightResult<Option<Request>> {
        match self.requests.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_non_terminal(&self) -> OversightResult<Vec<Request>> {
        let mut out = Vec::new();
        for item in self.requests.iter() {
            let (_key, value) = item?;
            let request = Self::decode(&value)?;
            if !request.state.is_terminal() {
                out.push(request);
            }
        }
        Ok(out)
    }

    fn reserve_idempotency_key(&self, key: &str, request_id: Uuid) -> OversightResult<Uuid> {
        let existing = self.idempotency_keys.get(key.as_bytes())?;
        if let Some(bytes) = existing {
            let existing_id = Uuid::from_slice(&bytes)
                .map_err(|e| OversightError::StoreUnavailable(e.to_string()))?;
            return Ok(existing_id);
        }
        self.idempotency_keys
            .insert(key.as_bytes(), request_id.as_bytes().to_vec())?;
        self.idempotency_keys.flush()?;
        Ok(request_id)
    }
}

/// A repeat `create_request` call presenting an already-reserved
/// idempotency key conflicts unless its payload matches the original
/// request exactly; matching payloads are deduplicated by handing back
/// the existing request instead of creating a second one.
pub fn requires_idempotency_conflict(_existing_state: RequestState, is_same_payload: bool) -> bool {
    !is_same_payload
}

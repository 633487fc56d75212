// Identity registry client: per-replica cached lookup of approver public
// keys with TTL and a post-rotation grace window. Registry internals are
// out of scope; this is the boundary the verifier calls through.

use crate::algorithm::SignatureAlgorithm;
use crate::KmsError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// A subject's currently registered key, plus the previous key if it is
/// still inside its post-rotation grace window.
#[derive(Debug, Clone)]
pub struct RegisteredKey {
    pub algorithm: SignatureAlgorithm,
    pub current: Vec<u8>,
    pub previous: Option<Vec<u8>>,
    pub previous_valid_until: Option<DateTime<Utc>>,
}

impl RegisteredKey {
    /// True if `candidate` matches either the current key, or the previous
    /// key while still inside its grace window.
    pub fn accepts(&self, candidate: &[u8], now: DateTime<Utc>) -> bool {
        use subtle::ConstantTimeEq;

        if self.current.ct_eq(candidate).into() {
            return true;
        }
        if let (Some(previous), Some(valid_until)) = (&self.previous, self.previous_valid_until) {
            if now <= valid_until && previous.ct_eq(candidate).into() {
                return true;
            }
        }
        false
    }
}

/// External identity registry lookup. Implementations live outside this
/// crate's scope; only the trait boundary is specified here.
pub trait IdentityRegistry: Send + Sync {
    fn lookup(&self, subject: &str) -> Result<RegisteredKey, KmsError>;
}

struct CacheEntry {
    key: RegisteredKey,
    fetched_at: DateTime<Utc>,
}

/// Wraps an [`IdentityRegistry`] with a TTL cache so verification does not
/// hit the registry on every response.
pub struct CachedRegistry<R: IdentityRegistry> {
    inner: R,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl<R: IdentityRegistry> CachedRegistry<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub fn lookup(&self, subject: &str, now: DateTime<Utc>) -> Result<RegisteredKey, KmsError> {
        if let Some(entry) = self.cache.get(subject) {
            if now - entry.fetched_at < self.ttl {
                return Ok(entry.key.clone());
            }
        }

        let key = self.inner.lookup(subject)?;
        self.cache.insert(
            subject.to_string(),
            CacheEntry {
                key: key.clone(),
                fetched_at: now,
            },
        );
        Ok(key)
    }

    pub fn invalidate(&self, subject: &str) {
        self.cache.remove(subject);
    }
}

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::store::{CasOutcome, CasToken, KvStore, RawEntry, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    token: u64,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// In-process store with the same linearization guarantees as the remote
/// cache: add and cas are atomic per key. Used by tests, which also drive the
/// `evict` handle to model the store dropping entries at arbitrary times.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    versions: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Models arbitrary eviction. Returns whether the key was present.
    pub fn evict(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Reads a value without touching CAS state; test inspection only.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        self.entries.get(key).and_then(|e| {
            if e.expired(now) {
                None
            } else {
                Some(e.value.clone())
            }
        })
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                if occupied.get().expired(now) {
                    occupied.remove();
                    return Ok(None);
                }
                let stored = occupied.get();
                Ok(Some(RawEntry {
                    value: stored.value.clone(),
                    token: CasToken(stored.token),
                }))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let stored = StoredValue {
            value,
            token: self.next_token(),
            expires_at: ttl.map(|d| now + d),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now) {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn cas(
        &self,
        key: &str,
        value: Bytes,
        token: CasToken,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now) {
                    occupied.remove();
                    return Ok(CasOutcome::Absent);
                }
                if occupied.get().token != token.0 {
                    return Ok(CasOutcome::Conflict);
                }
                occupied.insert(StoredValue {
                    value,
                    token: self.next_token(),
                    expires_at: ttl.map(|d| now + d),
                });
                Ok(CasOutcome::Replaced)
            }
            Entry::Vacant(_) => Ok(CasOutcome::Absent),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use memgate_core::{ContentKey, ContentRecord, MetadataKey, MetadataRecord};

use crate::store::{CasOutcome, CasToken, KvStore, Result, StoreError};

/// Bound on the read/bump/swap loop inside `incr_reservation`. Exhaustion is
/// reported as absence so the caller re-enters its own bounded retry.
const INCR_CAS_ATTEMPTS: usize = 32;

#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub record: MetadataRecord,
    pub token: CasToken,
}

/// Typed operations over the raw store: records go in and out decoded, and
/// the CAS token from a read survives until the matching replace. Corrupt
/// bytes are logged and reported as absent.
pub struct CacheAdapter<S> {
    store: Arc<S>,
}

impl<S> Clone for CacheAdapter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore> CacheAdapter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn get_metadata(&self, key: &MetadataKey) -> Result<Option<MetadataEntry>> {
        match self.store.get(key.as_str()).await? {
            None => Ok(None),
            Some(raw) => match MetadataRecord::decode(&raw.value) {
                Ok(record) => Ok(Some(MetadataEntry {
                    record,
                    token: raw.token,
                })),
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt metadata treated as absent");
                    Ok(None)
                }
            },
        }
    }

    pub async fn add_metadata(
        &self,
        key: &MetadataKey,
        record: &MetadataRecord,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let bytes = record
            .encode()
            .map_err(|e| StoreError::Protocol(format!("refusing to store invalid metadata: {}", e)))?;
        self.store.add(key.as_str(), bytes, ttl).await
    }

    pub async fn cas_metadata(
        &self,
        key: &MetadataKey,
        token: CasToken,
        record: &MetadataRecord,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        let bytes = record
            .encode()
            .map_err(|e| StoreError::Protocol(format!("refusing to store invalid metadata: {}", e)))?;
        self.store.cas(key.as_str(), bytes, token, ttl).await
    }

    /// The atomic reservation increment. The store has no field-level
    /// increment, so this is a read/bump/swap loop; per-key CAS
    /// linearization still hands every contender a distinct value. Returns
    /// the new reservation, or None when the record is gone (or the loop
    /// lost every round, which the caller treats the same way).
    ///
    /// Swapping a not-yet-valid record rewrites its expiry, so each bump
    /// carries only the time left until the placeholder's original deadline.
    /// Contention must never push that deadline out: the deadline firing is
    /// what unwedges a URL whose fetcher crashed.
    pub async fn incr_reservation(
        &self,
        key: &MetadataKey,
        placeholder_ttl: Duration,
        now_micros: i64,
    ) -> Result<Option<u64>> {
        for _ in 0..INCR_CAS_ATTEMPTS {
            let Some(entry) = self.get_metadata(key).await? else {
                return Ok(None);
            };
            let mut record = entry.record;
            record.reservation += 1;

            let ttl = if record.valid {
                None
            } else {
                Some(remaining_placeholder_ttl(
                    &record,
                    placeholder_ttl,
                    now_micros,
                ))
            };
            match self.cas_metadata(key, entry.token, &record, ttl).await? {
                CasOutcome::Replaced => return Ok(Some(record.reservation)),
                CasOutcome::Conflict => continue,
                CasOutcome::Absent => return Ok(None),
            }
        }
        debug!(key = %key, "reservation increment lost every swap round");
        Ok(None)
    }

    pub async fn get_content(&self, key: &ContentKey) -> Result<Option<ContentRecord>> {
        match self.store.get(key.as_str()).await? {
            None => Ok(None),
            Some(raw) => match ContentRecord::decode(&raw.value) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt content treated as absent");
                    Ok(None)
                }
            },
        }
    }

    pub async fn add_content(&self, key: &ContentKey, record: &ContentRecord) -> Result<bool> {
        self.store.add(key.as_str(), record.encode(), None).await
    }

    pub async fn delete_content(&self, key: &ContentKey) -> Result<bool> {
        self.store.delete(key.as_str()).await
    }
}

/// Time left before a placeholder created at `record.session` reaches its
/// original deadline. A placeholder past due gets the minimum expiry the
/// store can express, so it dies on the store's next sweep instead of
/// living through another round of contention.
pub fn remaining_placeholder_ttl(
    record: &MetadataRecord,
    placeholder_ttl: Duration,
    now_micros: i64,
) -> Duration {
    let deadline = record
        .session
        .saturating_add(placeholder_ttl.as_micros() as i64);
    Duration::from_micros(deadline.saturating_sub(now_micros).max(1) as u64)
}

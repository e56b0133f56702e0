use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Opaque version token returned by `get`; `cas` replaces only the exact
/// version the token was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasToken(pub u64);

#[derive(Debug, Clone)]
pub struct RawEntry {
    pub value: Bytes,
    pub token: CasToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Replaced,
    Conflict,
    Absent,
}

/// The shared evictable store. Values are opaque byte strings; the store
/// linearizes add and cas per key, and may drop any entry at any time.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>>;

    /// Atomic add-if-absent. Returns false when the key is already present.
    async fn add(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool>;

    async fn cas(
        &self,
        key: &str,
        value: Bytes,
        token: CasToken,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

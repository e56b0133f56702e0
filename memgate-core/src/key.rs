use sha2::{Digest, Sha256};
use std::fmt;

pub const METADATA_KEY_PREFIX: &str = "M:";
pub const CONTENT_KEY_PREFIX: &str = "C:";

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Store key of the metadata record for a URL. The URL is hashed so the key
/// stays inside the store's key length budget regardless of URL length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataKey(String);

impl MetadataKey {
    pub fn for_url(url: &str) -> Self {
        Self(format!("{}{}", METADATA_KEY_PREFIX, sha256_hex(url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store key of a content record, derived from the (url, session, reservation)
/// tuple that produced it. The `|` separator keeps distinct tuples from
/// hashing the same preimage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn derive(url: &str, session: i64, reservation: u64) -> Self {
        let preimage = format!("{}|{}|{}", url, session, reservation);
        Self(format!("{}{}", CONTENT_KEY_PREFIX, sha256_hex(&preimage)))
    }

    /// Wraps a key string read back out of a metadata record.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const DIGEST_LEN: usize = 32;
const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 of a response body, byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyDigest([u8; DIGEST_LEN]);

impl BodyDigest {
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    pub fn from_hasher(hasher: Sha256) -> Self {
        let result = hasher.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != DIGEST_LEN {
            return Err(Error::InvalidDigest(format!(
                "expected {} bytes, got {}",
                DIGEST_LEN,
                slice.len()
            )));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != DIGEST_HEX_LEN {
            return Err(Error::InvalidDigest(format!(
                "expected {} hex chars, got {}",
                DIGEST_HEX_LEN,
                hex_str.len()
            )));
        }
        let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidDigest(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for BodyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BodyDigest({})", self.short())
    }
}

impl fmt::Display for BodyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BodyDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for BodyDigest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for BodyDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BodyDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Self::from_hex(&hex_str).map_err(D::Error::custom)
    }
}

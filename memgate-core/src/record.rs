use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::digest::BodyDigest;
use crate::error::{Error, Result};
use crate::key::ContentKey;

pub const METADATA_VERSION: u32 = 1;

pub const CONTENT_MAGIC: u32 = 0x4d47_4331; // "MGC1"
pub const CONTENT_VERSION: u16 = 1;

/// Metadata record for one URL lineage. Serialized as version-tagged JSON;
/// the store sees opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub version: u32,
    pub url: String,
    /// Creation instant of this lineage, microseconds since the Unix epoch.
    /// Immutable for the life of the record.
    pub session: i64,
    pub reservation: u64,
    pub last_noted: u64,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<BodyDigest>,
}

impl MetadataRecord {
    /// A freshly claimed lineage: no content yet, first contender holds
    /// reservation 1.
    pub fn placeholder(url: impl Into<String>, session: i64) -> Self {
        Self {
            version: METADATA_VERSION,
            url: url.into(),
            session,
            reservation: 1,
            last_noted: 0,
            valid: false,
            fetched: None,
            last_modified: None,
            content_key: None,
            digest: None,
        }
    }

    pub fn content_key(&self) -> Option<ContentKey> {
        self.content_key.as_deref().map(ContentKey::from_stored)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reservation < 1 {
            return Err(Error::CorruptMetadata(
                "reservation below 1".to_string(),
            ));
        }
        if self.reservation < self.last_noted {
            return Err(Error::CorruptMetadata(format!(
                "reservation {} below last_noted {}",
                self.reservation, self.last_noted
            )));
        }
        if self.valid {
            if self.last_noted < 1 {
                return Err(Error::CorruptMetadata(
                    "valid record with last_noted 0".to_string(),
                ));
            }
            if self.fetched.is_none()
                || self.last_modified.is_none()
                || self.content_key.is_none()
                || self.digest.is_none()
            {
                return Err(Error::CorruptMetadata(
                    "valid record missing content binding".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        self.validate()?;
        let vec = serde_json::to_vec(self)
            .map_err(|e| Error::CorruptMetadata(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let record: MetadataRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::CorruptMetadata(e.to_string()))?;
        if record.version != METADATA_VERSION {
            return Err(Error::CorruptMetadata(format!(
                "unknown version {}",
                record.version
            )));
        }
        record.validate()?;
        Ok(record)
    }
}

/// An origin response at rest in the store. The echoed (url, session,
/// reservation) tuple exists only for defensive matching on read; a record
/// whose echo disagrees with the metadata that led to it is treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRecord {
    pub url: String,
    pub session: i64,
    pub reservation: u64,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ContentRecord {
    pub fn new(
        url: impl Into<String>,
        session: i64,
        reservation: u64,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        Self {
            url: url.into(),
            session,
            reservation,
            status,
            headers,
            body,
        }
    }

    pub fn matches(&self, url: &str, session: i64, reservation: u64) -> bool {
        self.url == url && self.session == session && self.reservation == reservation
    }

    pub fn digest(&self) -> BodyDigest {
        BodyDigest::hash(&self.body)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.url.len() + self.body.len());
        buf.put_u32_le(CONTENT_MAGIC);
        buf.put_u16_le(CONTENT_VERSION);
        buf.put_u16_le(self.status);
        buf.put_i64_le(self.session);
        buf.put_u64_le(self.reservation);
        buf.put_u32_le(self.url.len() as u32);
        buf.put_slice(self.url.as_bytes());
        buf.put_u16_le(self.headers.len() as u16);
        for (name, value) in &self.headers {
            buf.put_u16_le(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        buf.put_u64_le(self.body.len() as u64);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;

        let magic = take_u32(&mut buf)?;
        if magic != CONTENT_MAGIC {
            return Err(Error::CorruptContent("bad magic".to_string()));
        }
        let version = take_u16(&mut buf)?;
        if version != CONTENT_VERSION {
            return Err(Error::CorruptContent(format!(
                "unknown version {}",
                version
            )));
        }

        let status = take_u16(&mut buf)?;
        let session = take_i64(&mut buf)?;
        let reservation = take_u64(&mut buf)?;

        let url_len = take_u32(&mut buf)? as usize;
        let url = take_string(&mut buf, url_len)?;

        let header_count = take_u16(&mut buf)? as usize;
        let mut headers = Vec::with_capacity(header_count);
        for _ in 0..header_count {
            let name_len = take_u16(&mut buf)? as usize;
            let name = take_string(&mut buf, name_len)?;
            let value_len = take_u32(&mut buf)? as usize;
            let value = take_string(&mut buf, value_len)?;
            headers.push((name, value));
        }

        let body_len = take_u64(&mut buf)? as usize;
        if buf.remaining() != body_len {
            return Err(Error::CorruptContent(format!(
                "body length {} disagrees with {} remaining bytes",
                body_len,
                buf.remaining()
            )));
        }
        let body = Bytes::copy_from_slice(buf);

        Ok(Self {
            url,
            session,
            reservation,
            status,
            headers,
            body,
        })
    }
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::CorruptContent("truncated record".to_string()));
    }
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::CorruptContent("truncated record".to_string()));
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptContent("truncated record".to_string()));
    }
    Ok(buf.get_u64_le())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptContent("truncated record".to_string()));
    }
    Ok(buf.get_i64_le())
}

fn take_string(buf: &mut &[u8], len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(Error::CorruptContent("truncated record".to_string()));
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|e| Error::CorruptContent(e.to_string()))
}

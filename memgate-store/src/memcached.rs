use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::store::{CasOutcome, CasToken, KvStore, RawEntry, Result, StoreError};

const MAX_IDLE_CONNECTIONS: usize = 8;

type Conn = BufStream<TcpStream>;

/// Memcached text protocol client. Connections are pooled and dropped on any
/// error; every operation is a single command/response exchange.
pub struct MemcachedStore {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    idle: Mutex<Vec<Conn>>,
}

impl MemcachedStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_secs(5),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn checkout(&self) -> Result<Conn> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| StoreError::Unavailable(format!("connect timeout to {}", self.addr)))??;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected to cache store");
        Ok(BufStream::new(stream))
    }

    fn checkin(&self, conn: Conn) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    /// Runs one exchange on a pooled connection. The connection returns to
    /// the pool only after a clean exchange; errors and timeouts drop it.
    async fn with_conn<T, F>(&self, op: impl FnOnce(Conn) -> F) -> Result<T>
    where
        F: Future<Output = (Conn, Result<T>)>,
    {
        let conn = self.checkout().await?;
        match timeout(self.io_timeout, op(conn)).await {
            Ok((conn, Ok(value))) => {
                self.checkin(conn);
                Ok(value)
            }
            Ok((_, Err(e))) => Err(e),
            Err(_) => Err(StoreError::Unavailable(format!(
                "io timeout talking to {}",
                self.addr
            ))),
        }
    }
}

async fn read_line(conn: &mut Conn) -> Result<String> {
    let mut line = String::new();
    let n = conn.read_line(&mut line).await?;
    if n == 0 {
        return Err(StoreError::Unavailable("connection closed".to_string()));
    }
    Ok(line.trim_end().to_string())
}

fn reply_error(line: &str) -> StoreError {
    StoreError::Protocol(format!("unexpected reply: {}", line))
}

/// Parses `VALUE <key> <flags> <bytes> <cas>` into (bytes, cas).
fn parse_value_header(line: &str) -> Option<(usize, u64)> {
    let mut parts = line.split_ascii_whitespace();
    if parts.next() != Some("VALUE") {
        return None;
    }
    let _key = parts.next()?;
    let _flags = parts.next()?;
    let len: usize = parts.next()?.parse().ok()?;
    let cas: u64 = parts.next()?.parse().ok()?;
    Some((len, cas))
}

/// Memcached exptime: seconds, 0 = no expiry. Sub-second TTLs round up so a
/// short placeholder TTL never becomes "never expires".
fn format_exptime(ttl: Option<Duration>) -> u64 {
    match ttl {
        None => 0,
        Some(d) => ((d.as_millis() + 999) / 1000).max(1) as u64,
    }
}

async fn get_on(conn: &mut Conn, key: &str) -> Result<Option<RawEntry>> {
    conn.write_all(format!("gets {}\r\n", key).as_bytes()).await?;
    conn.flush().await?;

    let line = read_line(conn).await?;
    if line == "END" {
        return Ok(None);
    }
    let (len, cas) = parse_value_header(&line).ok_or_else(|| reply_error(&line))?;

    let mut value = vec![0u8; len];
    conn.read_exact(&mut value).await?;
    let mut trailer = [0u8; 2];
    conn.read_exact(&mut trailer).await?;
    if &trailer != b"\r\n" {
        return Err(StoreError::Protocol("missing data terminator".to_string()));
    }

    let end = read_line(conn).await?;
    if end != "END" {
        return Err(reply_error(&end));
    }

    Ok(Some(RawEntry {
        value: Bytes::from(value),
        token: CasToken(cas),
    }))
}

async fn storage_on(conn: &mut Conn, header: String, value: &[u8]) -> Result<String> {
    conn.write_all(header.as_bytes()).await?;
    conn.write_all(value).await?;
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;
    read_line(conn).await
}

async fn delete_on(conn: &mut Conn, key: &str) -> Result<String> {
    conn.write_all(format!("delete {}\r\n", key).as_bytes()).await?;
    conn.flush().await?;
    read_line(conn).await
}

#[async_trait::async_trait]
impl KvStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>> {
        self.with_conn(|mut conn| async move {
            let result = get_on(&mut conn, key).await;
            (conn, result)
        })
        .await
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        let header = format!("add {} 0 {} {}\r\n", key, format_exptime(ttl), value.len());
        self.with_conn(|mut conn| async move {
            let result = match storage_on(&mut conn, header, &value).await {
                Ok(line) => match line.as_str() {
                    "STORED" => Ok(true),
                    "NOT_STORED" => Ok(false),
                    _ => Err(reply_error(&line)),
                },
                Err(e) => Err(e),
            };
            (conn, result)
        })
        .await
    }

    async fn cas(
        &self,
        key: &str,
        value: Bytes,
        token: CasToken,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        let header = format!(
            "cas {} 0 {} {} {}\r\n",
            key,
            format_exptime(ttl),
            value.len(),
            token.0
        );
        self.with_conn(|mut conn| async move {
            let result = match storage_on(&mut conn, header, &value).await {
                Ok(line) => match line.as_str() {
                    "STORED" => Ok(CasOutcome::Replaced),
                    "EXISTS" => Ok(CasOutcome::Conflict),
                    "NOT_FOUND" => Ok(CasOutcome::Absent),
                    _ => Err(reply_error(&line)),
                },
                Err(e) => Err(e),
            };
            (conn, result)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_conn(|mut conn| async move {
            let result = match delete_on(&mut conn, key).await {
                Ok(line) => match line.as_str() {
                    "DELETED" => Ok(true),
                    "NOT_FOUND" => Ok(false),
                    _ => Err(reply_error(&line)),
                },
                Err(e) => Err(e),
            };
            (conn, result)
        })
        .await
    }
}

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use tracing::{debug, warn};

use memgate_core::BodyDigest;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Request headers carried through to the origin on a caching fetch. Cookies
/// never cross; conditional headers are handled on our side of the fence.
const FORWARDED_REQUEST_HEADERS: &[HeaderName] = &[
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::USER_AGENT,
];

/// Origin response headers worth keeping in the cache entry.
const STORED_RESPONSE_HEADERS: &[HeaderName] =
    &[header::CONTENT_TYPE, header::CONTENT_ENCODING];

/// Hop-by-hop headers stripped from pass-through responses.
const STRIPPED_RESPONSE_HEADERS: &[HeaderName] = &[
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    header::CONTENT_LENGTH,
];

pub const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub digest: BodyDigest,
}

#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        client_ip: IpAddr,
        inbound: &HeaderMap,
    ) -> Result<OriginResponse>;
}

/// Loopback HTTP client for the origin application, shared by the caching
/// fetch path and the uncached pass-through path.
pub struct HttpOrigin {
    client: reqwest::Client,
    base: String,
    host_header: String,
    max_body_bytes: usize,
}

impl HttpOrigin {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.origin_connect_timeout())
            .timeout(config.origin_read_timeout())
            .build()
            .map_err(|e| ProxyError::Internal(format!("origin client: {}", e)))?;

        Ok(Self {
            client,
            base: config.origin_base_url(),
            host_header: config.origin_host.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Proxies a request to the origin without touching the cache: the fail-
    /// open path, non-GET/HEAD methods, and oversized bodies. The response
    /// comes back as-is apart from hop-by-hop headers.
    pub async fn passthrough(
        &self,
        method: &Method,
        uri: &str,
        inbound: &HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
    ) -> Response<Body> {
        let target = format!("{}{}", self.base, uri);
        debug!(%target, %method, "proxying uncached");

        let mut request = self.client.request(method.clone(), &target);
        for (name, value) in inbound.iter() {
            if *name == header::HOST
                || *name == header::CONNECTION
                || *name == header::CONTENT_LENGTH
            {
                continue;
            }
            request = request.header(name, value);
        }
        request = request
            .header(header::HOST, &self.host_header)
            .header(FORWARDED_FOR, client_ip.to_string());
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "pass-through request failed");
                return (StatusCode::BAD_GATEWAY, "origin unavailable").into_response();
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if STRIPPED_RESPONSE_HEADERS.contains(name) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "pass-through body read failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        (status, headers, bytes).into_response()
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn fetch(
        &self,
        url: &str,
        client_ip: IpAddr,
        inbound: &HeaderMap,
    ) -> Result<OriginResponse> {
        let target = format!("{}{}", self.base, url);
        debug!(%target, "fetching from origin");

        let mut request = self
            .client
            .get(&target)
            .header(header::HOST, &self.host_header)
            .header(FORWARDED_FOR, client_ip.to_string());
        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = inbound.get(name) {
                request = request.header(name, value);
            }
        }

        let mut response = request.send().await.map_err(|e| {
            ProxyError::OriginUnreachable(format!("{}: {}", target, e))
        })?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| STORED_RESPONSE_HEADERS.contains(name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut hasher = Sha256::new();
        let mut body = BytesMut::new();
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| ProxyError::OriginProtocolError(e.to_string()))?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(ProxyError::OriginTooLarge {
                    size: body.len() + chunk.len(),
                    limit: self.max_body_bytes,
                });
            }
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        Ok(OriginResponse {
            status,
            headers,
            body: body.freeze(),
            digest: BodyDigest::from_hasher(hasher),
        })
    }
}

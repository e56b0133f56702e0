use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use memgate_store::KvStore;

use crate::clock::Clock;
use crate::error::ProxyError;
use crate::handler::{CacheRequest, Outcome, Webcache};
use crate::origin::{HttpOrigin, OriginFetcher};

/// Upper bound when buffering a pass-through request body.
const PASSTHROUGH_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub struct AppState<S, O, C> {
    pub cache: Arc<Webcache<S, O, C>>,
    /// Uncached proxy used for fail-open, oversized bodies, and non-GET/HEAD
    /// methods.
    pub passthrough: Arc<HttpOrigin>,
}

impl<S, O, C> Clone for AppState<S, O, C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            passthrough: Arc::clone(&self.passthrough),
        }
    }
}

pub fn router<S, O, C>(state: AppState<S, O, C>) -> Router
where
    S: KvStore + 'static,
    O: OriginFetcher + 'static,
    C: Clock + 'static,
{
    Router::new().fallback(dispatch::<S, O, C>).with_state(state)
}

async fn dispatch<S, O, C>(
    State(state): State<AppState<S, O, C>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response
where
    S: KvStore + 'static,
    O: OriginFetcher + 'static,
    C: Clock + 'static,
{
    let (parts, body) = request.into_parts();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    handle_request(&state, peer, parts.method, uri, parts.headers, body).await
}

/// One request through the cache, with every error kind mapped to its wire
/// treatment. Split from the axum plumbing so tests can drive it with a
/// synthetic peer address.
pub async fn handle_request<S, O, C>(
    state: &AppState<S, O, C>,
    peer: SocketAddr,
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Body,
) -> Response
where
    S: KvStore + 'static,
    O: OriginFetcher + 'static,
    C: Clock + 'static,
{
    let request = CacheRequest {
        method: method.clone(),
        uri: uri.clone(),
        headers: headers.clone(),
        peer,
    };

    match state.cache.handle(&request).await {
        Ok(Outcome::Response(response)) => response,
        Ok(Outcome::Passthrough) => {
            let bytes = match axum::body::to_bytes(body, PASSTHROUGH_BODY_LIMIT).await {
                Ok(bytes) => bytes,
                Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            };
            state
                .passthrough
                .passthrough(&method, &uri, &headers, bytes, peer.ip())
                .await
        }
        Err(error) => match error {
            ProxyError::LoopDetected => {
                warn!(%peer, %uri, "rejecting re-entrant loopback request");
                (StatusCode::LOOP_DETECTED, "loop detected").into_response()
            }
            ProxyError::Store(e) => {
                // Fail open: the cache being down never takes the site down.
                warn!(%uri, error = %e, "store unavailable; proxying uncached");
                state
                    .passthrough
                    .passthrough(&method, &uri, &headers, Bytes::new(), peer.ip())
                    .await
            }
            ProxyError::OriginTooLarge { size, limit } => {
                debug!(%uri, size, limit, "body exceeds cache budget; proxying uncached");
                state
                    .passthrough
                    .passthrough(&method, &uri, &headers, Bytes::new(), peer.ip())
                    .await
            }
            ProxyError::OriginUnreachable(e) | ProxyError::OriginProtocolError(e) => {
                warn!(%uri, error = %e, "origin fetch failed");
                (StatusCode::BAD_GATEWAY, "origin unavailable").into_response()
            }
            ProxyError::LookupExhausted(url) => {
                warn!(%url, "giving up after repeated cache churn");
                (StatusCode::SERVICE_UNAVAILABLE, "cache contention").into_response()
            }
            ProxyError::PublicationConflict(_) | ProxyError::Internal(_) => {
                warn!(%uri, error = %error, "internal failure");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

pub async fn serve<S, O, C>(addr: SocketAddr, state: AppState<S, O, C>) -> std::io::Result<()>
where
    S: KvStore + 'static,
    O: OriginFetcher + 'static,
    C: Clock + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "caching intermediary listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Response};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

use memgate_core::MetadataKey;
use memgate_store::{CacheAdapter, KvStore, MetadataEntry};

use crate::assemble::{self, CacheStatus};
use crate::clock::Clock;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::freshness::{Decision, FreshnessEngine};
use crate::origin::{OriginFetcher, OriginResponse};
use crate::reservation::{Claim, Election, PublishOutcome, ReservationProtocol};

/// The slice of an inbound request the cache path needs.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    /// Path and query exactly as received.
    pub uri: String,
    pub headers: HeaderMap,
    pub peer: SocketAddr,
}

/// What the state machine decided. `Passthrough` hands the request back to
/// the caller for an uncached proxy round.
#[derive(Debug)]
pub enum Outcome {
    Response(Response<Body>),
    Passthrough,
}

enum Fetched {
    /// Status excluded from caching; hand the origin response through.
    Uncached(OriginResponse),
    /// The store failed after the fetch; fail open with the body in hand.
    Unpublished(OriginResponse),
    Cached(PublishOutcome, OriginResponse),
}

/// Origin statuses that enter the cache. Errors pass through uncached.
fn cacheable_status(status: u16) -> bool {
    status < 400
}

pub struct Webcache<S, O, C> {
    adapter: CacheAdapter<S>,
    origin: Arc<O>,
    clock: Arc<C>,
    protocol: ReservationProtocol<S, C>,
    freshness: FreshnessEngine,
    config: ProxyConfig,
}

impl<S, O, C> Webcache<S, O, C>
where
    S: KvStore + 'static,
    O: OriginFetcher + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, origin: Arc<O>, clock: Arc<C>, config: ProxyConfig) -> Self {
        let adapter = CacheAdapter::new(store);
        let protocol = ReservationProtocol::new(adapter.clone(), Arc::clone(&clock), &config);
        let freshness = FreshnessEngine::new(config.freshness_window());
        Self {
            adapter,
            origin,
            clock,
            protocol,
            freshness,
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// CLASSIFY -> LOOKUP -> (HIT | CONDITIONAL | ELECT) -> (SERVE | FETCH ->
    /// PUBLISH -> SERVE | WAIT -> LOOKUP), bounded by the lookup budget.
    pub async fn handle(&self, request: &CacheRequest) -> Result<Outcome> {
        if request.peer.ip().is_loopback() {
            counter!("memgate_loops_rejected_total").increment(1);
            return Err(ProxyError::LoopDetected);
        }
        if request.method != Method::GET && request.method != Method::HEAD {
            return Ok(Outcome::Passthrough);
        }

        let url = request.uri.clone();
        let key = MetadataKey::for_url(&url);
        let include_body = request.method == Method::GET;
        let if_modified_since = request
            .headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut claim: Option<Claim> = None;
        let mut waited = false;

        for _ in 0..self.config.max_lookup_iterations {
            let entry = self.adapter.get_metadata(&key).await?;

            if let Some(entry) = &entry {
                let now = self.clock.now_micros();
                match self
                    .freshness
                    .evaluate(&entry.record, now, if_modified_since.as_deref())
                {
                    Decision::NotModified => {
                        counter!("memgate_conditional_hits_total").increment(1);
                        return Ok(Outcome::Response(assemble::not_modified(
                            &entry.record,
                            self.config.freshness_window_seconds,
                        )));
                    }
                    Decision::Hit => {
                        let status = if waited {
                            CacheStatus::MissWait
                        } else {
                            CacheStatus::Hit
                        };
                        if let Some(response) = self
                            .serve_bound_content(&url, entry, include_body, status)
                            .await?
                        {
                            counter!("memgate_cache_hits_total").increment(1);
                            return Ok(Outcome::Response(response));
                        }
                        // Bound content evicted or mismatched: stale after all.
                        debug!(url = %url, "bound content missing; treating entry as stale");
                    }
                    Decision::Stale => {}
                }
            }

            let election = match &entry {
                Some(entry) => match claim.and_then(|c| self.protocol.reevaluate(entry, c)) {
                    Some(election) => election,
                    None => self.protocol.contend(&key, entry).await?,
                },
                None => self.protocol.claim_lineage(&url, &key).await?,
            };

            match election {
                Election::Elected(elected) => {
                    counter!("memgate_misses_total").increment(1);
                    return self
                        .fetch_and_publish(request, &url, key, elected, include_body)
                        .await;
                }
                Election::Wait {
                    claim: next_claim,
                    delay,
                    ..
                } => {
                    counter!("memgate_waits_total").increment(1);
                    debug!(
                        url = %url,
                        reservation = next_claim.reservation,
                        delay_ms = delay.as_millis() as u64,
                        "lost election; backing off"
                    );
                    claim = Some(next_claim);
                    waited = true;
                    sleep(delay).await;
                }
                Election::Restart => {
                    claim = None;
                }
            }
        }

        warn!(url = %url, "lookup budget exhausted");
        Err(ProxyError::LookupExhausted(url))
    }

    /// Loads and echo-checks the content record bound to a fresh metadata
    /// entry. None means the binding is broken and the entry counts as stale.
    async fn serve_bound_content(
        &self,
        url: &str,
        entry: &MetadataEntry,
        include_body: bool,
        status: CacheStatus,
    ) -> Result<Option<Response<Body>>> {
        let Some(content_key) = entry.record.content_key() else {
            return Ok(None);
        };
        let Some(content) = self.adapter.get_content(&content_key).await? else {
            return Ok(None);
        };
        if !content.matches(url, entry.record.session, entry.record.last_noted) {
            debug!(url, "content echo mismatch; treating as absent");
            return Ok(None);
        }
        Ok(Some(assemble::cached_response(
            &entry.record,
            &content,
            self.config.freshness_window_seconds,
            status,
            include_body,
        )))
    }

    async fn fetch_and_publish(
        &self,
        request: &CacheRequest,
        url: &str,
        key: MetadataKey,
        claim: Claim,
        include_body: bool,
    ) -> Result<Outcome> {
        let origin = Arc::clone(&self.origin);
        let protocol = self.protocol.clone();
        let headers = request.headers.clone();
        let client_ip = request.peer.ip();
        let task_url = url.to_string();

        // Detached so a client disconnect cannot strand an advanced
        // reservation: once the fetch lands, the publication attempt runs to
        // completion for the benefit of the waiters. Every path that gives
        // up on publishing releases the claim, or the queue head would stay
        // stuck at this reservation for the rest of the lineage.
        let task = tokio::spawn(async move {
            let response = match origin.fetch(&task_url, client_ip, &headers).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = protocol.release(&task_url, &key, claim).await;
                    return Err(e);
                }
            };
            if !cacheable_status(response.status) {
                debug!(url = %task_url, status = response.status, "origin status not cacheable");
                let _ = protocol.release(&task_url, &key, claim).await;
                return Ok(Fetched::Uncached(response));
            }
            match protocol.publish(&task_url, &key, claim, &response).await {
                Ok(outcome) => {
                    if matches!(outcome, PublishOutcome::Degraded) {
                        let _ = protocol.release(&task_url, &key, claim).await;
                    }
                    Ok(Fetched::Cached(outcome, response))
                }
                Err(e) => {
                    warn!(url = %task_url, error = %e, "store failed during publication; serving direct");
                    let _ = protocol.release(&task_url, &key, claim).await;
                    Ok(Fetched::Unpublished(response))
                }
            }
        });

        let fetched = match task.await {
            Ok(result) => result?,
            Err(e) => return Err(ProxyError::Internal(format!("publication task: {}", e))),
        };

        let window = self.config.freshness_window_seconds;
        match fetched {
            Fetched::Uncached(response) => Ok(Outcome::Response(assemble::uncached_response(
                &response,
                include_body,
            ))),
            Fetched::Unpublished(response) => Ok(Outcome::Response(assemble::degraded_response(
                &response,
                self.clock.now_secs(),
                window,
                include_body,
            ))),
            Fetched::Cached(PublishOutcome::Published(record), response) => Ok(Outcome::Response(
                assemble::fetched_response(&record, &response, window, include_body),
            )),
            Fetched::Cached(PublishOutcome::AlreadyPublished(entry), response) => {
                match self
                    .serve_bound_content(url, &entry, include_body, CacheStatus::MissFetch)
                    .await?
                {
                    Some(served) => Ok(Outcome::Response(served)),
                    None => Ok(Outcome::Response(assemble::degraded_response(
                        &response,
                        self.clock.now_secs(),
                        window,
                        include_body,
                    ))),
                }
            }
            Fetched::Cached(PublishOutcome::Degraded, response) => {
                Ok(Outcome::Response(assemble::degraded_response(
                    &response,
                    self.clock.now_secs(),
                    window,
                    include_body,
                )))
            }
        }
    }
}

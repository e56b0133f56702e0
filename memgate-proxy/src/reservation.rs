use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use memgate_core::{ContentKey, ContentRecord, MetadataKey, MetadataRecord, METADATA_VERSION};
use memgate_store::{CacheAdapter, CasOutcome, KvStore, MetadataEntry};

use crate::clock::Clock;
use crate::config::ProxyConfig;
use crate::origin::OriginResponse;

/// A fetcher retries the metadata install this many times before giving up
/// and serving its own client only.
const PUBLISH_CAS_ATTEMPTS: usize = 3;

/// Swap rounds an abandoning fetcher spends handing its slot to the next
/// waiter before leaving recovery to the placeholder deadline.
const RELEASE_CAS_ATTEMPTS: usize = 8;

/// The (session, reservation) pair a worker holds while contending. It names
/// the content key the worker is entitled to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub session: i64,
    pub reservation: u64,
}

#[derive(Debug)]
pub enum Election {
    /// Head of the queue: fetch and publish.
    Elected(Claim),
    /// Lost the contest; sleep proportionally to queue depth, then re-read.
    Wait {
        claim: Claim,
        noted: u64,
        delay: Duration,
    },
    /// The record churned underneath us; take the lookup from the top.
    Restart,
}

#[derive(Debug)]
pub enum PublishOutcome {
    /// Metadata installed; the record describes what the store now holds.
    Published(MetadataRecord),
    /// Someone else published fresh content while we fetched; serve theirs.
    AlreadyPublished(MetadataEntry),
    /// Could not install; the fetched body goes to this client only.
    Degraded,
}

/// The consistency engine: elects one fetcher per (URL, generation), parks
/// everyone else behind a bounded sleep, and publishes through add/CAS so
/// arbitrary eviction of either record family never corrupts published state.
pub struct ReservationProtocol<S, C> {
    adapter: CacheAdapter<S>,
    clock: Arc<C>,
    backoff_base: Duration,
    backoff_cap: Duration,
    placeholder_ttl: Duration,
    freshness_window: Duration,
}

impl<S, C> Clone for ReservationProtocol<S, C> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            clock: Arc::clone(&self.clock),
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            placeholder_ttl: self.placeholder_ttl,
            freshness_window: self.freshness_window,
        }
    }
}

impl<S: KvStore, C: Clock> ReservationProtocol<S, C> {
    pub fn new(adapter: CacheAdapter<S>, clock: Arc<C>, config: &ProxyConfig) -> Self {
        Self {
            adapter,
            clock,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            placeholder_ttl: config.placeholder_ttl(),
            freshness_window: config.freshness_window(),
        }
    }

    /// Sleep proportional to queue depth, capped. Depth is the distance
    /// between a waiter's reservation and the last noted publication.
    pub fn backoff(&self, depth: u64) -> Duration {
        let depth = depth.clamp(1, u32::MAX as u64) as u32;
        self.backoff_base
            .saturating_mul(depth)
            .min(self.backoff_cap)
    }

    /// No metadata exists: claim the URL with a placeholder. Winning the add
    /// is the election for reservation 1.
    pub async fn claim_lineage(
        &self,
        url: &str,
        key: &MetadataKey,
    ) -> memgate_store::Result<Election> {
        let session = self.clock.now_micros();
        let placeholder = MetadataRecord::placeholder(url, session);
        if self
            .adapter
            .add_metadata(key, &placeholder, Some(self.placeholder_ttl))
            .await?
        {
            debug!(url, session, "claimed new lineage");
            Ok(Election::Elected(Claim {
                session,
                reservation: 1,
            }))
        } else {
            Ok(Election::Restart)
        }
    }

    /// Metadata exists but cannot be served: contend by taking the next
    /// reservation. Exactly one contender observes `r = last_noted + 1`.
    pub async fn contend(
        &self,
        key: &MetadataKey,
        entry: &MetadataEntry,
    ) -> memgate_store::Result<Election> {
        let noted = entry.record.last_noted;
        match self
            .adapter
            .incr_reservation(key, self.placeholder_ttl, self.clock.now_micros())
            .await?
        {
            None => Ok(Election::Restart),
            Some(reservation) => {
                let claim = Claim {
                    session: entry.record.session,
                    reservation,
                };
                if reservation == noted + 1 {
                    debug!(url = %entry.record.url, reservation, "elected fetcher");
                    Ok(Election::Elected(claim))
                } else {
                    Ok(Election::Wait {
                        claim,
                        noted,
                        delay: self.backoff(reservation - noted),
                    })
                }
            }
        }
    }

    /// A woken waiter re-examines the record it contended on without taking
    /// a new reservation. Returns None when the claim no longer applies (new
    /// lineage, or the queue moved past us) and the caller must contend anew.
    pub fn reevaluate(&self, entry: &MetadataEntry, claim: Claim) -> Option<Election> {
        if entry.record.session != claim.session {
            return None;
        }
        let noted = entry.record.last_noted;
        if noted >= claim.reservation {
            return None;
        }
        if noted + 1 == claim.reservation {
            debug!(url = %entry.record.url, reservation = claim.reservation, "late election");
            return Some(Election::Elected(claim));
        }
        Some(Election::Wait {
            claim,
            noted,
            delay: self.backoff(claim.reservation - noted),
        })
    }

    /// An elected fetcher that cannot publish (origin failure, uncacheable
    /// status, store trouble mid-install) still has to vacate the head of
    /// the queue: advancing last_noted to the claim lets the next
    /// reservation in line satisfy the election check. For a published
    /// record this also unbinds the content echo, which readers already
    /// treat as stale. Best-effort; the placeholder deadline remains the
    /// backstop if every swap round is lost.
    pub async fn release(
        &self,
        url: &str,
        key: &MetadataKey,
        claim: Claim,
    ) -> memgate_store::Result<()> {
        for _ in 0..RELEASE_CAS_ATTEMPTS {
            let Some(entry) = self.adapter.get_metadata(key).await? else {
                return Ok(());
            };
            if entry.record.session != claim.session
                || entry.record.last_noted >= claim.reservation
            {
                return Ok(());
            }

            let mut record = entry.record;
            record.last_noted = claim.reservation;
            let ttl = if record.valid {
                None
            } else {
                Some(memgate_store::adapter::remaining_placeholder_ttl(
                    &record,
                    self.placeholder_ttl,
                    self.clock.now_micros(),
                ))
            };
            match self.adapter.cas_metadata(key, entry.token, &record, ttl).await? {
                CasOutcome::Replaced => {
                    debug!(url, last_noted = record.last_noted, "released claim without publishing");
                    return Ok(());
                }
                CasOutcome::Conflict => continue,
                CasOutcome::Absent => return Ok(()),
            }
        }
        debug!(url, "claim release lost every swap round");
        Ok(())
    }

    /// Installs a fetched origin response under the claim: content record
    /// first, then the metadata swing. Every failure mode downgrades rather
    /// than corrupting published state.
    pub async fn publish(
        &self,
        url: &str,
        key: &MetadataKey,
        claim: Claim,
        origin: &OriginResponse,
    ) -> memgate_store::Result<PublishOutcome> {
        let content_key = ContentKey::derive(url, claim.session, claim.reservation);
        let content = ContentRecord::new(
            url,
            claim.session,
            claim.reservation,
            origin.status,
            origin.headers.clone(),
            origin.body.clone(),
        );

        if !self.adapter.add_content(&content_key, &content).await? {
            match self.adapter.get_content(&content_key).await? {
                Some(existing) if existing.matches(url, claim.session, claim.reservation) => {
                    debug!(url, "content record already present with matching echo");
                }
                _ => {
                    warn!(url, key = %content_key, "content key occupied by foreign record");
                    return Ok(PublishOutcome::Degraded);
                }
            }
        }

        for attempt in 0..PUBLISH_CAS_ATTEMPTS {
            let Some(entry) = self.adapter.get_metadata(key).await? else {
                // Metadata evicted mid-flight: restore the binding invariant
                // with a fresh lineage and a second content write.
                match self.fresh_lineage(url, key, origin).await? {
                    Some(record) => return Ok(PublishOutcome::Published(record)),
                    None => continue,
                }
            };

            if entry.record.session != claim.session {
                // The lineage was rebuilt while we fetched; our content key
                // can never satisfy the binding invariant there.
                let _ = self.adapter.delete_content(&content_key).await;
                if self.serveable(&entry.record) {
                    return Ok(PublishOutcome::AlreadyPublished(entry));
                }
                debug!(url, "lineage changed during fetch; serving direct");
                return Ok(PublishOutcome::Degraded);
            }

            if entry.record.last_noted >= claim.reservation {
                // A publication at or past our slot landed while we fetched;
                // installing ours would walk last_noted backwards.
                let _ = self.adapter.delete_content(&content_key).await;
                if self.serveable(&entry.record) {
                    return Ok(PublishOutcome::AlreadyPublished(entry));
                }
                debug!(url, "reservation slot already noted; serving direct");
                return Ok(PublishOutcome::Degraded);
            }

            let record = self.published_record(url, &entry, claim, &content_key, origin);
            match self
                .adapter
                .cas_metadata(key, entry.token, &record, None)
                .await?
            {
                CasOutcome::Replaced => {
                    debug!(url, last_noted = record.last_noted, "published");
                    return Ok(PublishOutcome::Published(record));
                }
                CasOutcome::Conflict => {
                    debug!(url, attempt, "publication cas conflict");
                    continue;
                }
                CasOutcome::Absent => continue,
            }
        }

        warn!(url, "publication retries exhausted; serving direct");
        Ok(PublishOutcome::Degraded)
    }

    fn serveable(&self, record: &MetadataRecord) -> bool {
        if !record.valid {
            return false;
        }
        match record.fetched {
            Some(fetched) => {
                self.clock.now_micros().saturating_sub(fetched)
                    <= self.freshness_window.as_micros() as i64
            }
            None => false,
        }
    }

    fn published_record(
        &self,
        url: &str,
        prior: &MetadataEntry,
        claim: Claim,
        content_key: &ContentKey,
        origin: &OriginResponse,
    ) -> MetadataRecord {
        // An unchanged body keeps its client-visible Last-Modified; only
        // `fetched` moves forward.
        let last_modified = if prior.record.valid && prior.record.digest == Some(origin.digest) {
            prior
                .record
                .last_modified
                .unwrap_or_else(|| self.clock.now_secs())
        } else {
            self.clock.now_secs()
        };

        MetadataRecord {
            version: METADATA_VERSION,
            url: url.to_string(),
            session: claim.session,
            reservation: prior.record.reservation,
            last_noted: claim.reservation,
            valid: true,
            fetched: Some(self.clock.now_micros()),
            last_modified: Some(last_modified),
            content_key: Some(content_key.as_str().to_string()),
            digest: Some(origin.digest),
        }
    }

    async fn fresh_lineage(
        &self,
        url: &str,
        key: &MetadataKey,
        origin: &OriginResponse,
    ) -> memgate_store::Result<Option<MetadataRecord>> {
        let session = self.clock.now_micros();
        let content_key = ContentKey::derive(url, session, 1);
        let content = ContentRecord::new(
            url,
            session,
            1,
            origin.status,
            origin.headers.clone(),
            origin.body.clone(),
        );
        if !self.adapter.add_content(&content_key, &content).await? {
            return Ok(None);
        }

        let record = MetadataRecord {
            version: METADATA_VERSION,
            url: url.to_string(),
            session,
            reservation: 1,
            last_noted: 1,
            valid: true,
            fetched: Some(self.clock.now_micros()),
            last_modified: Some(self.clock.now_secs()),
            content_key: Some(content_key.as_str().to_string()),
            digest: Some(origin.digest),
        };
        if self.adapter.add_metadata(key, &record, None).await? {
            debug!(url, session, "rebuilt lineage after metadata eviction");
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use bytes::Bytes;
    use memgate_core::BodyDigest;
    use memgate_store::MemoryStore;

    const START_MICROS: i64 = 1_700_000_000_000_000;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        protocol: ReservationProtocol<MemoryStore, ManualClock>,
        key: MetadataKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START_MICROS));
        let config = ProxyConfig {
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            ..ProxyConfig::default()
        };
        let protocol = ReservationProtocol::new(
            CacheAdapter::new(Arc::clone(&store)),
            Arc::clone(&clock),
            &config,
        );
        Fixture {
            store,
            clock,
            protocol,
            key: MetadataKey::for_url("/x"),
        }
    }

    fn origin_response(body: &'static [u8]) -> OriginResponse {
        OriginResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(body),
            digest: BodyDigest::hash(body),
        }
    }

    fn adapter(f: &Fixture) -> CacheAdapter<MemoryStore> {
        CacheAdapter::new(Arc::clone(&f.store))
    }

    async fn elect_first(f: &Fixture) -> Claim {
        match f.protocol.claim_lineage("/x", &f.key).await.unwrap() {
            Election::Elected(claim) => claim,
            other => panic!("expected election, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_scales_and_caps() {
        let f = fixture();
        assert_eq!(f.protocol.backoff(1), Duration::from_millis(10));
        assert_eq!(f.protocol.backoff(2), Duration::from_millis(20));
        assert_eq!(f.protocol.backoff(50), Duration::from_millis(100));
        // Depth zero never sleeps forever-zero; it is clamped to one step.
        assert_eq!(f.protocol.backoff(0), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_claim_lineage_elects_first_worker() {
        let f = fixture();
        let claim = elect_first(&f).await;
        assert_eq!(claim.reservation, 1);

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        assert!(!entry.record.valid);
        assert_eq!(entry.record.reservation, 1);
        assert_eq!(entry.record.last_noted, 0);
        assert_eq!(entry.record.session, claim.session);
    }

    #[tokio::test]
    async fn test_claim_lineage_loser_restarts() {
        let f = fixture();
        elect_first(&f).await;
        match f.protocol.claim_lineage("/x", &f.key).await.unwrap() {
            Election::Restart => {}
            other => panic!("expected restart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contender_behind_placeholder_waits() {
        let f = fixture();
        elect_first(&f).await;

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Wait {
                claim,
                noted,
                delay,
            } => {
                assert_eq!(claim.reservation, 2);
                assert_eq!(noted, 0);
                assert_eq!(delay, Duration::from_millis(20));
            }
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contender_on_stale_published_is_elected() {
        let f = fixture();
        let claim = elect_first(&f).await;
        f.protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap();

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(claim) => assert_eq!(claim.reservation, 2),
            other => panic!("expected election, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contend_after_eviction_restarts() {
        let f = fixture();
        elect_first(&f).await;
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        f.store.evict(f.key.as_str());
        match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Restart => {}
            other => panic!("expected restart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reevaluate_head_of_queue_is_elected() {
        let f = fixture();
        elect_first(&f).await;
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        let claim = Claim {
            session: entry.record.session,
            reservation: 1,
        };
        match f.protocol.reevaluate(&entry, claim) {
            Some(Election::Elected(elected)) => assert_eq!(elected.reservation, 1),
            other => panic!("expected election, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reevaluate_deep_waiter_keeps_waiting() {
        let f = fixture();
        elect_first(&f).await;
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        let claim = Claim {
            session: entry.record.session,
            reservation: 4,
        };
        match f.protocol.reevaluate(&entry, claim) {
            Some(Election::Wait { delay, noted, .. }) => {
                assert_eq!(noted, 0);
                assert_eq!(delay, Duration::from_millis(40));
            }
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reevaluate_rejects_foreign_session() {
        let f = fixture();
        elect_first(&f).await;
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        let claim = Claim {
            session: entry.record.session + 1,
            reservation: 1,
        };
        assert!(f.protocol.reevaluate(&entry, claim).is_none());
    }

    #[tokio::test]
    async fn test_reevaluate_rejects_consumed_slot() {
        let f = fixture();
        let claim = elect_first(&f).await;
        f.protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap();
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        // last_noted is now 1; a claim at 1 is spent.
        assert!(f.protocol.reevaluate(&entry, claim).is_none());
    }

    #[tokio::test]
    async fn test_release_hands_slot_to_next_contender() {
        let f = fixture();
        let claim = elect_first(&f).await;

        f.protocol.release("/x", &f.key, claim).await.unwrap();

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        assert!(!entry.record.valid);
        assert_eq!(entry.record.last_noted, 1);

        match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(next) => assert_eq!(next.reservation, 2),
            other => panic!("expected election, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_wakes_parked_waiter() {
        let f = fixture();
        let fetcher = elect_first(&f).await;

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        let waiter = match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Wait { claim, .. } => claim,
            other => panic!("expected wait, got {:?}", other),
        };

        f.protocol.release("/x", &f.key, fetcher).await.unwrap();

        // The waiter's next re-read finds itself at the head of the queue.
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        match f.protocol.reevaluate(&entry, waiter) {
            Some(Election::Elected(elected)) => assert_eq!(elected.reservation, 2),
            other => panic!("expected late election, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_ignores_consumed_slot() {
        let f = fixture();
        let claim = elect_first(&f).await;
        f.protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap();
        let before = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        f.protocol.release("/x", &f.key, claim).await.unwrap();

        let after = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        assert_eq!(after.record, before.record);
    }

    #[tokio::test]
    async fn test_release_ignores_foreign_session() {
        let f = fixture();
        let claim = elect_first(&f).await;
        let before = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();

        let foreign = Claim {
            session: claim.session + 1,
            reservation: claim.reservation,
        };
        f.protocol.release("/x", &f.key, foreign).await.unwrap();

        let after = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        assert_eq!(after.record, before.record);
    }

    #[tokio::test]
    async fn test_release_on_stale_published_unbinds_slot() {
        let f = fixture();
        let first = elect_first(&f).await;
        f.protocol
            .publish("/x", &f.key, first, &origin_response(b"alpha"))
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(120));
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        let refetcher = match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(claim) => claim,
            other => panic!("expected election, got {:?}", other),
        };

        // The refetch failed; the slot is vacated without new content.
        f.protocol.release("/x", &f.key, refetcher).await.unwrap();

        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        assert_eq!(entry.record.last_noted, 2);
        assert!(entry.record.valid);

        // The old binding no longer echoes last_noted, and the next
        // contender takes the vacated head.
        let content = adapter(&f)
            .get_content(&entry.record.content_key().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!content.matches("/x", entry.record.session, entry.record.last_noted));

        match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(next) => assert_eq!(next.reservation, 3),
            other => panic!("expected election, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_cold_installs_binding() {
        let f = fixture();
        let claim = elect_first(&f).await;

        let outcome = f
            .protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap();
        let record = match outcome {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        assert!(record.valid);
        assert_eq!(record.reservation, 1);
        assert_eq!(record.last_noted, 1);
        assert_eq!(record.digest, Some(BodyDigest::hash(b"alpha")));

        // The binding invariant: content key echoes (url, session, last_noted).
        let content_key = record.content_key().unwrap();
        let content = adapter(&f).get_content(&content_key).await.unwrap().unwrap();
        assert!(content.matches("/x", record.session, record.last_noted));
        assert_eq!(content.body.as_ref(), b"alpha");
    }

    #[tokio::test]
    async fn test_publish_unchanged_body_keeps_last_modified() {
        let f = fixture();
        let first = elect_first(&f).await;
        let first_record = match f
            .protocol
            .publish("/x", &f.key, first, &origin_response(b"alpha"))
            .await
            .unwrap()
        {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        f.clock.advance(Duration::from_secs(120));
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        let claim = match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(claim) => claim,
            other => panic!("expected election, got {:?}", other),
        };

        let second_record = match f
            .protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap()
        {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        assert_eq!(second_record.last_modified, first_record.last_modified);
        assert!(second_record.fetched.unwrap() > first_record.fetched.unwrap());
        assert_eq!(second_record.reservation, 2);
        assert_eq!(second_record.last_noted, 2);
    }

    #[tokio::test]
    async fn test_publish_changed_body_moves_last_modified() {
        let f = fixture();
        let first = elect_first(&f).await;
        let first_record = match f
            .protocol
            .publish("/x", &f.key, first, &origin_response(b"alpha"))
            .await
            .unwrap()
        {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        f.clock.advance(Duration::from_secs(120));
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        let claim = match f.protocol.contend(&f.key, &entry).await.unwrap() {
            Election::Elected(claim) => claim,
            other => panic!("expected election, got {:?}", other),
        };

        let second_record = match f
            .protocol
            .publish("/x", &f.key, claim, &origin_response(b"beta"))
            .await
            .unwrap()
        {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        assert!(second_record.last_modified.unwrap() > first_record.last_modified.unwrap());
        assert_eq!(second_record.digest, Some(BodyDigest::hash(b"beta")));
    }

    #[tokio::test]
    async fn test_publish_after_metadata_eviction_rebuilds_lineage() {
        let f = fixture();
        let claim = elect_first(&f).await;

        f.store.evict(f.key.as_str());

        let record = match f
            .protocol
            .publish("/x", &f.key, claim, &origin_response(b"alpha"))
            .await
            .unwrap()
        {
            PublishOutcome::Published(record) => record,
            other => panic!("expected publish, got {:?}", other),
        };

        assert_ne!(record.session, claim.session);
        assert_eq!(record.reservation, 1);
        assert_eq!(record.last_noted, 1);

        let content_key = record.content_key().unwrap();
        let content = adapter(&f).get_content(&content_key).await.unwrap().unwrap();
        assert!(content.matches("/x", record.session, record.last_noted));
    }

    #[tokio::test]
    async fn test_publish_defers_to_concurrent_fresh_publication() {
        let f = fixture();
        let slow_claim = elect_first(&f).await;

        // A second worker wins a later reservation and publishes first.
        let entry = adapter(&f).get_metadata(&f.key).await.unwrap().unwrap();
        let fast_claim = Claim {
            session: entry.record.session,
            reservation: 2,
        };
        adapter(&f)
            .incr_reservation(&f.key, Duration::from_secs(10), f.clock.now_micros())
            .await
            .unwrap();
        f.protocol
            .publish("/x", &f.key, fast_claim, &origin_response(b"beta"))
            .await
            .unwrap();

        let outcome = f
            .protocol
            .publish("/x", &f.key, slow_claim, &origin_response(b"alpha"))
            .await
            .unwrap();
        let entry = match outcome {
            PublishOutcome::AlreadyPublished(entry) => entry,
            other => panic!("expected already-published, got {:?}", other),
        };
        assert_eq!(entry.record.last_noted, 2);

        // The slow worker's orphaned content record was cleaned up.
        let orphan = ContentKey::derive("/x", slow_claim.session, slow_claim.reservation);
        assert!(adapter(&f).get_content(&orphan).await.unwrap().is_none());
    }
}

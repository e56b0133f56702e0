use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;

use memgate_core::MetadataRecord;

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC_850: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME: &str = "%a %b %e %H:%M:%S %Y";

/// Formats UTC seconds as an RFC-1123 GMT HTTP date.
pub fn format_http_date(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format(IMF_FIXDATE)
        .to_string()
}

/// Parses the three RFC 7231 HTTP date forms to UTC seconds.
pub fn parse_http_date(raw: &str) -> Option<i64> {
    for format in [IMF_FIXDATE, RFC_850, ASCTIME] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Serve from cache; the caller still has to bind the content record.
    Hit,
    /// The client's copy is current; synthesize a 304 without touching the
    /// content record.
    NotModified,
    /// Past the window (or not published); route through the reservation
    /// protocol.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessEngine {
    window: Duration,
}

impl FreshnessEngine {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn is_fresh(&self, record: &MetadataRecord, now_micros: i64) -> bool {
        if !record.valid {
            return false;
        }
        match record.fetched {
            Some(fetched) => {
                now_micros.saturating_sub(fetched) <= self.window.as_micros() as i64
            }
            None => false,
        }
    }

    pub fn evaluate(
        &self,
        record: &MetadataRecord,
        now_micros: i64,
        if_modified_since: Option<&str>,
    ) -> Decision {
        if !self.is_fresh(record, now_micros) {
            return Decision::Stale;
        }

        // Second-resolution, inclusive: a client holding exactly our
        // Last-Modified needs no body.
        if let (Some(raw), Some(last_modified)) = (if_modified_since, record.last_modified) {
            if let Some(client_secs) = parse_http_date(raw) {
                if client_secs >= last_modified {
                    return Decision::NotModified;
                }
            }
        }

        Decision::Hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memgate_core::{BodyDigest, ContentKey, METADATA_VERSION};

    fn published(fetched_micros: i64, last_modified_secs: i64) -> MetadataRecord {
        MetadataRecord {
            version: METADATA_VERSION,
            url: "/x".to_string(),
            session: fetched_micros,
            reservation: 1,
            last_noted: 1,
            valid: true,
            fetched: Some(fetched_micros),
            last_modified: Some(last_modified_secs),
            content_key: Some(ContentKey::derive("/x", fetched_micros, 1).into_string()),
            digest: Some(BodyDigest::hash(b"alpha")),
        }
    }

    fn engine() -> FreshnessEngine {
        FreshnessEngine::new(Duration::from_secs(60))
    }

    #[test]
    fn test_http_date_round_trip() {
        let secs = 1_700_000_000;
        let formatted = format_http_date(secs);
        assert!(formatted.ends_with("GMT"));
        assert_eq!(parse_http_date(&formatted), Some(secs));
    }

    #[test]
    fn test_parse_known_date() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784_111_777)
        );
    }

    #[test]
    fn test_parse_rfc850_and_asctime() {
        assert_eq!(
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"),
            Some(784_111_777)
        );
        assert_eq!(
            parse_http_date("Sun Nov  6 08:49:37 1994"),
            Some(784_111_777)
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_http_date("yesterday"), None);
        assert_eq!(parse_http_date(""), None);
    }

    #[test]
    fn test_placeholder_is_stale() {
        let record = MetadataRecord::placeholder("/x", 1_000_000);
        assert_eq!(engine().evaluate(&record, 1_000_001, None), Decision::Stale);
    }

    #[test]
    fn test_fresh_within_window() {
        let record = published(1_000_000_000_000, 1_000_000);
        let now = 1_000_000_000_000 + 59_000_000;
        assert!(engine().is_fresh(&record, now));
        assert_eq!(engine().evaluate(&record, now, None), Decision::Hit);
    }

    #[test]
    fn test_stale_past_window() {
        let record = published(1_000_000_000_000, 1_000_000);
        let now = 1_000_000_000_000 + 61_000_000;
        assert_eq!(engine().evaluate(&record, now, None), Decision::Stale);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let record = published(1_000_000_000_000, 1_000_000);
        let now = 1_000_000_000_000 + 60_000_000;
        assert_eq!(engine().evaluate(&record, now, None), Decision::Hit);
    }

    #[test]
    fn test_conditional_equal_is_not_modified() {
        let last_modified = 1_000_000;
        let record = published(1_000_000_000_000, last_modified);
        let ims = format_http_date(last_modified);
        assert_eq!(
            engine().evaluate(&record, 1_000_000_000_001, Some(&ims)),
            Decision::NotModified
        );
    }

    #[test]
    fn test_conditional_newer_is_not_modified() {
        let record = published(1_000_000_000_000, 1_000_000);
        let ims = format_http_date(1_000_500);
        assert_eq!(
            engine().evaluate(&record, 1_000_000_000_001, Some(&ims)),
            Decision::NotModified
        );
    }

    #[test]
    fn test_conditional_older_is_full_hit() {
        let record = published(1_000_000_000_000, 1_000_000);
        let ims = format_http_date(999_000);
        assert_eq!(
            engine().evaluate(&record, 1_000_000_000_001, Some(&ims)),
            Decision::Hit
        );
    }

    #[test]
    fn test_conditional_unparseable_is_full_hit() {
        let record = published(1_000_000_000_000, 1_000_000);
        assert_eq!(
            engine().evaluate(&record, 1_000_000_000_001, Some("not a date")),
            Decision::Hit
        );
    }

    #[test]
    fn test_conditional_ignored_when_stale() {
        let record = published(1_000_000_000_000, 1_000_000);
        let ims = format_http_date(2_000_000);
        let now = 1_000_000_000_000 + 61_000_000;
        assert_eq!(engine().evaluate(&record, now, Some(&ims)), Decision::Stale);
    }
}

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;

use memgate_core::{ContentRecord, MetadataRecord};

use crate::freshness::format_http_date;
use crate::origin::OriginResponse;

pub const STATUS_HEADER: &str = "x-webcache-status";

/// Origin headers allowed back out to clients; everything else — Set-Cookie,
/// Pragma, Expires included — stops here.
const HEADER_ALLOWLIST: &[&str] = &["content-type", "content-length", "content-encoding"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Hit304,
    MissFetch,
    MissWait,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Hit304 => "HIT-304",
            CacheStatus::MissFetch => "MISS-FETCH",
            CacheStatus::MissWait => "MISS-WAIT",
        }
    }
}

fn build(
    status: u16,
    source_headers: &[(String, String)],
    body: Bytes,
    include_body: bool,
    last_modified_secs: i64,
    window_secs: u64,
    cache_status: CacheStatus,
) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    for (name, value) in source_headers {
        let lowered = name.to_ascii_lowercase();
        if !HEADER_ALLOWLIST.contains(&lowered.as_str()) {
            continue;
        }
        // Content-Length is re-derived from the body we actually hold.
        if lowered == "content-length" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(lowered.as_str(), value);
        }
    }

    builder = builder
        .header(header::LAST_MODIFIED, format_http_date(last_modified_secs))
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", window_secs),
        )
        .header(STATUS_HEADER, cache_status.as_str());

    let result = if include_body {
        builder.body(Body::from(body))
    } else {
        // HEAD still advertises the entity's length.
        builder
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::empty())
    };
    result.unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn empty_status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Full HIT out of the cache.
pub fn cached_response(
    record: &MetadataRecord,
    content: &ContentRecord,
    window_secs: u64,
    cache_status: CacheStatus,
    include_body: bool,
) -> Response<Body> {
    build(
        content.status,
        &content.headers,
        content.body.clone(),
        include_body,
        record.last_modified.unwrap_or(0),
        window_secs,
        cache_status,
    )
}

/// Conditional HIT: the client's copy is current, no body travels.
pub fn not_modified(record: &MetadataRecord, window_secs: u64) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(
            header::LAST_MODIFIED,
            format_http_date(record.last_modified.unwrap_or(0)),
        )
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", window_secs),
        )
        .header(STATUS_HEADER, CacheStatus::Hit304.as_str());
    builder = builder.header(header::CONTENT_LENGTH, 0);
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
}

/// The elected fetcher serving the body it just published, with the caching
/// headers of the installed metadata.
pub fn fetched_response(
    record: &MetadataRecord,
    origin: &OriginResponse,
    window_secs: u64,
    include_body: bool,
) -> Response<Body> {
    build(
        origin.status,
        &origin.headers,
        origin.body.clone(),
        include_body,
        record.last_modified.unwrap_or(0),
        window_secs,
        CacheStatus::MissFetch,
    )
}

/// Publication failed; the body still goes to this client, uncached.
pub fn degraded_response(
    origin: &OriginResponse,
    now_secs: i64,
    window_secs: u64,
    include_body: bool,
) -> Response<Body> {
    build(
        origin.status,
        &origin.headers,
        origin.body.clone(),
        include_body,
        now_secs,
        window_secs,
        CacheStatus::MissFetch,
    )
}

/// Origin responses that never enter the cache (error statuses): handed back
/// without caching headers.
pub fn uncached_response(origin: &OriginResponse, include_body: bool) -> Response<Body> {
    let status = StatusCode::from_u16(origin.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &origin.headers {
        let lowered = name.to_ascii_lowercase();
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(lowered.as_str(), value);
        }
    }
    let result = if include_body {
        builder.body(Body::from(origin.body.clone()))
    } else {
        builder.body(Body::empty())
    };
    result.unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memgate_core::{BodyDigest, ContentKey, METADATA_VERSION};

    fn record() -> MetadataRecord {
        MetadataRecord {
            version: METADATA_VERSION,
            url: "/x".to_string(),
            session: 1_000_000,
            reservation: 1,
            last_noted: 1,
            valid: true,
            fetched: Some(1_000_000),
            last_modified: Some(1_700_000_000),
            content_key: Some(ContentKey::derive("/x", 1_000_000, 1).into_string()),
            digest: Some(BodyDigest::hash(b"alpha")),
        }
    }

    fn content() -> ContentRecord {
        ContentRecord::new(
            "/x",
            1_000_000,
            1,
            200,
            vec![
                ("content-type".to_string(), "text/html".to_string()),
                ("set-cookie".to_string(), "secret=1".to_string()),
                ("pragma".to_string(), "no-cache".to_string()),
                ("expires".to_string(), "0".to_string()),
            ],
            Bytes::from_static(b"alpha"),
        )
    }

    fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_cached_response_headers() {
        let response = cached_response(&record(), &content(), 60, CacheStatus::Hit, true);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-type"), Some("text/html"));
        assert_eq!(
            header_str(&response, "cache-control"),
            Some("public, max-age=60")
        );
        assert_eq!(
            header_str(&response, "last-modified"),
            Some(format_http_date(1_700_000_000).as_str())
        );
        assert_eq!(header_str(&response, STATUS_HEADER), Some("HIT"));
    }

    #[test]
    fn test_cached_response_drops_disallowed_headers() {
        let response = cached_response(&record(), &content(), 60, CacheStatus::Hit, true);
        assert!(response.headers().get("set-cookie").is_none());
        assert!(response.headers().get("pragma").is_none());
        assert!(response.headers().get("expires").is_none());
    }

    #[test]
    fn test_head_sets_content_length_without_body() {
        let response = cached_response(&record(), &content(), 60, CacheStatus::Hit, false);
        assert_eq!(header_str(&response, "content-length"), Some("5"));
    }

    #[test]
    fn test_not_modified_shape() {
        let response = not_modified(&record(), 60);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(header_str(&response, STATUS_HEADER), Some("HIT-304"));
        assert_eq!(header_str(&response, "content-length"), Some("0"));
        assert_eq!(
            header_str(&response, "last-modified"),
            Some(format_http_date(1_700_000_000).as_str())
        );
    }

    #[test]
    fn test_miss_wait_status_header() {
        let response = cached_response(&record(), &content(), 60, CacheStatus::MissWait, true);
        assert_eq!(header_str(&response, STATUS_HEADER), Some("MISS-WAIT"));
    }

    #[test]
    fn test_fetched_response_uses_record_last_modified() {
        let origin = OriginResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(b"alpha"),
            digest: BodyDigest::hash(b"alpha"),
        };
        let response = fetched_response(&record(), &origin, 60, true);
        assert_eq!(header_str(&response, STATUS_HEADER), Some("MISS-FETCH"));
        assert_eq!(
            header_str(&response, "last-modified"),
            Some(format_http_date(1_700_000_000).as_str())
        );
    }

    #[test]
    fn test_uncached_response_has_no_caching_headers() {
        let origin = OriginResponse {
            status: 404,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(b"gone"),
            digest: BodyDigest::hash(b"gone"),
        };
        let response = uncached_response(&origin, true);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("cache-control").is_none());
        assert!(response.headers().get(STATUS_HEADER).is_none());
    }

    #[test]
    fn test_cache_status_strings() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Hit304.as_str(), "HIT-304");
        assert_eq!(CacheStatus::MissFetch.as_str(), "MISS-FETCH");
        assert_eq!(CacheStatus::MissWait.as_str(), "MISS-WAIT");
    }
}

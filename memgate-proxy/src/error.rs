use thiserror::Error;

use memgate_store::StoreError;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("origin protocol error: {0}")]
    OriginProtocolError(String),

    #[error("origin response too large: {size} bytes exceeds limit of {limit} bytes")]
    OriginTooLarge { size: usize, limit: usize },

    #[error("publication conflict for {0}")]
    PublicationConflict(String),

    #[error("request loop detected")]
    LoopDetected,

    #[error("lookup retries exhausted for {0}")]
    LookupExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_from() {
        let err: ProxyError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(err, ProxyError::Store(_)));
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn test_origin_too_large_display() {
        let err = ProxyError::OriginTooLarge {
            size: 2_000_000,
            limit: 1_048_576,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000000"));
        assert!(msg.contains("1048576"));
    }

    #[test]
    fn test_loop_detected_display() {
        assert!(ProxyError::LoopDetected.to_string().contains("loop"));
    }
}

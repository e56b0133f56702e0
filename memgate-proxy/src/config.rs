use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Seconds a published entry serves without consulting the origin; also
    /// the outbound max-age.
    pub freshness_window_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Origin bodies above this bypass the cache entirely.
    pub max_body_bytes: usize,
    pub max_lookup_iterations: u32,
    /// host:port of the shared store.
    pub cache_endpoint: String,
    /// Loopback port the origin application listens on.
    pub origin_port: u16,
    /// Canonical Host header for origin requests.
    pub origin_host: String,
    pub origin_connect_timeout_ms: u64,
    pub origin_read_timeout_ms: u64,
    /// Bind address of the intermediary itself.
    pub listen_addr: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            freshness_window_seconds: 60,
            backoff_base_ms: 50,
            backoff_cap_ms: 2000,
            max_body_bytes: 1_048_576,
            max_lookup_iterations: 5,
            cache_endpoint: "127.0.0.1:11211".to_string(),
            origin_port: 8080,
            origin_host: "localhost".to_string(),
            origin_connect_timeout_ms: 500,
            origin_read_timeout_ms: 15_000,
            listen_addr: "0.0.0.0:8090".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Placeholders expire at five backoff caps so a crashed fetcher cannot
    /// durably block a URL.
    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms * 5)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_connect_timeout_ms)
    }

    pub fn origin_read_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_read_timeout_ms)
    }

    pub fn origin_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.origin_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.freshness_window_seconds, 60);
        assert_eq!(config.backoff_base_ms, 50);
        assert_eq!(config.backoff_cap_ms, 2000);
        assert_eq!(config.max_body_bytes, 1_048_576);
        assert_eq!(config.max_lookup_iterations, 5);
        assert_eq!(config.origin_port, 8080);
    }

    #[test]
    fn test_placeholder_ttl_is_five_caps() {
        let config = ProxyConfig::default();
        assert_eq!(config.placeholder_ttl(), Duration::from_secs(10));
    }

    #[test]
    fn test_origin_base_url() {
        let config = ProxyConfig {
            origin_port: 8123,
            ..ProxyConfig::default()
        };
        assert_eq!(config.origin_base_url(), "http://127.0.0.1:8123");
    }

    #[test]
    fn test_deserialize_full() {
        let json = r#"{
            "freshness_window_seconds": 30,
            "backoff_base_ms": 10,
            "backoff_cap_ms": 100,
            "max_body_bytes": 4096,
            "max_lookup_iterations": 3,
            "cache_endpoint": "10.0.0.5:11211",
            "origin_port": 9000,
            "origin_host": "legacy.internal",
            "origin_connect_timeout_ms": 250,
            "origin_read_timeout_ms": 5000,
            "listen_addr": "127.0.0.1:8091"
        }"#;
        let config: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.freshness_window(), Duration::from_secs(30));
        assert_eq!(config.origin_host, "legacy.internal");
    }
}

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memgate_proxy::{AppState, HttpOrigin, ProxyConfig, SystemClock, Webcache};
use memgate_store::MemcachedStore;

#[derive(Parser, Debug)]
#[command(name = "memgate")]
#[command(about = "Transparent HTTP caching intermediary over a shared memcached store")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8090")]
    listen_addr: SocketAddr,

    #[arg(long, default_value = "127.0.0.1:11211")]
    cache_endpoint: String,

    #[arg(long, default_value_t = 8080)]
    origin_port: u16,

    #[arg(long, default_value = "localhost")]
    origin_host: String,

    #[arg(long, default_value_t = 60)]
    freshness_window_seconds: u64,

    #[arg(long, default_value_t = 50)]
    backoff_base_ms: u64,

    #[arg(long, default_value_t = 2000)]
    backoff_cap_ms: u64,

    #[arg(long, default_value_t = 1_048_576)]
    max_body_bytes: usize,

    #[arg(long, default_value_t = 5)]
    max_lookup_iterations: u32,

    #[arg(long, default_value_t = 500)]
    origin_connect_timeout_ms: u64,

    #[arg(long, default_value_t = 15_000)]
    origin_read_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            freshness_window_seconds: self.freshness_window_seconds,
            backoff_base_ms: self.backoff_base_ms,
            backoff_cap_ms: self.backoff_cap_ms,
            max_body_bytes: self.max_body_bytes,
            max_lookup_iterations: self.max_lookup_iterations,
            cache_endpoint: self.cache_endpoint,
            origin_port: self.origin_port,
            origin_host: self.origin_host,
            origin_connect_timeout_ms: self.origin_connect_timeout_ms,
            origin_read_timeout_ms: self.origin_read_timeout_ms,
            listen_addr: self.listen_addr.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let listen_addr = args.listen_addr;
    let config = args.into_config();

    info!(
        cache = %config.cache_endpoint,
        origin_port = config.origin_port,
        window_secs = config.freshness_window_seconds,
        "starting caching intermediary"
    );

    let store = Arc::new(
        MemcachedStore::new(config.cache_endpoint.clone())
            .with_timeouts(Duration::from_millis(500), Duration::from_secs(5)),
    );
    let origin = Arc::new(HttpOrigin::new(&config)?);
    let cache = Arc::new(Webcache::new(
        store,
        Arc::clone(&origin),
        Arc::new(SystemClock),
        config,
    ));

    let state = AppState {
        cache,
        passthrough: origin,
    };

    memgate_proxy::serve(listen_addr, state).await?;
    Ok(())
}

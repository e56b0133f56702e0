pub mod assemble;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod handler;
pub mod origin;
pub mod reservation;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use handler::{CacheRequest, Outcome, Webcache};
pub use origin::{HttpOrigin, OriginFetcher, OriginResponse};
pub use server::{handle_request, router, serve, AppState};

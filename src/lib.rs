//! Trident Proxy - multi-protocol forwarding proxy server
//!
//! Accepts SOCKS4/4a, SOCKS5 and HTTP clients on one listener, detects
//! the protocol from the first byte, and relays TCP streams or SOCKS5
//! UDP datagrams to upstream targets.

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod proto;
pub mod relay;
pub mod router;
pub mod server;
pub mod util;

pub use config::Config;
pub use error::ProxyError;
pub use server::Server;

/// Server version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Server implementation
//!
//! Listener, per-connection driver, and the state shared across
//! connections.

mod acceptor;
mod listener;

pub use acceptor::ClientStream;
pub use listener::Server;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::pool::{BufferPool, PortPools};
use crate::router::SubnetPolicy;
use std::sync::Arc;

/// Read-mostly state every connection borrows: configuration, the
/// authenticator list, the subnet policy and the shared pools. Only the
/// pools contain interior mutability.
pub struct Shared {
    pub config: Arc<Config>,
    pub auth: Vec<Box<dyn Authenticator>>,
    pub policy: SubnetPolicy,
    pub ports: PortPools,
    pub buffers: BufferPool,
}

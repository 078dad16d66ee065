//! Shared resource pools
//!
//! Ephemeral port pools for BIND/ASSOCIATE and the relay buffer pool.

mod buffer;
mod ports;

pub use buffer::{Buffer, BufferPool};
pub use ports::{PortLease, PortPool, PortPools};

//! Ephemeral port pools for BIND and UDP ASSOCIATE
//!
//! Each pool owns a closed port interval. Acquisition scans ascending and
//! hands out the lowest free port, so allocation order is deterministic.
//! A lease releases its port on drop; release is idempotent.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ProxyError;

/// A bounded pool of port numbers in `[start, end]`.
pub struct PortPool {
    label: &'static str,
    start: u16,
    end: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(label: &'static str, start: u16, end: u16) -> Self {
        Self {
            label,
            start,
            end,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the lowest free port. The lease returns it on drop.
    pub fn acquire(pool: &Arc<PortPool>) -> Result<PortLease, ProxyError> {
        let mut used = pool.used.lock();
        for port in pool.start..=pool.end {
            if used.insert(port) {
                return Ok(PortLease {
                    pool: pool.clone(),
                    port,
                });
            }
        }

        Err(ProxyError::PortExhausted(pool.label))
    }

    /// Unconditionally mark a port free.
    pub fn release(&self, port: u16) {
        self.used.lock().remove(&port);
    }

    /// Number of ports currently leased.
    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }
}

/// RAII handle to an acquired port.
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

/// The two independent pools the server shares across connections.
pub struct PortPools {
    pub tcp: Arc<PortPool>,
    pub udp: Arc<PortPool>,
}

impl PortPools {
    /// Build from the configured ranges; a disabled feature gets an empty
    /// pool that always reports exhaustion.
    pub fn new(tcp: Option<(u16, u16)>, udp: Option<(u16, u16)>) -> Self {
        let (tcp_start, tcp_end) = tcp.map_or((1, 0), |r| r);
        let (udp_start, udp_end) = udp.map_or((1, 0), |r| r);
        Self {
            tcp: Arc::new(PortPool::new("tcp", tcp_start, tcp_end)),
            udp: Arc::new(PortPool::new("udp", udp_start, udp_end)),
        }
    }

    pub fn acquire_tcp(&self) -> Result<PortLease, ProxyError> {
        PortPool::acquire(&self.tcp)
    }

    pub fn acquire_udp(&self) -> Result<PortLease, ProxyError> {
        PortPool::acquire(&self.udp)
    }
}

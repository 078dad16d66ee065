//! Atomic counters for hot-path metrics
//!
//! Lock-free counters that can be safely updated from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Connection metrics
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_failed: AtomicU64,

    // Session metrics per protocol
    pub sessions_socks4: AtomicU64,
    pub sessions_socks5: AtomicU64,
    pub sessions_http: AtomicU64,

    // Traffic metrics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // UDP relay metrics
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_dropped: AtomicU64,

    // Auth metrics
    pub auth_success: AtomicU64,
    pub auth_failure: AtomicU64,

    // Error metrics
    pub errors_total: AtomicU64,
    pub timeouts_total: AtomicU64,

    // Pool metrics
    pub port_pool_exhausted: AtomicU64,
    pub buffer_pool_acquires: AtomicU64,
    pub buffer_pool_releases: AtomicU64,
    pub buffer_pool_misses: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            sessions_socks4: AtomicU64::new(0),
            sessions_socks5: AtomicU64::new(0),
            sessions_http: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failure: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            port_pool_exhausted: AtomicU64::new(0),
            buffer_pool_acquires: AtomicU64::new(0),
            buffer_pool_releases: AtomicU64::new(0),
            buffer_pool_misses: AtomicU64::new(0),
        }
    }

    // Connection tracking
    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Protocol session tracking
    #[inline]
    pub fn session_socks4(&self) {
        self.sessions_socks4.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_socks5(&self) {
        self.sessions_socks5.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_http(&self) {
        self.sessions_http.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic tracking
    #[inline]
    pub fn bytes_rx(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    // Datagram tracking
    #[inline]
    pub fn datagram_rx(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn datagram_tx(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Auth tracking
    #[inline]
    pub fn auth_ok(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn auth_rejected(&self) {
        self.auth_failure.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    #[inline]
    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    // Pool tracking
    #[inline]
    pub fn port_exhausted(&self) {
        self.port_pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_acquired(&self) {
        self.buffer_pool_acquires.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_released(&self) {
        self.buffer_pool_releases.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_miss(&self) {
        self.buffer_pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            sessions_socks4: self.sessions_socks4.load(Ordering::Relaxed),
            sessions_socks5: self.sessions_socks5.load(Ordering::Relaxed),
            sessions_http: self.sessions_http.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failure: self.auth_failure.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            port_pool_exhausted: self.port_pool_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_failed: u64,
    pub sessions_socks4: u64,
    pub sessions_socks5: u64,
    pub sessions_http: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub auth_success: u64,
    pub auth_failure: u64,
    pub errors_total: u64,
    pub timeouts_total: u64,
    pub port_pool_exhausted: u64,
}

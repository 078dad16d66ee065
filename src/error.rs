//! Error types for the proxy core
//!
//! One variant per failure class; handlers map these onto the
//! protocol-specific rejection replies before returning them.

use std::net::IpAddr;

/// Errors surfaced by protocol handlers and the relay engine.
///
/// Every variant is terminal for its connection except where noted by the
/// UDP relay, which treats per-datagram parse failures as droppable.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Protocol parse failure (bad framing, oversized field, wrong version).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// First byte matched no supported protocol.
    #[error("unknown protocol, first byte {0:#04x}")]
    ProtocolUnknown(u8),

    /// The requested command is disabled in configuration.
    #[error("{0} disabled in config")]
    FeatureDisabled(&'static str),

    /// Credentials were presented and rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// Anonymous access disabled and no usable credentials offered.
    #[error("authentication required")]
    AuthRequired,

    /// Source or destination address outside the subnet policy.
    #[error("address {0} blocked by subnet policy")]
    SubnetBlocked(IpAddr),

    /// Upstream resolution or dialing exhausted every candidate.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// The TCP-bind or UDP-associate port range is fully in use.
    #[error("no free {0} port in configured range")]
    PortExhausted(&'static str),

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for failures caused by the client rather than the server side.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ProxyError::MalformedRequest(_)
                | ProxyError::ProtocolUnknown(_)
                | ProxyError::AuthFailed
                | ProxyError::AuthRequired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_fault_classification() {
        assert!(ProxyError::AuthFailed.is_client_fault());
        assert!(ProxyError::ProtocolUnknown(0x47).is_client_fault());
        assert!(!ProxyError::PortExhausted("tcp").is_client_fault());
        assert!(!ProxyError::HostUnreachable("example.com:80".into()).is_client_fault());
    }
}

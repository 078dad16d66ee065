//! Protocol detection
//!
//! One byte is peeled off the client stream and decides which state
//! machine runs; every handler starts after its version byte.

use crate::error::ProxyError;

/// Protocols the listener can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks4,
    Socks5,
    Http,
}

/// Map the first byte of a connection to a protocol.
///
/// `0x04` and `0x05` are the SOCKS version bytes. `'C'` is the start of
/// an HTTP `CONNECT`; other request verbs (`GET`, `POST`, ...) begin with
/// different letters and are only routed to the HTTP handler when forward
/// mode is enabled.
pub fn detect(first: u8, allow_http_forward: bool) -> Result<Protocol, ProxyError> {
    match first {
        0x04 => Ok(Protocol::Socks4),
        0x05 => Ok(Protocol::Socks5),
        b'C' => Ok(Protocol::Http),
        b'A'..=b'Z' if allow_http_forward => Ok(Protocol::Http),
        other => Err(ProxyError::ProtocolUnknown(other)),
    }
}

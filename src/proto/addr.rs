//! Destination addresses and the SOCKS5 address codec
//!
//! SOCKS5 encodes addresses as `ATYP | ADDR | PORT(2 BE)` with
//! `ATYP 0x01` = 4-byte IPv4, `0x03` = length-prefixed domain,
//! `0x04` = 16-byte IPv6. The same encoding appears in requests,
//! replies and UDP datagram headers, so both a stream reader and a
//! slice parser are provided.

use bytes::BufMut;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;

/// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A connect/bind/relay target: exactly one address form plus a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Destination::Ipv4(_, port) => *port,
            Destination::Ipv6(_, port) => *port,
            Destination::Domain(_, port) => *port,
        }
    }

    /// The IP address, when the destination is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Destination::Ipv4(addr, _) => Some(IpAddr::V4(*addr)),
            Destination::Ipv6(addr, _) => Some(IpAddr::V6(*addr)),
            Destination::Domain(..) => None,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Destination::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Destination::Ipv6(*v6.ip(), v6.port()),
        }
    }

    /// Read a SOCKS5 `ATYP | ADDR | PORT` sequence from a stream.
    pub async fn read_socks5<R>(reader: &mut R) -> Result<Self, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        let dest = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Destination::Ipv4(Ipv4Addr::from(octets), port)
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProxyError::MalformedRequest("empty domain name".into()));
                }
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let name = String::from_utf8(name)
                    .map_err(|_| ProxyError::MalformedRequest("domain is not utf-8".into()))?;
                let port = reader.read_u16().await?;
                Destination::Domain(name, port)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Destination::Ipv6(Ipv6Addr::from(octets), port)
            }
            other => {
                return Err(ProxyError::MalformedRequest(format!(
                    "unknown address type {:#04x}",
                    other
                )))
            }
        };

        Ok(dest)
    }

    /// Parse a SOCKS5 address from a slice, returning the bytes consumed.
    ///
    /// Used by the UDP datagram header where the payload follows the
    /// address in the same buffer.
    pub fn parse_socks5(data: &[u8]) -> Result<(Self, usize), ProxyError> {
        let short = || ProxyError::MalformedRequest("truncated address".into());

        let atyp = *data.first().ok_or_else(short)?;
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(short());
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&data[1..5]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Destination::Ipv4(Ipv4Addr::from(octets), port), 7))
            }
            ATYP_DOMAIN => {
                let len = *data.get(1).ok_or_else(short)? as usize;
                if len == 0 {
                    return Err(ProxyError::MalformedRequest("empty domain name".into()));
                }
                if data.len() < 2 + len + 2 {
                    return Err(short());
                }
                let name = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| ProxyError::MalformedRequest("domain is not utf-8".into()))?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Destination::Domain(name.to_string(), port), 2 + len + 2))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(short());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Destination::Ipv6(Ipv6Addr::from(octets), port), 19))
            }
            other => Err(ProxyError::MalformedRequest(format!(
                "unknown address type {:#04x}",
                other
            ))),
        }
    }

    /// Append the SOCKS5 `ATYP | ADDR | PORT` encoding of this destination.
    pub fn write_socks5(&self, buf: &mut Vec<u8>) {
        match self {
            Destination::Ipv4(addr, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.octets());
                buf.put_u16(*port);
            }
            Destination::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.put_u16(*port);
            }
            Destination::Ipv6(addr, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.octets());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Ipv4(addr, port) => write!(f, "{}:{}", addr, port),
            Destination::Ipv6(addr, port) => write!(f, "[{}]:{}", addr, port),
            Destination::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

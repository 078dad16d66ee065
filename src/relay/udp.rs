//! UDP association relay
//!
//! One task per association owns the packet socket. The first sender
//! becomes the client endpoint; its datagrams carry a SOCKS5 UDP header
//! and are forwarded to the addressed destination, while datagrams from
//! anyone else are wrapped in a header naming the sender and pushed back
//! to the client. Bad datagrams are dropped; only socket errors or the
//! idle deadline end the loop.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;
use crate::metrics::METRICS;
use crate::proto::addr::Destination;

/// Largest possible UDP payload; the receive buffer is pre-allocated at
/// this size so no datagram is ever truncated.
pub const MAX_DATAGRAM: usize = 65_535;

/// Split a SOCKS5 UDP request into its destination and payload.
///
/// Header: `RSV(2, zero) | FRAG(1, zero) | ATYP | DST.ADDR | DST.PORT`.
pub fn parse_datagram(data: &[u8]) -> Result<(Destination, &[u8]), ProxyError> {
    if data.len() < 4 {
        return Err(ProxyError::MalformedRequest("udp header too short".into()));
    }
    if data[0] != 0x00 || data[1] != 0x00 {
        return Err(ProxyError::MalformedRequest("udp header RSV not zero".into()));
    }
    if data[2] != 0x00 {
        return Err(ProxyError::MalformedRequest(
            "udp fragmentation not supported".into(),
        ));
    }

    let (dest, consumed) = Destination::parse_socks5(&data[3..])?;
    Ok((dest, &data[3 + consumed..]))
}

/// Wrap an inbound payload in a SOCKS5 UDP header naming its sender.
pub fn encode_datagram(from: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 22);
    buf.extend_from_slice(&[0x00, 0x00, 0x00]);
    Destination::from_socket_addr(from).write_socks5(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// A running UDP relay bound to one associate socket.
pub struct UdpAssociation {
    socket: UdpSocket,
    idle_timeout: Duration,
}

impl UdpAssociation {
    pub fn new(socket: UdpSocket, idle_timeout: Duration) -> Self {
        Self {
            socket,
            idle_timeout,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay datagrams until the socket fails or the idle deadline fires.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut client: Option<SocketAddr> = None;

        loop {
            let (len, sender) = match timeout(self.idle_timeout, self.socket.recv_from(&mut buf))
                .await
            {
                Err(_) => {
                    METRICS.timeout();
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            METRICS.datagram_rx();

            let client_addr = *client.get_or_insert(sender);

            let result = if sender == client_addr {
                self.forward_outbound(&buf[..len]).await
            } else {
                self.forward_inbound(sender, &buf[..len], client_addr).await
            };

            if let Err(e) = result {
                METRICS.datagram_dropped();
                debug!(%sender, error = %e, "datagram dropped");
            }
        }
    }

    /// Client datagram: strip the header and send the payload onward.
    async fn forward_outbound(&self, datagram: &[u8]) -> Result<(), ProxyError> {
        let (dest, payload) = parse_datagram(datagram)?;

        match &dest {
            Destination::Ipv4(addr, port) => {
                self.socket
                    .send_to(payload, SocketAddr::new((*addr).into(), *port))
                    .await?;
            }
            Destination::Ipv6(addr, port) => {
                self.socket
                    .send_to(payload, SocketAddr::new((*addr).into(), *port))
                    .await?;
            }
            Destination::Domain(name, port) => {
                let candidates = lookup_host((name.as_str(), *port))
                    .await
                    .map_err(|e| ProxyError::HostUnreachable(format!("{}: {}", name, e)))?;

                let mut sent = false;
                for addr in candidates {
                    if self.socket.send_to(payload, addr).await.is_ok() {
                        sent = true;
                        break;
                    }
                }
                if !sent {
                    return Err(ProxyError::HostUnreachable(format!("{}:{}", name, port)));
                }
            }
        }

        METRICS.datagram_tx();
        Ok(())
    }

    /// Remote datagram: wrap it and relay to the client endpoint.
    async fn forward_inbound(
        &self,
        sender: SocketAddr,
        payload: &[u8],
        client: SocketAddr,
    ) -> Result<(), ProxyError> {
        let packet = encode_datagram(sender, payload);
        self.socket.send_to(&packet, client).await?;
        METRICS.datagram_tx();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_request() {
        // 00 00 00 01 08 08 08 08 00 35 <payload>
        let data = [
            0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35, 0xDE, 0xAD,
        ];
        let (dest, payload) = parse_datagram(&data).unwrap();
        assert_eq!(dest, Destination::Ipv4("8.8.8.8".parse().unwrap(), 53));
        assert_eq!(payload, &[0xDE, 0xAD]);
    }

    #[test]
    fn test_parse_domain_request() {
        let mut data = vec![0x00, 0x00, 0x00];
        Destination::Domain("dns.example".into(), 53).write_socks5(&mut data);
        data.extend_from_slice(b"query");

        let (dest, payload) = parse_datagram(&data).unwrap();
        assert_eq!(dest, Destination::Domain("dns.example".into(), 53));
        assert_eq!(payload, b"query");
    }

    #[test]
    fn test_nonzero_rsv_rejected() {
        let data = [0x00, 0x01, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        assert!(parse_datagram(&data).is_err());
    }

    #[test]
    fn test_fragment_rejected() {
        let data = [0x00, 0x00, 0x01, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        assert!(parse_datagram(&data).is_err());
    }

    #[test]
    fn test_encode_ipv6_sender_uses_atyp4() {
        let sender: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let packet = encode_datagram(sender, b"reply");
        assert_eq!(&packet[..3], &[0x00, 0x00, 0x00]);
        assert_eq!(packet[3], 0x04);
        assert_eq!(packet.len(), 3 + 1 + 16 + 2 + 5);
        assert_eq!(&packet[packet.len() - 5..], b"reply");
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let sender: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let packet = encode_datagram(sender, b"answer");
        let (dest, payload) = parse_datagram(&packet).unwrap();
        assert_eq!(dest, Destination::Ipv4("8.8.8.8".parse().unwrap(), 53));
        assert_eq!(payload, b"answer");
    }

    #[tokio::test]
    async fn test_association_relays_both_ways() {
        let assoc_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let assoc_addr = assoc_socket.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let assoc = UdpAssociation::new(assoc_socket, Duration::from_secs(2));
        let task = tokio::spawn(async move { assoc.run().await });

        // Client speaks first and becomes the association's endpoint.
        let mut request = vec![0x00, 0x00, 0x00];
        Destination::from_socket_addr(remote_addr).write_socks5(&mut request);
        request.extend_from_slice(b"ping");
        client.send_to(&request, assoc_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, assoc_addr);

        // The remote answer comes back wrapped in a header naming it.
        remote.send_to(b"pong", assoc_addr).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let (dest, payload) = parse_datagram(&buf[..n]).unwrap();
        assert_eq!(dest, Destination::from_socket_addr(remote_addr));
        assert_eq!(payload, b"pong");

        // A malformed datagram is dropped without ending the loop.
        client.send_to(&[0xFF], assoc_addr).await.unwrap();
        client.send_to(&request, assoc_addr).await.unwrap();
        let (n, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        task.abort();
    }
}

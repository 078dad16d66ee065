//! Protocol handlers
//!
//! One state machine per protocol, all driven through the same four
//! phases: handshake, authenticate, request, relay. The set of
//! protocols is closed, so the driver works with a tagged sum rather
//! than trait objects; per-variant state stays heterogeneous.

pub mod addr;
pub mod http;
pub mod socks4;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::ProxyError;
use crate::router::Protocol;
use crate::server::Shared;
use addr::Destination;

/// Proxy commands shared by the SOCKS protocols; HTTP only tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

/// What a handler learned from its handshake: produced after the
/// request phase, consumed by the relay phase.
#[derive(Debug)]
pub struct ClientRequest {
    pub command: Command,
    pub dest: Destination,
    /// Authenticated username; `None` is an anonymous session.
    pub user: Option<String>,
}

/// A protocol state machine bound to one client connection.
pub enum Handler {
    Socks4(socks4::Socks4Handler),
    Socks5(socks5::Socks5Handler),
    Http(http::HttpHandler),
}

impl Handler {
    /// Construct the handler for a detected protocol. `first` is the
    /// consumed dispatch byte; only HTTP needs it back (it is the first
    /// letter of the request verb).
    pub fn new(protocol: Protocol, first: u8, shared: Arc<Shared>, peer: SocketAddr) -> Self {
        match protocol {
            Protocol::Socks4 => Handler::Socks4(socks4::Socks4Handler::new(shared, peer)),
            Protocol::Socks5 => Handler::Socks5(socks5::Socks5Handler::new(shared, peer)),
            Protocol::Http => Handler::Http(http::HttpHandler::new(shared, peer, first)),
        }
    }

    /// Read the protocol greeting that follows the version byte.
    pub async fn handshake<S>(&mut self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Handler::Socks4(h) => h.handshake(conn).await,
            Handler::Socks5(h) => h.handshake(conn).await,
            Handler::Http(h) => h.handshake(conn).await,
        }
    }

    /// Negotiate authentication; returns the authenticated username.
    pub async fn authenticate<S>(&mut self, conn: &mut S) -> Result<Option<String>, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Handler::Socks4(h) => h.authenticate(conn).await,
            Handler::Socks5(h) => h.authenticate(conn).await,
            Handler::Http(h) => h.authenticate(conn).await,
        }
    }

    /// Read and validate the client's command.
    pub async fn request<S>(&mut self, conn: &mut S) -> Result<ClientRequest, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Handler::Socks4(h) => h.request(conn).await,
            Handler::Socks5(h) => h.request(conn).await,
            Handler::Http(h) => h.request(conn).await,
        }
    }

    /// Run the command to completion, consuming the connection.
    pub async fn relay<S>(self, conn: S, request: ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Handler::Socks4(h) => h.relay(conn, request).await,
            Handler::Socks5(h) => h.relay(conn, request).await,
            Handler::Http(h) => h.relay(conn, request).await,
        }
    }
}

//! Per-connection driver
//!
//! Wraps the accepted socket (optionally completing a TLS handshake),
//! peeks the first byte to pick a protocol, then walks the handler
//! through handshake, authentication, source policy, request and relay.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument};

use crate::error::ProxyError;
use crate::metrics::METRICS;
use crate::proto::Handler;
use crate::router::{self, Protocol};
use crate::server::Shared;

/// A client connection, plain or TLS-wrapped. Handlers never care which.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Handle one accepted connection to completion.
#[instrument(skip(stream, tls, shared), fields(client = %peer))]
pub async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) -> Result<(), ProxyError> {
    METRICS.connection_opened();
    debug!("new connection");

    let result = run_session(stream, peer, tls, shared).await;

    METRICS.connection_closed();
    if result.is_err() {
        METRICS.error();
    }
    debug!("connection closed");

    result
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) -> Result<(), ProxyError> {
    let deadline = shared.config.server.timeout_duration();

    let stream = match tls {
        Some(acceptor) => {
            let accepted = timeout(deadline, acceptor.accept(stream))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out")
                })??;
            ClientStream::Tls(Box::new(accepted))
        }
        None => ClientStream::Plain(stream),
    };

    let mut conn = BufReader::new(stream);

    // Everything before the relay phase runs under the session deadline;
    // the relay applies its own per-read deadlines.
    let first = timeout(deadline, conn.read_u8())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "client sent nothing"))??;

    let protocol = router::detect(first, shared.config.server.allow_http_forward)?;
    match protocol {
        Protocol::Socks4 => METRICS.session_socks4(),
        Protocol::Socks5 => METRICS.session_socks5(),
        Protocol::Http => METRICS.session_http(),
    }

    let mut handler = Handler::new(protocol, first, shared.clone(), peer);

    timeout(deadline, handler.handshake(&mut conn))
        .await
        .map_err(|_| timed_out("handshake"))??;

    let user = timeout(deadline, handler.authenticate(&mut conn))
        .await
        .map_err(|_| timed_out("authentication"))??;

    shared.policy.check_source(user.as_deref(), peer.ip())?;

    let request = timeout(deadline, handler.request(&mut conn))
        .await
        .map_err(|_| timed_out("request"))??;

    handler.relay(conn, request).await
}

fn timed_out(phase: &str) -> ProxyError {
    METRICS.timeout();
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} deadline expired", phase),
    ))
}

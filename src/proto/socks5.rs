//! SOCKS5 handler
//!
//! RFC 1928 server side: method negotiation, RFC 1929 username/password
//! sub-negotiation, then CONNECT, BIND or UDP ASSOCIATE. Replies echo the
//! request destination for CONNECT and carry the configured endpoint for
//! BIND/ASSOCIATE, using the domain ATYP when that endpoint is configured
//! as a hostname.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::auth;
use crate::config::BindAddr;
use crate::error::ProxyError;
use crate::metrics::METRICS;
use crate::proto::addr::Destination;
use crate::proto::{ClientRequest, Command};
use crate::relay::{self, UdpAssociation};
use crate::router::upstream;
use crate::server::Shared;

pub const VERSION: u8 = 0x05;

/// Authentication methods
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_SUBNEG_VERSION: u8 = 0x01;

/// Commands
const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONN_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_TTL_EXPIRED: u8 = 0x06;

/// SOCKS5 state machine.
pub struct Socks5Handler {
    shared: Arc<Shared>,
    peer: SocketAddr,

    offered_methods: Vec<u8>,
    user: Option<String>,
    command: u8,
    dest: Option<Destination>,
}

impl Socks5Handler {
    pub fn new(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            offered_methods: Vec::new(),
            user: None,
            command: 0,
            dest: None,
        }
    }

    /// Read the method list that follows the version byte.
    pub async fn handshake<S>(&mut self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let nmethods = conn.read_u8().await? as usize;
        let mut methods = vec![0u8; nmethods];
        conn.read_exact(&mut methods).await?;
        self.offered_methods = methods;
        Ok(())
    }

    /// Select an authentication method in the client's offer order and
    /// run the username/password sub-negotiation when chosen.
    pub async fn authenticate<S>(&mut self, conn: &mut S) -> Result<Option<String>, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let config = &self.shared.config.server;

        for method in self.offered_methods.clone() {
            if method == AUTH_NONE && config.allow_anonymous {
                conn.write_all(&[VERSION, AUTH_NONE]).await?;
                conn.flush().await?;
                return Ok(None);
            }

            if method == AUTH_USERPASS && !self.shared.auth.is_empty() {
                conn.write_all(&[VERSION, AUTH_USERPASS]).await?;
                conn.flush().await?;

                let (username, password) = read_userpass(conn).await?;
                if auth::check_all(&self.shared.auth, &username, &password) {
                    conn.write_all(&[AUTH_SUBNEG_VERSION, 0x00]).await?;
                    conn.flush().await?;
                    METRICS.auth_ok();
                    debug!(client = %self.peer, user = %username, "socks5 authenticated");
                    self.user = Some(username.clone());
                    return Ok(Some(username));
                }

                conn.write_all(&[AUTH_SUBNEG_VERSION, 0x01]).await?;
                conn.flush().await?;
                METRICS.auth_rejected();
                return Err(ProxyError::AuthFailed);
            }
        }

        conn.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await?;
        conn.flush().await?;
        Err(ProxyError::AuthRequired)
    }

    /// Read `VER | CMD | RSV | ATYP | ADDR | PORT` and gate the command.
    pub async fn request<S>(&mut self, conn: &mut S) -> Result<ClientRequest, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let version = conn.read_u8().await?;
        if version != VERSION {
            return Err(ProxyError::MalformedRequest(format!(
                "wrong request version {:#04x}",
                version
            )));
        }

        self.command = conn.read_u8().await?;
        let _reserved = conn.read_u8().await?;
        let dest = Destination::read_socks5(conn).await?;
        self.dest = Some(dest.clone());

        let config = &self.shared.config.server;
        let command = match self.command {
            CMD_CONNECT => Command::Connect,
            CMD_BIND => {
                if !config.allow_tcp_bind {
                    self.reply_echo(conn, REP_CONN_NOT_ALLOWED).await?;
                    return Err(ProxyError::FeatureDisabled("tcp bind"));
                }
                Command::Bind
            }
            CMD_UDP_ASSOCIATE => {
                if !config.allow_udp_association {
                    self.reply_echo(conn, REP_CONN_NOT_ALLOWED).await?;
                    return Err(ProxyError::FeatureDisabled("udp association"));
                }
                Command::UdpAssociate
            }
            other => {
                return Err(ProxyError::MalformedRequest(format!(
                    "unknown socks5 command {:#04x}",
                    other
                )))
            }
        };

        Ok(ClientRequest {
            command,
            dest,
            user: self.user.clone(),
        })
    }

    pub async fn relay<S>(self, mut conn: S, request: ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match request.command {
            Command::Connect => self.relay_connect(&mut conn, &request).await,
            Command::Bind => self.relay_bind(&mut conn).await,
            Command::UdpAssociate => self.relay_udp_associate(&mut conn).await,
        }
    }

    async fn relay_connect<S>(&self, conn: &mut S, request: &ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        info!(client = %self.client_label(), target = %request.dest, "socks5 connect");

        let upstream = match upstream::connect(
            &request.dest,
            request.user.as_deref(),
            &self.shared.policy,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let code = match &e {
                    ProxyError::SubnetBlocked(_) => REP_CONN_NOT_ALLOWED,
                    _ => REP_HOST_UNREACHABLE,
                };
                self.reply_echo(conn, code).await?;
                return Err(e);
            }
        };

        self.reply_echo(conn, REP_SUCCESS).await?;

        relay::tcp::run(
            conn,
            upstream,
            &self.shared.buffers,
            self.shared.config.server.timeout_duration(),
        )
        .await;

        Ok(())
    }

    async fn relay_bind<S>(&self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let Some(bind_cfg) = self.shared.config.tcp_bind.clone() else {
            self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
            return Err(ProxyError::FeatureDisabled("tcp bind"));
        };
        let bind_addr = bind_cfg.bind_addr();

        let lease = match self.shared.ports.acquire_tcp() {
            Ok(lease) => lease,
            Err(e) => {
                METRICS.port_exhausted();
                self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
                return Err(e);
            }
        };

        let listener = match bind_listener(&bind_addr, lease.port()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
                return Err(e.into());
            }
        };

        info!(
            client = %self.client_label(),
            bind = %bind_cfg.addr,
            port = lease.port(),
            "socks5 bind listening"
        );
        self.reply_endpoint(conn, REP_SUCCESS, &bind_addr, lease.port())
            .await?;

        let deadline = self.shared.config.server.timeout_duration();
        let (remote, remote_addr) = match timeout(deadline, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                self.reply_endpoint(conn, REP_TTL_EXPIRED, &bind_addr, lease.port())
                    .await?;
                return Err(e.into());
            }
            Err(_) => {
                METRICS.timeout();
                self.reply_endpoint(conn, REP_TTL_EXPIRED, &bind_addr, lease.port())
                    .await?;
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "bind accept deadline expired",
                )));
            }
        };
        drop(listener);

        debug!(client = %self.client_label(), remote = %remote_addr, "socks5 bind accepted");
        self.reply_endpoint(
            conn,
            REP_SUCCESS,
            &BindAddr::Ip(remote_addr.ip()),
            remote_addr.port(),
        )
        .await?;

        relay::tcp::run(
            conn,
            remote,
            &self.shared.buffers,
            self.shared.config.server.timeout_duration(),
        )
        .await;

        Ok(())
    }

    async fn relay_udp_associate<S>(&self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let Some(assoc_cfg) = self.shared.config.udp_associate.clone() else {
            self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
            return Err(ProxyError::FeatureDisabled("udp association"));
        };
        let assoc_addr = assoc_cfg.bind_addr();

        let lease = match self.shared.ports.acquire_udp() {
            Ok(lease) => lease,
            Err(e) => {
                METRICS.port_exhausted();
                self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
                return Err(e);
            }
        };

        let socket = match bind_udp(&assoc_addr, lease.port()).await {
            Ok(socket) => socket,
            Err(e) => {
                self.reply_echo(conn, REP_GENERAL_FAILURE).await?;
                return Err(e.into());
            }
        };

        info!(
            client = %self.client_label(),
            associate = %assoc_cfg.addr,
            port = lease.port(),
            "socks5 udp association"
        );
        self.reply_endpoint(conn, REP_SUCCESS, &assoc_addr, lease.port())
            .await?;

        let association = UdpAssociation::new(
            socket,
            self.shared.config.server.timeout_duration(),
        );

        // The association lives as long as the control connection; when
        // the client closes it (or the relay loop dies) everything here
        // drops, which also returns the leased port.
        tokio::select! {
            result = association.run() => {
                if let Err(e) = &result {
                    debug!(client = %self.client_label(), error = %e, "udp association ended");
                }
                result?;
            }
            _ = drain_control(conn) => {
                debug!(client = %self.client_label(), "control connection closed");
            }
        }

        Ok(())
    }

    /// Reply echoing the request destination (CONNECT path).
    async fn reply_echo<S>(&self, conn: &mut S, code: u8) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let dest = self
            .dest
            .clone()
            .unwrap_or(Destination::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0));
        write_reply(conn, code, &dest).await
    }

    /// Reply carrying a bound endpoint (BIND / UDP ASSOCIATE paths).
    async fn reply_endpoint<S>(
        &self,
        conn: &mut S,
        code: u8,
        addr: &BindAddr,
        port: u16,
    ) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let dest = match addr {
            BindAddr::Ip(std::net::IpAddr::V4(v4)) => Destination::Ipv4(*v4, port),
            BindAddr::Ip(std::net::IpAddr::V6(v6)) => Destination::Ipv6(*v6, port),
            BindAddr::Hostname(name) => Destination::Domain(name.clone(), port),
        };
        write_reply(conn, code, &dest).await
    }

    fn client_label(&self) -> String {
        match &self.user {
            Some(user) => format!("{}({})", self.peer, user),
            None => self.peer.to_string(),
        }
    }
}

/// `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`
async fn write_reply<S>(conn: &mut S, code: u8, endpoint: &Destination) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin + Send,
{
    let mut reply = Vec::with_capacity(22);
    reply.push(VERSION);
    reply.push(code);
    reply.push(0x00);
    endpoint.write_socks5(&mut reply);
    conn.write_all(&reply).await?;
    conn.flush().await?;
    Ok(())
}

/// RFC 1929: `VER | ULEN | UNAME | PLEN | PASSWD`, non-zero lengths.
async fn read_userpass<S>(conn: &mut S) -> Result<(String, String), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let version = conn.read_u8().await?;
    if version != AUTH_SUBNEG_VERSION {
        return Err(ProxyError::MalformedRequest(format!(
            "wrong auth sub-negotiation version {:#04x}",
            version
        )));
    }

    let username = read_length_prefixed(conn, "username").await?;
    let password = read_length_prefixed(conn, "password").await?;
    Ok((username, password))
}

async fn read_length_prefixed<S>(conn: &mut S, field: &str) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let len = conn.read_u8().await? as usize;
    if len == 0 {
        return Err(ProxyError::MalformedRequest(format!("empty {}", field)));
    }

    let mut bytes = vec![0u8; len];
    conn.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map_err(|_| ProxyError::MalformedRequest(format!("{} is not utf-8", field)))
}

async fn bind_listener(addr: &BindAddr, port: u16) -> std::io::Result<TcpListener> {
    match addr {
        BindAddr::Ip(ip) => TcpListener::bind(SocketAddr::new(*ip, port)).await,
        BindAddr::Hostname(name) => TcpListener::bind((name.as_str(), port)).await,
    }
}

async fn bind_udp(addr: &BindAddr, port: u16) -> std::io::Result<UdpSocket> {
    match addr {
        BindAddr::Ip(ip) => UdpSocket::bind(SocketAddr::new(*ip, port)).await,
        BindAddr::Hostname(name) => UdpSocket::bind((name.as_str(), port)).await,
    }
}

/// Hold the control connection open, discarding anything the client
/// writes; returns when the client side closes or errors.
async fn drain_control<S>(conn: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut discard = [0u8; 32];
    loop {
        match conn.read(&mut discard).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_userpass() {
        // "user"/"pass" sub-negotiation from RFC 1929
        let data = [
            0x01, 0x04, 0x75, 0x73, 0x65, 0x72, 0x04, 0x70, 0x61, 0x73, 0x73,
        ];
        let mut cursor = Cursor::new(data.to_vec());
        let (username, password) = read_userpass(&mut cursor).await.unwrap();
        assert_eq!(username, "user");
        assert_eq!(password, "pass");
    }

    #[tokio::test]
    async fn test_empty_username_rejected() {
        let data = [0x01, 0x00, 0x04, 0x70, 0x61, 0x73, 0x73];
        let mut cursor = Cursor::new(data.to_vec());
        assert!(matches!(
            read_userpass(&mut cursor).await,
            Err(ProxyError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_password_rejected() {
        let data = [0x01, 0x01, 0x75, 0x00];
        let mut cursor = Cursor::new(data.to_vec());
        assert!(read_userpass(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_subneg_version_rejected() {
        let data = [0x05, 0x04, 0x75, 0x73, 0x65, 0x72, 0x04, 0x70, 0x61, 0x73, 0x73];
        let mut cursor = Cursor::new(data.to_vec());
        assert!(read_userpass(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_reply_echoes_domain_atyp() {
        let mut out = Cursor::new(Vec::new());
        write_reply(
            &mut out,
            REP_SUCCESS,
            &Destination::Domain("example.co".into(), 443),
        )
        .await
        .unwrap();

        assert_eq!(
            out.into_inner(),
            vec![
                0x05, 0x00, 0x00, 0x03, 0x09, 0x65, 0x78, 0x61, 0x6D, 0x70, 0x6C, 0x65, 0x2E,
                0x63, 0x6F, 0x01, 0xBB,
            ]
        );
    }

    #[tokio::test]
    async fn test_reply_ipv4_layout() {
        let mut out = Cursor::new(Vec::new());
        write_reply(
            &mut out,
            REP_SUCCESS,
            &Destination::Ipv4("127.0.0.1".parse().unwrap(), 80),
        )
        .await
        .unwrap();
        assert_eq!(
            out.into_inner(),
            vec![0x05, 0x00, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]
        );
    }
}

//! SOCKS4/4a handler
//!
//! Request after the version byte:
//! `CMD(1) | DSTPORT(2 BE) | DSTIP(4) | USERID(NUL-terminated)` with an
//! optional NUL-terminated domain when DSTIP is the 4a escape
//! `0.0.0.x, x != 0`. Replies are `0x00 | CODE | DSTPORT(2 BE) | DSTIP(4)`.
//! CONNECT and BIND only; the protocol has no authentication.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::BindAddr;
use crate::error::ProxyError;
use crate::metrics::METRICS;
use crate::proto::addr::Destination;
use crate::proto::{ClientRequest, Command};
use crate::relay;
use crate::router::upstream;
use crate::server::Shared;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;

const REPLY_GRANTED: u8 = 0x5A;
const REPLY_REJECTED: u8 = 0x5B;

/// NUL-terminated fields may not reach this many bytes.
const MAX_FIELD: usize = 256;

/// SOCKS4/4a state machine.
pub struct Socks4Handler {
    shared: Arc<Shared>,
    peer: SocketAddr,

    command: u8,
    dest: Option<Destination>,
    ip_literal: Option<Ipv4Addr>,
    userid: String,
}

impl Socks4Handler {
    pub fn new(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            command: 0,
            dest: None,
            ip_literal: None,
            userid: String::new(),
        }
    }

    /// Read the whole fixed request and validate the command.
    pub async fn handshake<S>(&mut self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        self.command = conn.read_u8().await?;
        let port = conn.read_u16().await?;

        let mut ip = [0u8; 4];
        conn.read_exact(&mut ip).await?;

        self.userid = read_nul_terminated(conn, "userid").await?;

        // 4a escape: 0.0.0.x with x != 0 means a domain name follows.
        if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
            let domain = read_nul_terminated(conn, "domain").await?;
            self.dest = Some(Destination::Domain(domain, port));
        } else {
            let addr = Ipv4Addr::from(ip);
            self.ip_literal = Some(addr);
            self.dest = Some(Destination::Ipv4(addr, port));
        }

        match self.command {
            CMD_CONNECT => Ok(()),
            CMD_BIND => {
                if !self.shared.config.server.allow_tcp_bind {
                    self.reply(conn, REPLY_REJECTED).await?;
                    return Err(ProxyError::FeatureDisabled("tcp bind"));
                }
                Ok(())
            }
            other => Err(ProxyError::MalformedRequest(format!(
                "unknown socks4 command {:#04x}",
                other
            ))),
        }
    }

    /// SOCKS4 carries no credentials; the connection must be anonymous.
    pub async fn authenticate<S>(&mut self, conn: &mut S) -> Result<Option<String>, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        if !self.shared.config.server.allow_anonymous {
            self.reply(conn, REPLY_REJECTED).await?;
            return Err(ProxyError::AuthRequired);
        }

        Ok(None)
    }

    pub async fn request<S>(&mut self, _conn: &mut S) -> Result<ClientRequest, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        // Everything was read during the handshake.
        let command = match self.command {
            CMD_BIND => Command::Bind,
            _ => Command::Connect,
        };

        Ok(ClientRequest {
            command,
            dest: self.dest.clone().expect("handshake ran"),
            user: None,
        })
    }

    pub async fn relay<S>(self, mut conn: S, request: ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        match request.command {
            Command::Connect => self.relay_connect(&mut conn, &request).await,
            Command::Bind => self.relay_bind(&mut conn).await,
            Command::UdpAssociate => Err(ProxyError::MalformedRequest(
                "udp association is not a socks4 command".into(),
            )),
        }
    }

    async fn relay_connect<S>(&self, conn: &mut S, request: &ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        info!(client = %self.peer, target = %request.dest, userid = %self.userid, "socks4 connect");

        let upstream = match upstream::connect(&request.dest, None, &self.shared.policy).await {
            Ok(stream) => stream,
            Err(e) => {
                self.reply(conn, REPLY_REJECTED).await?;
                return Err(e);
            }
        };

        self.reply(conn, REPLY_GRANTED).await?;

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
            self.reply(conn, REPLY_REJECTED).await?;
            return Err(ProxyError::FeatureDisabled("tcp bind"));
        };

        // The SOCKS4 reply can only carry an IPv4 address.
        let bind_ip = match bind_cfg.bind_addr() {
            BindAddr::Ip(std::net::IpAddr::V4(v4)) => v4,
            _ => {
                self.reply(conn, REPLY_REJECTED).await?;
                return Err(ProxyError::FeatureDisabled(
                    "socks4 bind on hostname or ipv6 endpoint",
                ));
            }
        };

        let lease = match self.shared.ports.acquire_tcp() {
            Ok(lease) => lease,
            Err(e) => {
                METRICS.port_exhausted();
                self.reply(conn, REPLY_REJECTED).await?;
                return Err(e);
            }
        };

        let listener = match TcpListener::bind((bind_ip, lease.port())).await {
            Ok(listener) => listener,
            Err(e) => {
                self.reply(conn, REPLY_REJECTED).await?;
                return Err(e.into());
            }
        };

        info!(client = %self.peer, bind = %bind_ip, port = lease.port(), "socks4 bind listening");
        write_reply(conn, REPLY_GRANTED, lease.port(), bind_ip).await?;

        let deadline = self.shared.config.server.timeout_duration();
        let (remote, remote_addr) = match timeout(deadline, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                write_reply(conn, REPLY_REJECTED, lease.port(), bind_ip).await?;
                return Err(e.into());
            }
            Err(_) => {
                METRICS.timeout();
                write_reply(conn, REPLY_REJECTED, lease.port(), bind_ip).await?;
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "bind accept deadline expired",
                )));
            }
        };
        drop(listener);

        let peer_v4 = match remote_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        debug!(client = %self.peer, remote = %remote_addr, "socks4 bind accepted");
        write_reply(conn, REPLY_GRANTED, remote_addr.port(), peer_v4).await?;

        relay::tcp::run(
            conn,
            remote,
            &self.shared.buffers,
            self.shared.config.server.timeout_duration(),
        )
        .await;

        Ok(())
    }

    /// Simple reply echoing the requested port; the address field carries
    /// the IPv4 literal when the client sent one, zeros for the 4a form.
    async fn reply<S>(&self, conn: &mut S, code: u8) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let port = self.dest.as_ref().map_or(0, |d| d.port());
        let ip = self.ip_literal.unwrap_or(Ipv4Addr::UNSPECIFIED);
        write_reply(conn, code, port, ip).await
    }
}

async fn write_reply<S>(conn: &mut S, code: u8, port: u16, ip: Ipv4Addr) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin + Send,
{
    let mut reply = [0u8; 8];
    reply[1] = code;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip.octets());
    conn.write_all(&reply).await?;
    conn.flush().await?;
    Ok(())
}

/// Read bytes up to a NUL, rejecting fields of `MAX_FIELD` bytes or more.
async fn read_nul_terminated<S>(conn: &mut S, field: &str) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let b = conn.read_u8().await?;
        if b == 0x00 {
            break;
        }
        bytes.push(b);
        if bytes.len() >= MAX_FIELD {
            return Err(ProxyError::MalformedRequest(format!(
                "socks4 {} exceeds {} bytes",
                field,
                MAX_FIELD - 1
            )));
        }
    }

    String::from_utf8(bytes)
        .map_err(|_| ProxyError::MalformedRequest(format!("socks4 {} is not utf-8", field)))
}

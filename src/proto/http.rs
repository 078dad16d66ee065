//! HTTP handler
//!
//! Two modes. CONNECT tunnels raw bytes after a `200 Connection
//! Established`. Forward mode accepts absolute-form requests
//! (`GET http://host/path HTTP/1.1`), rewrites the request line to
//! origin form, replays the headers upstream and then tunnels.
//! Authentication is Basic credentials in `Proxy-Authorization`;
//! header names compare case-insensitively.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;
use url::Url;

use crate::auth;
use crate::error::ProxyError;
use crate::metrics::METRICS;
use crate::proto::addr::Destination;
use crate::proto::{ClientRequest, Command};
use crate::relay;
use crate::router::upstream;
use crate::server::Shared;

/// Longest accepted request or header line.
const MAX_LINE: usize = 8192;
/// Upper bound on header count.
const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Connect,
    Forward,
}

/// HTTP proxy state machine; entered with the first byte of the request
/// verb already consumed by the dispatcher.
pub struct HttpHandler {
    shared: Arc<Shared>,
    peer: SocketAddr,
    first: u8,

    mode: Mode,
    method: String,
    origin_target: String,
    headers: Vec<(String, String)>,
    dest: Option<Destination>,
    user: Option<String>,
}

impl HttpHandler {
    pub fn new(shared: Arc<Shared>, peer: SocketAddr, first: u8) -> Self {
        Self {
            shared,
            peer,
            first,
            mode: Mode::Connect,
            method: String::new(),
            origin_target: String::new(),
            headers: Vec::new(),
            dest: None,
            user: None,
        }
    }

    /// Read the request line and headers.
    pub async fn handshake<S>(&mut self, conn: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let rest = read_line_crlf(conn).await?;
        let line = format!("{}{}", self.first as char, rest);

        let mut parts = line.split_whitespace();
        let fields = (parts.next(), parts.next(), parts.next(), parts.next());
        let (Some(method), Some(target), Some(version), None) = fields else {
            return Err(ProxyError::MalformedRequest("bad request line".into()));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(ProxyError::MalformedRequest(format!(
                "unsupported version {:?}",
                version
            )));
        }
        self.method = method.to_string();

        if method == "CONNECT" {
            if !self.shared.config.server.allow_http_connect {
                return Err(ProxyError::FeatureDisabled("http connect"));
            }
            self.mode = Mode::Connect;
            self.dest = Some(parse_connect_target(target)?);
        } else {
            if !self.shared.config.server.allow_http_forward {
                self.respond(conn, "405 Method Not Allowed").await?;
                return Err(ProxyError::FeatureDisabled("http forward"));
            }
            self.mode = Mode::Forward;
            let (dest, origin) = parse_forward_target(target)?;
            self.dest = Some(dest);
            self.origin_target = origin;
        }

        loop {
            let line = read_line_crlf(conn).await?;
            if line.is_empty() {
                break;
            }
            if self.headers.len() >= MAX_HEADERS {
                return Err(ProxyError::MalformedRequest("too many headers".into()));
            }
            if let Some((name, value)) = line.split_once(':') {
                self.headers
                    .push((name.trim().to_string(), value.trim_start().to_string()));
            }
        }

        Ok(())
    }

    /// Basic credentials from `Proxy-Authorization`, if any.
    pub async fn authenticate<S>(&mut self, conn: &mut S) -> Result<Option<String>, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let credentials = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Proxy-Authorization"))
            .map(|(_, value)| value.clone());

        let Some(value) = credentials else {
            if self.shared.config.server.allow_anonymous {
                return Ok(None);
            }
            self.respond_with_header(
                conn,
                "407 Proxy Authentication Required",
                "Proxy-Authenticate: Basic",
            )
            .await?;
            return Err(ProxyError::AuthRequired);
        };

        let Some((username, password)) = decode_basic(&value) else {
            self.respond(conn, "403 Forbidden").await?;
            METRICS.auth_rejected();
            return Err(ProxyError::AuthFailed);
        };

        if auth::check_all(&self.shared.auth, &username, &password) {
            METRICS.auth_ok();
            self.user = Some(username.clone());
            return Ok(Some(username));
        }

        self.respond(conn, "403 Forbidden").await?;
        METRICS.auth_rejected();
        Err(ProxyError::AuthFailed)
    }

    pub async fn request<S>(&mut self, _conn: &mut S) -> Result<ClientRequest, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        // Parsed during the handshake; HTTP only ever tunnels.
        Ok(ClientRequest {
            command: Command::Connect,
            dest: self.dest.clone().expect("handshake ran"),
            user: self.user.clone(),
        })
    }

    pub async fn relay<S>(self, mut conn: S, request: ClientRequest) -> Result<(), ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        info!(
            client = %self.peer,
            method = %self.method,
            target = %request.dest,
            "http session"
        );

        let mut remote = match upstream::connect(
            &request.dest,
            request.user.as_deref(),
            &self.shared.policy,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let status = match &e {
                    ProxyError::SubnetBlocked(_) => "403 Forbidden",
                    _ => "503 Service Unavailable",
                };
                self.respond(&mut conn, status).await?;
                return Err(e);
            }
        };

        match self.mode {
            Mode::Connect => {
                self.respond(&mut conn, "200 Connection Established").await?;
            }
            Mode::Forward => {
                // Replay the request upstream in origin form, dropping
                // the proxy-level headers.
                let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.origin_target);
                for (name, value) in &self.headers {
                    if name.eq_ignore_ascii_case("Proxy-Authorization")
                        || name.eq_ignore_ascii_case("Proxy-Connection")
                    {
                        continue;
                    }
                    head.push_str(name);
                    head.push_str(": ");
                    head.push_str(value);
                    head.push_str("\r\n");
                }
                head.push_str("\r\n");
                remote.write_all(head.as_bytes()).await?;
            }
        }

        relay::tcp::run(
            conn,
            remote,
            &self.shared.buffers,
            self.shared.config.server.timeout_duration(),
        )
        .await;

        Ok(())
    }

    async fn respond<S>(&self, conn: &mut S, status: &str) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let response = format!(
            "HTTP/1.1 {}\r\nProxy-Agent: {}\r\n\r\n",
            status, self.shared.config.server.proxy_agent
        );
        conn.write_all(response.as_bytes()).await?;
        conn.flush().await?;
        Ok(())
    }

    async fn respond_with_header<S>(
        &self,
        conn: &mut S,
        status: &str,
        header: &str,
    ) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let response = format!(
            "HTTP/1.1 {}\r\n{}\r\nProxy-Agent: {}\r\n\r\n",
            status, header, self.shared.config.server.proxy_agent
        );
        conn.write_all(response.as_bytes()).await?;
        conn.flush().await?;
        Ok(())
    }
}

/// Read one line, requiring every `\r` to be followed by `\n`.
async fn read_line_crlf<S>(conn: &mut S) -> Result<String, ProxyError>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let b = conn.read_u8().await?;
        if b == b'\r' {
            break;
        }
        line.push(b);
        if line.len() > MAX_LINE {
            return Err(ProxyError::MalformedRequest("line too long".into()));
        }
    }

    let lf = conn.read_u8().await?;
    if lf != b'\n' {
        return Err(ProxyError::MalformedRequest(
            "carriage return not followed by line feed".into(),
        ));
    }

    String::from_utf8(line)
        .map_err(|_| ProxyError::MalformedRequest("request line is not utf-8".into()))
}

/// `host:port`, with square brackets around IPv6 literals.
fn parse_connect_target(target: &str) -> Result<Destination, ProxyError> {
    let bad = || ProxyError::MalformedRequest(format!("bad connect target {:?}", target));

    if let Some(rest) = target.strip_prefix('[') {
        let (host, port_part) = rest.split_once(']').ok_or_else(bad)?;
        let port_str = port_part.strip_prefix(':').ok_or_else(bad)?;
        let port: u16 = port_str.parse().map_err(|_| bad())?;
        let addr = host.parse().map_err(|_| bad())?;
        return Ok(Destination::Ipv6(addr, port));
    }

    let (host, port_str) = target.rsplit_once(':').ok_or_else(bad)?;
    let port: u16 = port_str.parse().map_err(|_| bad())?;
    if host.is_empty() {
        return Err(bad());
    }

    Ok(match host.parse() {
        Ok(ip) => Destination::Ipv4(ip, port),
        Err(_) => Destination::Domain(host.to_string(), port),
    })
}

/// Absolute-form request target; returns the destination and the
/// origin-form path to put back on the rewritten request line.
fn parse_forward_target(target: &str) -> Result<(Destination, String), ProxyError> {
    let url = Url::parse(target)
        .map_err(|e| ProxyError::MalformedRequest(format!("bad request target: {}", e)))?;

    if url.scheme() != "http" {
        return Err(ProxyError::MalformedRequest(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::MalformedRequest("request target has no host".into()))?;
    let port = url.port().unwrap_or(80);

    let dest = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => Destination::Ipv6(
            v6.parse()
                .map_err(|_| ProxyError::MalformedRequest("bad ipv6 host".into()))?,
            port,
        ),
        None => match host.parse() {
            Ok(ip) => Destination::Ipv4(ip, port),
            Err(_) => Destination::Domain(host.to_string(), port),
        },
    };

    let mut origin = url.path().to_string();
    if origin.is_empty() {
        origin.push('/');
    }
    if let Some(query) = url.query() {
        origin.push('?');
        origin.push_str(query);
    }

    Ok((dest, origin))
}

/// Decode a `Basic <base64(user:pass)>` credential value.
fn decode_basic(value: &str) -> Option<(String, String)> {
    let value = value.trim();
    let encoded = match value.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("basic ") => value[6..].trim(),
        _ => return None,
    };

    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_line_requires_lf_after_cr() {
        let mut good = BufReader::new(Cursor::new(b"hello\r\nrest".to_vec()));
        assert_eq!(read_line_crlf(&mut good).await.unwrap(), "hello");

        let mut bad = BufReader::new(Cursor::new(b"hello\rX".to_vec()));
        assert!(matches!(
            read_line_crlf(&mut bad).await,
            Err(ProxyError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_parse_connect_target() {
        assert_eq!(
            parse_connect_target("example.com:443").unwrap(),
            Destination::Domain("example.com".into(), 443)
        );
        assert_eq!(
            parse_connect_target("192.168.1.1:8080").unwrap(),
            Destination::Ipv4("192.168.1.1".parse().unwrap(), 8080)
        );
        assert_eq!(
            parse_connect_target("[::1]:443").unwrap(),
            Destination::Ipv6("::1".parse().unwrap(), 443)
        );
        assert!(parse_connect_target("no-port").is_err());
        assert!(parse_connect_target(":443").is_err());
    }

    #[test]
    fn test_parse_forward_target() {
        let (dest, origin) = parse_forward_target("http://example.com/a/b?q=1").unwrap();
        assert_eq!(dest, Destination::Domain("example.com".into(), 80));
        assert_eq!(origin, "/a/b?q=1");

        let (dest, origin) = parse_forward_target("http://example.com:8080").unwrap();
        assert_eq!(dest, Destination::Domain("example.com".into(), 8080));
        assert_eq!(origin, "/");

        assert!(parse_forward_target("https://example.com/").is_err());
        assert!(parse_forward_target("not a url").is_err());
    }

    #[test]
    fn test_decode_basic() {
        // base64("user:pass")
        assert_eq!(
            decode_basic("Basic dXNlcjpwYXNz"),
            Some(("user".into(), "pass".into()))
        );
        // scheme compares case-insensitively
        assert_eq!(
            decode_basic("basic dXNlcjpwYXNz"),
            Some(("user".into(), "pass".into()))
        );
        assert_eq!(decode_basic("Bearer token"), None);
        assert_eq!(decode_basic("Basic ???"), None);
        // password may contain a colon
        assert_eq!(
            decode_basic(&format!("Basic {}", BASE64.encode("u:p:q"))),
            Some(("u".into(), "p:q".into()))
        );
    }
}

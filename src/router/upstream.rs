//! Upstream connector
//!
//! Turns a [`Destination`] into a live TCP connection. Domain names are
//! resolved once and every returned address is tried in order; candidates
//! outside the remote subnet policy are skipped, not errored.

use std::net::{IpAddr, SocketAddr};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::error::ProxyError;
use crate::proto::addr::Destination;
use crate::router::policy::SubnetPolicy;

/// Open a TCP connection to the destination, honoring the remote policy.
pub async fn connect(
    dest: &Destination,
    user: Option<&str>,
    policy: &SubnetPolicy,
) -> Result<TcpStream, ProxyError> {
    match dest {
        Destination::Ipv4(addr, port) => dial(IpAddr::V4(*addr), *port, user, policy).await,
        Destination::Ipv6(addr, port) => dial(IpAddr::V6(*addr), *port, user, policy).await,
        Destination::Domain(name, port) => {
            let candidates = lookup_host((name.as_str(), *port))
                .await
                .map_err(|e| ProxyError::HostUnreachable(format!("{}: {}", name, e)))?;

            let mut any_candidate = false;
            for addr in candidates {
                any_candidate = true;
                if !policy.remote_allowed(user, addr.ip()) {
                    debug!(%addr, "skipping resolved address outside remote policy");
                    continue;
                }

                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!(%addr, error = %e, "upstream candidate failed");
                    }
                }
            }

            let reason = if any_candidate {
                format!("{}:{}: no resolved address reachable", name, port)
            } else {
                format!("{}:{}: name resolved to nothing", name, port)
            };
            Err(ProxyError::HostUnreachable(reason))
        }
    }
}

async fn dial(
    ip: IpAddr,
    port: u16,
    user: Option<&str>,
    policy: &SubnetPolicy,
) -> Result<TcpStream, ProxyError> {
    if !policy.remote_allowed(user, ip) {
        return Err(ProxyError::SubnetBlocked(ip));
    }

    let addr = SocketAddr::new(ip, port);
    TcpStream::connect(addr)
        .await
        .map_err(|e| ProxyError::HostUnreachable(format!("{}: {}", addr, e)))
}

//! Proxy listener
//!
//! Binds the client-facing TCP endpoint (optionally TLS-wrapped), runs
//! the accept loop and spawns one task per connection. Shutdown stops
//! accepting; in-flight sessions finish on their own deadlines.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::config::{Config, TlsConfig};
use crate::pool::{BufferPool, PortPools};
use crate::router::SubnetPolicy;
use crate::util;

use super::acceptor;
use super::Shared;

/// Relay buffers kept warm; sessions beyond this allocate on demand.
const BUFFER_POOL_COUNT: usize = 256;

/// The proxy server.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        config.validate()?;

        let auth = auth::from_config(&config)?;
        if !config.server.allow_anonymous && auth.is_empty() {
            warn!("anonymous access disabled and no authenticators configured; every client will be rejected");
        }

        let policy = SubnetPolicy::from_config(&config.subnets)?;

        let ports = PortPools::new(
            config
                .tcp_bind
                .as_ref()
                .map(|b| (b.ports_start, b.ports_end)),
            config
                .udp_associate
                .as_ref()
                .map(|b| (b.ports_start, b.ports_end)),
        );

        let buffers = BufferPool::new(BUFFER_POOL_COUNT, config.server.buffer);
        debug!(
            count = BUFFER_POOL_COUNT,
            size = config.server.buffer,
            "relay buffer pool initialized"
        );

        let tls = match &config.tls {
            Some(tls_config) => Some(build_tls_acceptor(tls_config).await?),
            None => None,
        };

        let socket = util::create_tcp_listener(config.server.bind)
            .with_context(|| format!("Failed to bind listener to {}", config.server.bind))?;
        let listener = TcpListener::from_std(socket)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            auth,
            policy,
            ports,
            buffers,
        });

        Ok(Self {
            listener,
            tls,
            shared,
            shutdown_rx,
            shutdown_tx,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the server (main accept loop)
    pub async fn run(&self) -> Result<()> {
        let config = &self.shared.config.server;
        info!(
            bind = %config.bind,
            tls = self.tls.is_some(),
            anonymous = config.allow_anonymous,
            http_connect = config.allow_http_connect,
            tcp_bind = config.allow_tcp_bind,
            udp_association = config.allow_udp_association,
            "proxy server accepting connections"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let tls = self.tls.clone();
                            let shared = self.shared.clone();

                            tokio::spawn(async move {
                                if let Err(e) = acceptor::handle(stream, peer, tls, shared).await {
                                    if e.is_client_fault() {
                                        debug!(client = %peer, error = %e, "session error");
                                    } else {
                                        warn!(client = %peer, error = %e, "session error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop accepting new connections. In-flight sessions keep running
    /// until their own deadlines or peers end them.
    pub async fn shutdown(&self) {
        info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(true);
    }
}

/// Build the TLS acceptor for the client listener (TLS 1.2 minimum).
async fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let (certs, key) = load_or_generate_certs(config).await?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Load certificates from files or generate self-signed
async fn load_or_generate_certs(
    config: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = std::path::Path::new(&config.public_key);
    let key_path = std::path::Path::new(&config.private_key);

    if cert_path.exists() && key_path.exists() {
        info!(cert = %config.public_key, key = %config.private_key, "Loading TLS certificates");

        let cert_pem = tokio::fs::read(&config.public_key)
            .await
            .context("Failed to read certificate file")?;
        let key_pem = tokio::fs::read(&config.private_key)
            .await
            .context("Failed to read key file")?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificates")?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found in file"))?;

        Ok((certs, key))
    } else if config.auto_generate {
        warn!("Generating self-signed certificate (not for production use)");

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("Failed to generate self-signed certificate")?;

        let cert_der = CertificateDer::from(cert.cert);
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        Ok((vec![cert_der], key_der))
    } else {
        anyhow::bail!(
            "TLS certificate not found at {} and auto_generate is disabled",
            config.public_key
        )
    }
}

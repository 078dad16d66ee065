//! Configuration management
//!
//! Handles loading and validating server configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub tcp_bind: Option<BindConfig>,
    #[serde(default)]
    pub udp_associate: Option<BindConfig>,
    #[serde(default)]
    pub subnets: SubnetsConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the client listener
    pub bind: SocketAddr,
    /// Per-read idle deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// TCP relay read buffer size in bytes
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// Number of worker threads (0 = auto)
    #[serde(default)]
    pub workers: usize,
    /// Admit clients that offer no credentials
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Enable the HTTP CONNECT handler
    #[serde(default)]
    pub allow_http_connect: bool,
    /// Enable HTTP absolute-URI forward requests
    #[serde(default)]
    pub allow_http_forward: bool,
    /// Enable the SOCKS BIND command
    #[serde(default)]
    pub allow_tcp_bind: bool,
    /// Enable the SOCKS5 UDP ASSOCIATE command
    #[serde(default)]
    pub allow_udp_association: bool,
    /// Name sent in the HTTP Proxy-Agent header
    #[serde(default = "default_proxy_agent")]
    pub proxy_agent: String,
}

impl ServerConfig {
    /// Get effective worker count (auto-detect if 0)
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Per-read idle deadline as a Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// TLS listener configuration; presence of the section enables TLS
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM)
    pub public_key: String,
    /// Path to private key file (PEM)
    pub private_key: String,
    /// Auto-generate self-signed cert if files are missing
    #[serde(default)]
    pub auto_generate: bool,
}

/// Endpoint and port range for BIND / UDP ASSOCIATE allocations
#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    /// Externally visible address; IP literal or hostname
    pub addr: String,
    pub ports_start: u16,
    pub ports_end: u16,
}

/// The address a BIND/ASSOCIATE reply advertises; the reply ATYP follows
/// this form (domain ATYP when configured as a hostname).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    Ip(IpAddr),
    Hostname(String),
}

impl BindConfig {
    pub fn bind_addr(&self) -> BindAddr {
        match self.addr.parse::<IpAddr>() {
            Ok(ip) => BindAddr::Ip(ip),
            Err(_) => BindAddr::Hostname(self.addr.clone()),
        }
    }
}

/// CIDR policy configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubnetsConfig {
    /// Client source subnets admitted (empty = no allow-side restriction)
    #[serde(default)]
    pub allow: Vec<String>,
    /// Client source subnets rejected
    #[serde(default)]
    pub deny: Vec<String>,
    /// Upstream destination subnets admitted
    #[serde(default)]
    pub allow_remote: Vec<String>,
    /// Authenticated users bypass subnet checks
    #[serde(default)]
    pub user_will_ignore: bool,
}

/// Flat-file authenticator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Path to a user:passwordhash file
    pub users_file: String,
    /// Hash method applied to presented passwords: "plain" or "sha256"
    #[serde(default = "default_hash_method")]
    pub hash: String,
    /// Seconds a verified credential stays cached (0 = no cache)
    #[serde(default)]
    pub cache_timeout: u64,
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_timeout() -> u64 { 60 }
fn default_buffer() -> usize { 16384 }
fn default_proxy_agent() -> String { "trident".to_string() }
fn default_hash_method() -> String { "plain".to_string() }
fn default_metrics_addr() -> SocketAddr { "127.0.0.1:9090".parse().unwrap() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.timeout == 0 {
            anyhow::bail!("server.timeout must be > 0");
        }
        if self.server.buffer == 0 {
            anyhow::bail!("server.buffer must be > 0");
        }
        if self.server.allow_tcp_bind {
            let bind = self
                .tcp_bind
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("allow_tcp_bind requires a [tcp_bind] section"))?;
            if bind.ports_start > bind.ports_end {
                anyhow::bail!("tcp_bind.ports_start must be <= tcp_bind.ports_end");
            }
        }
        if self.server.allow_udp_association {
            let assoc = self.udp_associate.as_ref().ok_or_else(|| {
                anyhow::anyhow!("allow_udp_association requires a [udp_associate] section")
            })?;
            if assoc.ports_start > assoc.ports_end {
                anyhow::bail!("udp_associate.ports_start must be <= udp_associate.ports_end");
            }
        }
        if let Some(auth) = &self.auth {
            match auth.hash.as_str() {
                "plain" | "sha256" => {}
                other => anyhow::bail!("auth.hash must be \"plain\" or \"sha256\", got {:?}", other),
            }
        }
        if !self.server.allow_anonymous && self.auth.is_none() {
            anyhow::bail!("allow_anonymous = false requires an [auth] section");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:1080"
            allow_anonymous = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.server.timeout, 60);
        assert_eq!(config.server.buffer, 16384);
        assert!(!config.server.allow_tcp_bind);
        assert!(config.tls.is_none());
        assert!(config.validate().is_ok());
        assert!(config.server.effective_workers() > 0);
    }

    #[test]
    fn test_bind_requires_section() {
        let mut config = minimal();
        config.server.allow_tcp_bind = true;
        assert!(config.validate().is_err());

        config.tcp_bind = Some(BindConfig {
            addr: "127.0.0.1".into(),
            ports_start: 40000,
            ports_end: 40100,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut config = minimal();
        config.server.allow_udp_association = true;
        config.udp_associate = Some(BindConfig {
            addr: "127.0.0.1".into(),
            ports_start: 50100,
            ports_end: 50000,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addr_forms() {
        let ip = BindConfig {
            addr: "203.0.113.9".into(),
            ports_start: 1,
            ports_end: 2,
        };
        assert_eq!(ip.bind_addr(), BindAddr::Ip("203.0.113.9".parse().unwrap()));

        let host = BindConfig {
            addr: "proxy.example.com".into(),
            ports_start: 1,
            ports_end: 2,
        };
        assert_eq!(host.bind_addr(), BindAddr::Hostname("proxy.example.com".into()));
    }

    #[test]
    fn test_anonymous_off_requires_auth() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:1080"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

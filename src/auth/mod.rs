//! Authentication
//!
//! The handlers consume a list of authenticators; the first one to accept
//! a credential pair wins. The list is built at startup and shared
//! read-only across connections.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::error::ProxyError;

mod plain;

pub use plain::{HashMethod, PlainFileAuth};

/// A credential checker.
pub trait Authenticator: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Verify a username/password pair. `Ok(false)` means rejected;
    /// `Err` means the backend itself failed.
    fn check(&self, username: &str, password: &str) -> Result<bool, ProxyError>;
}

/// Build the configured authenticator list.
pub fn from_config(config: &Config) -> Result<Vec<Box<dyn Authenticator>>> {
    let mut methods: Vec<Box<dyn Authenticator>> = Vec::new();

    if let Some(auth) = &config.auth {
        let hasher = HashMethod::parse(&auth.hash)?;
        let backend = PlainFileAuth::load(Path::new(&auth.users_file), hasher, auth.cache_timeout)?;
        tracing::info!(
            backend = backend.name(),
            users = backend.user_count(),
            "authenticator loaded"
        );
        methods.push(Box::new(backend));
    }

    Ok(methods)
}

/// Run a credential pair through the authenticator list.
///
/// Backend errors are logged and treated as a rejection from that
/// backend so a broken store cannot grant access.
pub fn check_all(
    methods: &[Box<dyn Authenticator>],
    username: &str,
    password: &str,
) -> bool {
    for method in methods {
        match method.check(username, password) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(backend = method.name(), error = %e, "authenticator error");
            }
        }
    }

    false
}

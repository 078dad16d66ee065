//! Subnet policy
//!
//! CIDR allow/deny checks for client source addresses and upstream
//! destinations. An allow set with at least one entry admits only
//! covered addresses; an empty allow set imposes no restriction. Deny
//! sets always apply. Authenticated users may bypass every check.

use anyhow::{Context, Result};
use ipnet::IpNet;
use std::net::IpAddr;

use crate::config::SubnetsConfig;
use crate::error::ProxyError;

/// An ordered list of CIDR prefixes.
#[derive(Debug, Default)]
pub struct SubnetSet {
    subnets: Vec<IpNet>,
}

impl SubnetSet {
    pub fn load(subnets: &[String]) -> Result<Self> {
        let subnets = subnets
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .with_context(|| format!("invalid CIDR prefix {:?}", s))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { subnets })
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> Option<&IpNet> {
        self.subnets.iter().find(|net| net.contains(&ip))
    }
}

/// The server-wide subnet policy, built once at startup.
#[derive(Debug)]
pub struct SubnetPolicy {
    allow: SubnetSet,
    deny: SubnetSet,
    allow_remote: SubnetSet,
    user_will_ignore: bool,
}

impl SubnetPolicy {
    pub fn from_config(config: &SubnetsConfig) -> Result<Self> {
        Ok(Self {
            allow: SubnetSet::load(&config.allow)?,
            deny: SubnetSet::load(&config.deny)?,
            allow_remote: SubnetSet::load(&config.allow_remote)?,
            user_will_ignore: config.user_will_ignore,
        })
    }

    /// Check a client source address after authentication.
    pub fn check_source(&self, user: Option<&str>, ip: IpAddr) -> Result<(), ProxyError> {
        if self.allow.is_empty() && self.deny.is_empty() {
            return Ok(());
        }
        if self.user_will_ignore && user.is_some() {
            return Ok(());
        }

        if !self.allow.is_empty() && self.allow.contains(ip).is_none() {
            return Err(ProxyError::SubnetBlocked(ip));
        }
        if let Some(subnet) = self.deny.contains(ip) {
            tracing::debug!(%ip, %subnet, "source in denied subnet");
            return Err(ProxyError::SubnetBlocked(ip));
        }

        Ok(())
    }

    /// Whether an upstream candidate address may be dialed.
    ///
    /// Disallowed candidates are skipped rather than errored, so one
    /// acceptable address in a resolved set can still succeed.
    pub fn remote_allowed(&self, user: Option<&str>, ip: IpAddr) -> bool {
        if self.user_will_ignore && user.is_some() {
            return true;
        }
        if self.allow_remote.is_empty() {
            return true;
        }

        self.allow_remote.contains(ip).is_some()
    }
}

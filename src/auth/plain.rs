//! Flat-file credential backend
//!
//! Loads `user:passwordhash` lines once at startup. Presented passwords
//! are hashed with the configured method and compared; verified
//! credentials can be cached for a configured interval so repeated
//! connections skip the digest.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use super::Authenticator;
use crate::error::ProxyError;

/// Password hashing methods for the users file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Plain,
    Sha256,
}

impl HashMethod {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "plain" => Ok(HashMethod::Plain),
            "sha256" => Ok(HashMethod::Sha256),
            other => anyhow::bail!("unknown hash method {:?}", other),
        }
    }

    fn digest(&self, password: &str) -> String {
        match self {
            HashMethod::Plain => password.to_string(),
            HashMethod::Sha256 => {
                let digest = ring::digest::digest(&ring::digest::SHA256, password.as_bytes());
                hex::encode(digest.as_ref())
            }
        }
    }
}

/// Flat-file authenticator with an optional verification cache.
pub struct PlainFileAuth {
    users: HashMap<String, String>,
    hasher: HashMethod,
    cache: Option<VerifyCache>,
}

struct VerifyCache {
    entries: DashMap<String, (String, Instant)>,
    ttl: Duration,
}

impl VerifyCache {
    fn hit(&self, username: &str, digest: &str) -> bool {
        match self.entries.get(username) {
            Some(entry) => {
                let (cached, at) = entry.value();
                cached == digest && at.elapsed() < self.ttl
            }
            None => false,
        }
    }

    fn store(&self, username: &str, digest: &str) {
        self.entries
            .insert(username.to_string(), (digest.to_string(), Instant::now()));
        // Drop expired entries opportunistically.
        self.entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
    }
}

impl PlainFileAuth {
    pub fn load(path: &Path, hasher: HashMethod, cache_timeout: u64) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read users file {:?}", path))?;

        let mut users = HashMap::new();
        for line in data.lines() {
            if let Some((name, hash)) = line.split_once(':') {
                if !name.is_empty() && !hash.is_empty() {
                    users.insert(name.to_string(), hash.to_string());
                }
            }
        }

        let cache = (cache_timeout > 0).then(|| VerifyCache {
            entries: DashMap::new(),
            ttl: Duration::from_secs(cache_timeout),
        });

        Ok(Self {
            users,
            hasher,
            cache,
        })
    }

    #[cfg(test)]
    fn from_entries(entries: &[(&str, &str)], hasher: HashMethod, cache_timeout: u64) -> Self {
        Self {
            users: entries
                .iter()
                .map(|(u, h)| (u.to_string(), h.to_string()))
                .collect(),
            hasher,
            cache: (cache_timeout > 0).then(|| VerifyCache {
                entries: DashMap::new(),
                ttl: Duration::from_secs(cache_timeout),
            }),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Authenticator for PlainFileAuth {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn check(&self, username: &str, password: &str) -> Result<bool, ProxyError> {
        let Some(stored) = self.users.get(username) else {
            return Ok(false);
        };

        let digest = self.hasher.digest(password);
        if let Some(cache) = &self.cache {
            if cache.hit(username, &digest) {
                return Ok(true);
            }
        }

        if stored == &digest {
            if let Some(cache) = &self.cache {
                cache.store(username, &digest);
            }
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_check() {
        let auth = PlainFileAuth::from_entries(&[("user", "pass")], HashMethod::Plain, 0);
        assert!(auth.check("user", "pass").unwrap());
        assert!(!auth.check("user", "wrong").unwrap());
        assert!(!auth.check("nobody", "pass").unwrap());
    }

    #[test]
    fn test_sha256_check() {
        // sha256("pass")
        let hash = "d74ff0ee8da3b9806b18c877dbf29bbde50b5bd8e4dad7a3a725000feb82e8f1";
        let auth = PlainFileAuth::from_entries(&[("user", hash)], HashMethod::Sha256, 0);
        assert!(auth.check("user", "pass").unwrap());
        assert!(!auth.check("user", "Pass").unwrap());
    }

    #[test]
    fn test_cache_remembers_success() {
        let auth = PlainFileAuth::from_entries(&[("user", "pass")], HashMethod::Plain, 300);
        assert!(auth.check("user", "pass").unwrap());
        assert!(auth.cache.as_ref().unwrap().hit("user", "pass"));
        // A wrong password must not hit the cached entry.
        assert!(!auth.check("user", "other").unwrap());
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join("trident-auth-test-users");
        std::fs::write(&path, "alice:secret\n\nmissing-colon\n:nopass\nbob:hunter2\n").unwrap();

        let auth = PlainFileAuth::load(&path, HashMethod::Plain, 0).unwrap();
        assert_eq!(auth.user_count(), 2);
        assert!(auth.check("alice", "secret").unwrap());
        assert!(auth.check("bob", "hunter2").unwrap());

        std::fs::remove_file(&path).ok();
    }
}

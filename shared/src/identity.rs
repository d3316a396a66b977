//! client identification: picking the caller's ip out of proxy headers and
//! turning it into a short, salted hash before it goes anywhere near storage.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// longest textual ipv6 address
pub const MAX_IP_LEN: usize = 45;

/// used when no store token is configured
const FALLBACK_PEPPER: &str = "default-salt";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no client address in request headers")]
    Missing,
    #[error("client address too long ({0} chars)")]
    TooLong(usize),
}

/// resolve the client address from, in order: first hop of
/// `X-Forwarded-For`, `X-Real-IP`, `CF-Connecting-IP`
pub fn client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    connecting_ip: Option<&str>,
) -> Result<String, IdentityError> {
    let first_hop = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let ip = first_hop
        .or_else(|| real_ip.map(str::trim).filter(|v| !v.is_empty()))
        .or_else(|| connecting_ip.map(str::trim).filter(|v| !v.is_empty()))
        .ok_or(IdentityError::Missing)?;

    if ip == "unknown" {
        return Err(IdentityError::Missing);
    }
    if ip.len() > MAX_IP_LEN {
        return Err(IdentityError::TooLong(ip.len()));
    }
    Ok(ip.to_string())
}

/// sha-256 of `ip + salt + pepper`, hex, first 16 chars.
///
/// the pepper is the first 10 chars of the store token so hashes are stable
/// per deployment but not reproducible without the secret.
pub fn hash_client(ip: &str, salt: &str, store_token: Option<&str>) -> String {
    let pepper: String = match store_token {
        Some(token) if !token.is_empty() => token.chars().take(10).collect(),
        _ => FALLBACK_PEPPER.to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(salt.as_bytes());
    hasher.update(pepper.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// raw addresses refused outright
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    ips: HashSet<String>,
}

impl BlockList {
    /// parses a comma separated list, ignoring blanks
    pub fn parse(raw: &str) -> Self {
        Self {
            ips: raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

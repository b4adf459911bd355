//! Abyss URLs: `abyss:<peer-hash>[:<addr>|<addr>...][/<path>]`.
//!
//! The authority is the hex peer hash of the host's public key, so a URL names a host
//! cryptographically. The optional address list tells a dialer where to find it; the path names a
//! world on that host.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::AbyssError;
use crate::identity::PeerId;

pub const SCHEME: &str = "abyss";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbyssUrl {
    pub peer: PeerId,
    pub addresses: Vec<SocketAddr>,
    /// Always starts with `/`; `/` alone for a bare host URL.
    pub path: String,
}

impl AbyssUrl {
    pub fn new(peer: PeerId, addresses: Vec<SocketAddr>) -> Self {
        Self {
            peer,
            addresses,
            path: "/".to_string(),
        }
    }

    /// Same host and addresses, different path.
    pub fn with_path(&self, path: &str) -> Self {
        Self {
            peer: self.peer,
            addresses: self.addresses.clone(),
            path: crate::path::normalize(path),
        }
    }

    pub fn peer_hash(&self) -> String {
        self.peer.to_hash()
    }
}

impl fmt::Display for AbyssUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SCHEME, self.peer)?;
        if !self.addresses.is_empty() {
            let addrs: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
            write!(f, ":{}", addrs.join("|"))?;
        }
        if self.path != "/" {
            f.write_str(&self.path)?;
        }
        Ok(())
    }
}

impl FromStr for AbyssUrl {
    type Err = AbyssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| AbyssError::InvalidArgument(format!("abyss url {s:?}: {why}"));

        let rest = s
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("expected abyss: scheme"))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        // Addresses never contain '/', so the first slash starts the path.
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (hash, addr_list) = match authority.find(':') {
            Some(i) => (&authority[..i], Some(&authority[i + 1..])),
            None => (authority, None),
        };
        let peer = hash
            .parse::<PeerId>()
            .map_err(|_| invalid("malformed peer hash"))?;
        let mut addresses = Vec::new();
        if let Some(list) = addr_list {
            for part in list.split('|').filter(|p| !p.is_empty()) {
                let addr = part
                    .parse::<SocketAddr>()
                    .map_err(|_| invalid("malformed address"))?;
                addresses.push(addr);
            }
        }
        Ok(Self {
            peer,
            addresses,
            path: crate::path::normalize(path),
        })
    }
}

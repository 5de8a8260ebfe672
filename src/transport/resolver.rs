/// Host name resolution for the named-host rendezvous.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};

/// Resolves a peer host name to an address
pub trait NameResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<IpAddr>;
}

/// Resolver backed by the operating system.
///
/// Handles `.local` names when the host runs an mDNS responder.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn resolve(&self, name: &str) -> Option<IpAddr> {
        let addrs: Vec<_> = (name, 0).to_socket_addrs().ok()?.collect();
        // IPv4 first; the rest of the link is IPv4-only
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
    }
}

/// Fixed name table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: impl Into<String>, addr: IpAddr) -> Self {
        self.entries.insert(name.into(), addr);
        self
    }
}

impl NameResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<IpAddr> {
        self.entries.get(name).copied()
    }
}

//! Hostname resolution with a short-lived cache.
//!
//! Entries are keyed by `(hostname, family)` and live for [`DNS_CACHE_TTL`].
//! Resolution goes through a hickory resolver when a fixed DNS server is
//! configured, otherwise through the system resolver.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;

use crate::error::{Error, Result};

/// How long a resolved address is reused.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Preferred address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddrFamily {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            AddrFamily::Any => true,
            AddrFamily::Ipv4 => ip.is_ipv4(),
            AddrFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Family selection: one value for every host, or a per-host callback.
#[derive(Clone)]
pub enum FamilyPolicy {
    Fixed(AddrFamily),
    PerHost(Arc<dyn Fn(&str) -> AddrFamily + Send + Sync>),
}

impl FamilyPolicy {
    pub fn for_host(&self, host: &str) -> AddrFamily {
        match self {
            FamilyPolicy::Fixed(family) => *family,
            FamilyPolicy::PerHost(f) => f(host),
        }
    }
}

impl Default for FamilyPolicy {
    fn default() -> Self {
        FamilyPolicy::Fixed(AddrFamily::Any)
    }
}

impl fmt::Debug for FamilyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyPolicy::Fixed(family) => f.debug_tuple("Fixed").field(family).finish(),
            FamilyPolicy::PerHost(_) => f.write_str("PerHost(..)"),
        }
    }
}

pub struct DnsCache {
    entries: DashMap<(String, AddrFamily), (IpAddr, Instant)>,
    resolver: Option<TokioResolver>,
    ttl: Duration,
}

impl DnsCache {
    /// Cache backed by the system resolver, or by `server` when given.
    pub fn new(server: Option<SocketAddr>) -> Self {
        let resolver = server.map(|server| {
            let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build()
        });
        Self {
            entries: DashMap::new(),
            resolver,
            ttl: DNS_CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cached address for `host`, if still fresh.
    pub fn cached(&self, host: &str, family: AddrFamily) -> Option<IpAddr> {
        let key = (host.to_string(), family);
        let entry = self.entries.get(&key)?;
        let (ip, at) = *entry;
        drop(entry);
        if at.elapsed() < self.ttl {
            Some(ip)
        } else {
            self.entries.remove(&key);
            None
        }
    }

    /// Resolve `host`, preferring `family` and falling back to any address.
    pub async fn lookup(&self, host: &str, family: AddrFamily) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(ip) = self.cached(host, family) {
            tracing::trace!("DNS cache hit: {} -> {}", host, ip);
            return Ok(ip);
        }

        let candidates = self.resolve_all(host).await?;
        let ip = candidates
            .iter()
            .find(|ip| family.matches(ip))
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| Error::Dns(format!("no addresses for {}", host)))?;

        tracing::debug!("DNS resolved {} -> {} ({:?})", host, ip, family);
        self.entries
            .insert((host.to_string(), family), (ip, Instant::now()));
        Ok(ip)
    }

    async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>> {
        match &self.resolver {
            Some(resolver) => {
                let lookup = resolver
                    .lookup_ip(host)
                    .await
                    .map_err(|e| Error::Dns(format!("{}: {}", host, e)))?;
                Ok(lookup.iter().collect())
            }
            None => {
                let addrs = tokio::net::lookup_host((host, 0))
                    .await
                    .map_err(|e| Error::Dns(format!("{}: {}", host, e)))?;
                Ok(addrs.map(|a| a.ip()).collect())
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCache")
            .field("entries", &self.entries.len())
            .field("custom_resolver", &self.resolver.is_some())
            .finish()
    }
}

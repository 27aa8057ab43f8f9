//! Destination host resolution with a process-wide cache.
//!
//! The cache is first-wins with no TTL: the first address a host resolves
//! to sticks for the lifetime of the process. That staleness is deliberate
//! (clients behind this gateway hammer a small set of hosts, and flapping
//! answers are exactly what a polluted resolver produces), but the cache is
//! bounded so a hostile client cannot grow it without limit.

use std::net::IpAddr;

use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

const CACHE_CAP: usize = 4096;

pub struct HostResolver {
    resolver: TokioAsyncResolver,
    cache: DashMap<String, Option<IpAddr>>,
}

impl HostResolver {
    pub fn new() -> Self {
        // Prefer the host's resolver configuration; fall back to public
        // recursors when there is none to read.
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self {
            resolver,
            cache: DashMap::new(),
        }
    }

    /// Resolve a host name to one address. Failures are cached too, so a
    /// dead name does not trigger a lookup per connection.
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Some(cached) = self.cache.get(host) {
            return *cached;
        }

        let resolved = match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next(),
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "resolution failed");
                None
            }
        };

        if self.cache.len() < CACHE_CAP {
            // First-wins: a concurrent resolver may have inserted already.
            self.cache.entry(host.to_string()).or_insert(resolved);
        }
        self.cache.get(host).map(|v| *v).unwrap_or(resolved)
    }

    pub fn cached(&self, host: &str) -> Option<Option<IpAddr>> {
        self.cache.get(host).map(|v| *v)
    }
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_the_resolver() {
        let r = HostResolver::new();
        assert_eq!(
            r.resolve("127.0.0.1").await,
            Some("127.0.0.1".parse().unwrap())
        );
        assert!(r.cached("127.0.0.1").is_none());
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let r = HostResolver::new();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        r.cache.insert("pinned.example".into(), Some(ip));
        assert_eq!(r.resolve("pinned.example").await, Some(ip));
    }
}

use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use trust_dns_resolver::TokioAsyncResolver;

/// Reverse (PTR) lookups for a client address.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// Returns the pointer-record hostnames for `ip` in the order the
    /// resolver reported them.
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Vec<String>>;
}

/// Resolver backed by the host's DNS configuration (`/etc/resolv.conf`).
#[derive(Clone)]
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self> {
        let inner =
            TokioAsyncResolver::tokio_from_system_conf().context("read system resolver config")?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl ReverseResolver for DnsResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Vec<String>> {
        let lookup = self
            .inner
            .reverse_lookup(ip)
            .await
            .with_context(|| format!("reverse lookup of {ip}"))?;

        // Fully-qualified form, trailing dot included.
        Ok(lookup.iter().map(|ptr| ptr.to_string()).collect())
    }
}

//! # Resolving device host names
//!
//! Devices on the local network are usually only reachable by their
//! multicast DNS name. Names are looked up via the system resolver first;
//! if that fails and the name is a bare host name or already in the
//! `.local` domain, an mDNS query for `<name>.local` is made.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mdns;

/// The domain served by multicast DNS.
pub const LOCAL_DOMAIN: &str = ".local";
/// How long to wait for an mDNS answer.
pub const MDNS_TIMEOUT: Duration = Duration::from_secs(3);

/// How names are resolved.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Send mDNS queries from this address.
    pub mdns_source: Option<Ipv4Addr>,
    /// Give up on mDNS after this long.
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mdns_source: None,
            timeout: MDNS_TIMEOUT,
        }
    }
}

/// A resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// The address.
    pub address: IpAddr,
    /// Whether it was found via multicast DNS.
    pub used_mdns: bool,
}

/// Unicast name resolution.
pub trait HostLookup {
    /// Look up `name`; `Ok(None)` means the name does not resolve.
    fn lookup(&self, name: &str) -> impl Future<Output = Result<Option<IpAddr>>>;
}

/// Multicast name resolution.
pub trait MulticastLookup {
    /// Query the `A` record of `name`, which already carries the `.local` suffix.
    fn query(
        &self,
        name: &str,
        source: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Ipv4Addr>>;
}

/// The system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    async fn lookup(&self, name: &str) -> Result<Option<IpAddr>> {
        match tokio::net::lookup_host((name, 0)).await {
            Ok(addrs) => {
                let addrs = addrs.map(|a| a.ip()).collect::<Vec<_>>();
                // Prefer IPv4 like gethostbyname
                let r = addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied();
                Ok(r)
            }
            Err(e) => {
                tracing::debug!("Resolving {name} failed: {e}");
                Ok(None)
            }
        }
    }
}

/// Queries on the local network.
#[derive(Debug, Default, Clone, Copy)]
pub struct MdnsLookup;

impl MulticastLookup for MdnsLookup {
    async fn query(
        &self,
        name: &str,
        source: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> Result<Ipv4Addr> {
        mdns::query_a(name, source, timeout).await
    }
}

/// Resolves host names with mDNS fallback.
#[derive(Debug, Clone)]
pub struct AddressResolver<D = SystemLookup, M = MdnsLookup> {
    config: ResolverConfig,
    dns: D,
    mdns: M,
}

impl AddressResolver {
    /// A resolver using the system resolver and real mDNS queries.
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_lookups(config, SystemLookup, MdnsLookup)
    }
}

impl<D: HostLookup, M: MulticastLookup> AddressResolver<D, M> {
    /// A resolver with the given lookup implementations.
    pub fn with_lookups(config: ResolverConfig, dns: D, mdns: M) -> Self {
        Self { config, dns, mdns }
    }

    /// Resolve `hostname`; literal addresses are returned unchanged.
    pub async fn resolve(&self, hostname: &str) -> Result<Resolved> {
        if let Ok(address) = hostname.parse::<IpAddr>() {
            return Ok(Resolved {
                address,
                used_mdns: false,
            });
        }
        if let Some(address) = self.dns.lookup(hostname).await? {
            return Ok(Resolved {
                address,
                used_mdns: false,
            });
        }
        if !hostname.ends_with(LOCAL_DOMAIN) && hostname.contains('.') {
            return Err(Error::Resolution(format!(
                "Resolving hostname \"{hostname}\" failed."
            )));
        }
        let mdns_name = if hostname.ends_with(LOCAL_DOMAIN) {
            hostname.to_owned()
        } else {
            format!("{hostname}{LOCAL_DOMAIN}")
        };
        let addr = self
            .mdns
            .query(&mdns_name, self.config.mdns_source, self.config.timeout)
            .await
            .map_err(|e| match e {
                Error::Resolution(_) => e,
                e => Error::Resolution(format!(
                    "Resolving hostname \"{mdns_name}\" using mDNS failed: {e}"
                )),
            })?;
        tracing::debug!("Resolved {mdns_name} to {addr} via mDNS");
        Ok(Resolved {
            address: IpAddr::V4(addr),
            used_mdns: true,
        })
    }
}

//! SIP-aware DNS resolution, NAPTR-skipped: literal IP and `.local`/
//! unqualified fast paths are handled directly; SRV→A/AAAA fallback is
//! delegated to `rsip-dns`, used the same way as
//! `registration.rs`'s `rsip_dns::Context::initialize_from` /
//! `Lookup::resolve_next` pattern. This module owns the caching layer and
//! the two fast paths on top of that.

use rsip_dns::trust_dns_resolver::TokioAsyncResolver;
use rsip_dns::ResolvableExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transaction::SipAddr;

const NEGATIVE_TTL: Duration = Duration::from_secs(10);
const SERVER_TIMEOUT: Duration = Duration::from_secs(1);
const SERVER_RETRIES: u32 = 1;

#[derive(Clone)]
enum CacheEntry {
    Positive(SipAddr, Instant),
    Negative(Instant),
}

impl CacheEntry {
    fn is_fresh(&self, positive_ttl: Duration) -> bool {
        match self {
            CacheEntry::Positive(_, at) => at.elapsed() < positive_ttl,
            CacheEntry::Negative(at) => at.elapsed() < NEGATIVE_TTL,
        }
    }
}

/// Process-wide (by convention — construct one `Resolver` and share it,
/// e.g. via `Arc`) SIP destination resolver with positive/negative caching.
pub struct Resolver {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    positive_ttl: Duration,
    prefer_ipv6: bool,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Resolver {
    pub fn new(prefer_ipv6: bool) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            positive_ttl: Duration::from_secs(30),
            prefer_ipv6,
        }
    }

    fn cache_key(uri: &rsip::Uri) -> String {
        uri.host_with_port.to_string()
    }

    /// Synchronous cache-only probe: returns `None` on a cache miss,
    /// `Some(Ok(addr))` on a live positive hit, `Some(Err(..))` on a live
    /// negative hit.
    pub fn probe_cached(&self, uri: &rsip::Uri) -> Option<Result<SipAddr>> {
        let key = Self::cache_key(uri);
        let cache = self.cache.read().unwrap();
        match cache.get(&key) {
            Some(entry) if entry.is_fresh(self.positive_ttl) => match entry {
                CacheEntry::Positive(addr, _) => Some(Ok(addr.clone())),
                CacheEntry::Negative(_) => Some(Err(Error::DnsResolutionError(format!(
                    "unresolvable destination `{}` (cached)",
                    key
                )))),
            },
            _ => None,
        }
    }

    fn store_positive(&self, uri: &rsip::Uri, addr: SipAddr) {
        self.cache
            .write()
            .unwrap()
            .insert(Self::cache_key(uri), CacheEntry::Positive(addr, Instant::now()));
    }

    fn store_negative(&self, uri: &rsip::Uri) {
        self.cache
            .write()
            .unwrap()
            .insert(Self::cache_key(uri), CacheEntry::Negative(Instant::now()));
    }

    /// Step 1: literal IP address in the host part.
    fn literal_ip_endpoint(uri: &rsip::Uri) -> Option<SipAddr> {
        let ip = match &uri.host_with_port.host {
            rsip::Host::IpAddr(ip) => *ip,
            rsip::Host::Domain(_) => return None,
        };
        let transport = default_transport(uri);
        let port = uri
            .host_with_port
            .port
            .clone()
            .map(|p| p.into())
            .unwrap_or_else(|| default_port(transport));
        Some(SipAddr::new(
            transport,
            rsip::HostWithPort {
                host: rsip::Host::IpAddr(ip),
                port: Some(port.into()),
            },
        ))
    }

    /// Step 2: unqualified host (no dot) or ending in `.local` — OS
    /// host-lookup only, no SRV/A fallback ordering.
    fn is_local_only(host: &str) -> bool {
        !host.contains('.') || host.ends_with(".local")
    }

    async fn os_lookup(&self, host: &str, transport: rsip::Transport, port: u16) -> Result<SipAddr> {
        let target = format!("{}:{}", host, port);
        match tokio::net::lookup_host(target).await {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.collect();
                let preferred = addrs.iter().find(|a| {
                    if self.prefer_ipv6 {
                        a.is_ipv6()
                    } else {
                        a.is_ipv4()
                    }
                });
                let chosen = preferred.or_else(|| addrs.first()).ok_or_else(|| {
                    Error::DnsResolutionError(format!("unresolvable destination `{}`", host))
                })?;
                Ok(SipAddr::new(
                    transport,
                    rsip::HostWithPort {
                        host: rsip::Host::IpAddr(chosen.ip()),
                        port: Some(chosen.port().into()),
                    },
                ))
            }
            Err(e) => {
                debug!("os host lookup failed for {}: {}", host, e);
                Err(Error::DnsResolutionError(format!(
                    "unresolvable destination `{}`",
                    host
                )))
            }
        }
    }

    /// SRV-then-A/AAAA resolution of `uri`, delegated to `rsip-dns`: SRV
    /// keyed by scheme/transport when no explicit port is present, otherwise
    /// a direct A/AAAA lookup.
    async fn dns_resolve(&self, uri: &rsip::Uri) -> Result<SipAddr> {
        let resolver = TokioAsyncResolver::tokio(Default::default(), Default::default())
            .map_err(|e| Error::DnsResolutionError(e.to_string()))?;
        let context = rsip_dns::Context::initialize_from(
            uri.clone(),
            rsip_dns::AsyncTrustDnsClient::new(resolver),
            rsip_dns::SupportedTransports::any(),
        )
        .map_err(|e| Error::DnsResolutionError(e.to_string()))?;

        let mut lookup = rsip_dns::Lookup::from(context);
        let mut last_err = None;
        for _ in 0..=SERVER_RETRIES {
            match tokio::time::timeout(SERVER_TIMEOUT, lookup.resolve_next()).await {
                Ok(Some(target)) => {
                    return Ok(SipAddr::new(target.transport, target.into()));
                }
                Ok(None) => {
                    last_err = Some("no SRV/A/AAAA records found".to_string());
                    break;
                }
                Err(_) => {
                    last_err = Some("DNS query timed out".to_string());
                    continue;
                }
            }
        }
        Err(Error::DnsResolutionError(format!(
            "unresolvable destination `{}`: {}",
            uri.host_with_port,
            last_err.unwrap_or_default()
        )))
    }

    /// The full resolution algorithm, cache-checked first.
    pub async fn resolve(&self, uri: &rsip::Uri) -> Result<SipAddr> {
        if let Some(cached) = self.probe_cached(uri) {
            return cached;
        }

        let host_str = uri.host_with_port.host.to_string();

        if let Some(endpoint) = Self::literal_ip_endpoint(uri) {
            self.store_positive(uri, endpoint.clone());
            return Ok(endpoint);
        }

        if Self::is_local_only(&host_str) {
            let transport = default_transport(uri);
            let port: u16 = uri
                .host_with_port
                .port
                .clone()
                .map(|p| p.into())
                .unwrap_or_else(|| default_port(transport));
            return match self.os_lookup(&host_str, transport, port).await {
                Ok(addr) => {
                    self.store_positive(uri, addr.clone());
                    Ok(addr)
                }
                Err(e) => {
                    self.store_negative(uri);
                    Err(e)
                }
            };
        }

        match self.dns_resolve(uri).await {
            Ok(addr) => {
                self.store_positive(uri, addr.clone());
                Ok(addr)
            }
            Err(e) => {
                warn!("resolution failed for {}: {}", uri, e);
                self.store_negative(uri);
                Err(e)
            }
        }
    }
}

fn default_transport(uri: &rsip::Uri) -> rsip::Transport {
    for param in &uri.params {
        if let rsip::Param::Transport(t) = param {
            if let Ok(transport) = t.clone().try_into() {
                return transport;
            }
        }
    }
    match uri.scheme {
        Some(rsip::Scheme::Sips) => rsip::Transport::Tls,
        Some(rsip::Scheme::Wss) => rsip::Transport::Wss,
        Some(rsip::Scheme::Ws) => rsip::Transport::Ws,
        _ => rsip::Transport::Udp,
    }
}

fn default_port(transport: rsip::Transport) -> u16 {
    match transport {
        rsip::Transport::Tls | rsip::Transport::Wss => 5061,
        _ => 5060,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_local_only_detects_unqualified_and_dotlocal() {
        assert!(Resolver::is_local_only("printer"));
        assert!(Resolver::is_local_only("printer.local"));
        assert!(!Resolver::is_local_only("sip.example.com"));
    }

    #[test]
    fn literal_ip_short_circuits() {
        let uri = rsip::Uri::try_from("sip:bob@192.0.2.10:5080").unwrap();
        let endpoint = Resolver::literal_ip_endpoint(&uri).expect("literal ip");
        assert_eq!(endpoint.host_with_port.port.unwrap(), 5080.into());
    }

    #[tokio::test]
    async fn probe_cached_is_a_miss_before_any_resolve() {
        let resolver = Resolver::new(false);
        let uri = rsip::Uri::try_from("sip:bob@example.net").unwrap();
        assert!(resolver.probe_cached(&uri).is_none());
    }

    #[tokio::test]
    async fn literal_ip_populates_cache_for_probe() {
        let resolver = Resolver::new(false);
        let uri = rsip::Uri::try_from("sip:bob@192.0.2.10").unwrap();
        let resolved = resolver.resolve(&uri).await.unwrap();
        let cached = resolver.probe_cached(&uri).unwrap().unwrap();
        assert_eq!(resolved, cached);
    }
}

use crate::target::CheckTarget;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};

/// Turns target hosts into addresses
#[derive(Clone)]
pub struct Resolver {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    /// Uses the system configuration, or the library defaults when it cannot
    /// be read
    #[must_use]
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            info!("system resolver configuration unavailable, using defaults: {e}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }

    /// Ask the name servers of `config` instead of the system ones
    #[must_use]
    pub fn with_config(config: ResolverConfig, options: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, options),
        }
    }

    /// Every address of the target host, empty when nothing resolves.
    ///
    /// `localhost` maps to the loopback interfaces, IP literals (brackets
    /// stripped) are returned as-is without a lookup.
    pub async fn resolve(&self, target: &CheckTarget) -> Vec<IpAddr> {
        let host = target.hostname();

        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }

        if host.eq_ignore_ascii_case("localhost") {
            return loopback_addresses();
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                debug!(host, "lookup failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Addresses of the loopback interfaces, both families
#[must_use]
pub fn loopback_addresses() -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = if_addrs::get_if_addrs()
        .map(|interfaces| {
            interfaces
                .into_iter()
                .filter(if_addrs::Interface::is_loopback)
                .map(|interface| interface.ip())
                .filter(IpAddr::is_loopback)
                .collect()
        })
        .unwrap_or_default();

    if addresses.is_empty() {
        addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];
    }

    addresses.sort();
    addresses.dedup();
    addresses
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use hickory_resolver::config::NameServerConfigGroup;

    #[tokio::test]
    async fn test_ip_literals_skip_dns() {
        let resolver = Resolver::new();

        let v4 = CheckTarget::parse("https://192.0.2.10:8443").unwrap();
        assert_eq!(
            resolver.resolve(&v4).await,
            vec!["192.0.2.10".parse::<IpAddr>().unwrap()]
        );

        let v6 = CheckTarget::parse("https://[2001:db8::1]").unwrap();
        assert_eq!(
            resolver.resolve(&v6).await,
            vec!["2001:db8::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_localhost_is_loopback() {
        let resolver = Resolver::new();
        let target = CheckTarget::parse("imaps://localhost").unwrap();

        let addresses = resolver.resolve(&target).await;
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(IpAddr::is_loopback));
    }

    #[test]
    fn test_loopback_addresses() {
        let addresses = loopback_addresses();
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(IpAddr::is_loopback));
    }

    #[tokio::test]
    #[ignore = "requires DNS resolution"]
    async fn test_resolve_public_host() {
        let resolver = Resolver::new();
        let target = CheckTarget::parse("https://example.com").unwrap();
        assert!(!resolver.resolve(&target).await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_empty() {
        let resolver = unreachable_resolver();
        let target = CheckTarget::parse("https://does-not-exist.invalid").unwrap();
        assert!(resolver.resolve(&target).await.is_empty());
    }

    #[tokio::test]
    async fn test_literals_bypass_configured_servers() {
        let resolver = unreachable_resolver();
        let target = CheckTarget::parse("smtp://192.0.2.25").unwrap();
        assert_eq!(
            resolver.resolve(&target).await,
            vec!["192.0.2.25".parse::<IpAddr>().unwrap()]
        );
    }

    /// Name server on a local port nobody answers
    fn unreachable_resolver() -> Resolver {
        let port = std::net::UdpSocket::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let servers = NameServerConfigGroup::from_ips_clear(
            &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port,
            true,
        );
        let mut options = ResolverOpts::default();
        options.timeout = std::time::Duration::from_millis(200);
        options.attempts = 1;
        Resolver::with_config(ResolverConfig::from_parts(None, vec![], servers), options)
    }
}

//! Name resolution seam.
//!
//! The cluster tender resolves seed hostnames through this trait so tests
//! can substitute a canned resolver and so deployments can plug in their own
//! resolver stack. Address literals short-circuit through the immediate
//! path; everything else goes through the async lookup.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

/// Resolves `(host, port)` pairs to socket addresses.
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    /// Synchronous lookup for hosts that are already address literals.
    /// Returns `None` when `host` needs real resolution.
    fn resolve_immediate(&self, host: &str, port: u16) -> Option<SocketAddr>;

    /// Full asynchronous lookup.
    ///
    /// # Errors
    ///
    /// Returns an error when the host cannot be resolved.
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system's lookup machinery.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    fn resolve_immediate(&self, host: &str, port: u16) -> Option<SocketAddr> {
        host.parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port))
    }

    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_parses_ipv4_literal() {
        let addr = SystemResolver.resolve_immediate("127.0.0.1", 3000);
        assert_eq!(addr, Some("127.0.0.1:3000".parse().unwrap()));
    }

    #[test]
    fn immediate_parses_ipv6_literal() {
        let addr = SystemResolver.resolve_immediate("::1", 3000);
        assert_eq!(addr, Some("[::1]:3000".parse().unwrap()));
    }

    #[test]
    fn immediate_rejects_hostname() {
        assert_eq!(SystemResolver.resolve_immediate("db1.internal", 3000), None);
    }

    #[tokio::test]
    async fn resolve_localhost() {
        let addrs = SystemResolver.resolve("localhost", 3000).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 3000));
    }
}

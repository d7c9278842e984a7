//! Runtime configuration (§3 "Runtime configuration"): an immutable value established
//! during the supervisor's bootstrap and shared read-only by the DNS and proxy
//! components. Nothing in here does I/O; `supervisor::bootstrap` is what populates it.

use std::net::SocketAddr;

pub const DEFAULT_INTERNAL_ZONE: &str = "run.internal.";
pub const DEFAULT_NDOTS: usize = 4;
pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 80;

/// The immutable configuration shared by the DNS hijack server and the reverse proxy
/// once bootstrap completes. `Arc<RuntimeConfig>` is handed to both.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub internal_zone: String,
    pub ndots: usize,
    pub upstream_nameserver: SocketAddr,
    pub current_region: String,
    pub project_hash: String,
    pub serve_ipv6: bool,
    pub dns_port: u16,
    pub http_proxy_port: u16,
    pub version: &'static str,
    /// Whether the supervisor detected it is running on the platform (§4.5 step 4).
    /// When `false`, the supervisor skips the DNS/proxy servers and the resolver
    /// mutation entirely, so that local development with the wrapper entrypoint is a
    /// no-op (§4.5 "Not on platform is handled gracefully").
    pub on_platform: bool,
}

impl RuntimeConfig {
    /// Build the canonical search-domain pair prepended to `/etc/resolv.conf` (§3):
    /// `{region}.{internal_zone} {internal_zone}`.
    pub fn search_domains(&self) -> [String; 2] {
        [
            format!("{}.{}", self.current_region, self.internal_zone),
            self.internal_zone.clone(),
        ]
    }

    pub fn dns_bind_v4(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), self.dns_port)
    }

    pub fn dns_bind_v6(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), self.dns_port)
    }

    pub fn proxy_bind_v4(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), self.http_proxy_port)
    }

    pub fn proxy_bind_v6(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), self.http_proxy_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuntimeConfig {
        RuntimeConfig {
            internal_zone: "run.internal.".to_string(),
            ndots: 4,
            upstream_nameserver: "8.8.8.8:53".parse().unwrap(),
            current_region: "us-central1".to_string(),
            project_hash: "dpyb4duzqq".to_string(),
            serve_ipv6: true,
            dns_port: 53,
            http_proxy_port: 80,
            version: "test",
            on_platform: true,
        }
    }

    #[test]
    fn search_domains_prepend_region_then_zone() {
        let cfg = sample();
        assert_eq!(
            cfg.search_domains(),
            ["us-central1.run.internal.".to_string(), "run.internal.".to_string()]
        );
    }

    #[test]
    fn bind_addresses_are_loopback() {
        let cfg = sample();
        assert!(cfg.dns_bind_v4().ip().is_loopback());
        assert!(cfg.dns_bind_v6().ip().is_loopback());
        assert!(cfg.proxy_bind_v4().ip().is_loopback());
        assert!(cfg.proxy_bind_v6().ip().is_loopback());
    }
}

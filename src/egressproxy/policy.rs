use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::netpolicy::{self, AllowlistEntry, AllowlistError};
use crate::protocol::{NetCapability, NetMode};

/// Stable audit reason codes.
pub mod reason {
    pub const OK: &str = "OK";
    pub const NET_MODE_NONE: &str = "NET_MODE_NONE";
    pub const NOT_IN_ALLOWLIST: &str = "NOT_IN_ALLOWLIST";
    pub const DNS_DENIED: &str = "DNS_DENIED";
    pub const INVALID_DESTINATION: &str = "INVALID_DESTINATION";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const OTHER: &str = "OTHER";
}

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Hostname resolution, injectable for tests.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // Port 0 is a placeholder; only the addresses are used.
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Outbound TCP dialing, injectable for tests.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason_code: &'static str,
}

/// A dial that was rejected or failed, mapped to a stable audit reason code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DialFailure {
    pub reason_code: &'static str,
    pub resolved_ip: Option<IpAddr>,
    pub message: String,
}

/// Evaluates whether a destination is allowed under a directive's network
/// capability, and performs DNS-pinned dialing for allowed ones.
pub struct Policy {
    mode: NetMode,
    entries: Vec<AllowlistEntry>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("mode", &self.mode)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Policy {
    /// Build an enforcement policy from a network capability.
    /// A missing capability means deny-all.
    pub fn new(cap: Option<&NetCapability>) -> Result<Self, AllowlistError> {
        let mut policy = Self {
            mode: NetMode::None,
            entries: Vec::new(),
            resolver: Arc::new(SystemResolver),
            dialer: Arc::new(SystemDialer),
        };
        let Some(cap) = cap else {
            return Ok(policy);
        };
        policy.mode = cap.mode;
        if cap.mode == NetMode::Allowlist {
            for raw in &cap.allow {
                policy.entries.push(netpolicy::parse_allowlist_entry(raw)?);
            }
        }
        Ok(policy)
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolver = resolver;
    }

    pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
        self.dialer = dialer;
    }

    /// Policy-level decision for a destination. The SSRF guard (private-IP
    /// refusal) is applied separately at resolution time, even for
    /// unrestricted mode.
    pub fn check(&self, dest_host: &str, dest_port: u16) -> CheckResult {
        match self.mode {
            NetMode::None => CheckResult {
                allowed: false,
                reason_code: reason::NET_MODE_NONE,
            },
            NetMode::Unrestricted => CheckResult {
                allowed: true,
                reason_code: reason::OK,
            },
            NetMode::Allowlist => {
                if self.entries.iter().any(|e| e.matches(dest_host, dest_port)) {
                    CheckResult {
                        allowed: true,
                        reason_code: reason::OK,
                    }
                } else {
                    CheckResult {
                        allowed: false,
                        reason_code: reason::NOT_IN_ALLOWLIST,
                    }
                }
            }
            NetMode::Unknown => CheckResult {
                allowed: false,
                reason_code: reason::INTERNAL_ERROR,
            },
        }
    }

    /// Resolve the host proxy-side and require at least one public address.
    /// Returns the first public address; denies with DNS_DENIED when the
    /// lookup fails or every address is private (DNS rebinding defense).
    pub async fn resolve_and_check(&self, dest_host: &str) -> Result<IpAddr, DialFailure> {
        let ips = self.resolver.lookup(dest_host).await.map_err(|e| DialFailure {
            reason_code: reason::DNS_DENIED,
            resolved_ip: None,
            message: format!("DNS lookup for {dest_host} failed: {e}"),
        })?;

        for ip in &ips {
            if !netpolicy::is_private_ip(Some(*ip)) {
                return Ok(*ip);
            }
        }

        Err(DialFailure {
            reason_code: reason::DNS_DENIED,
            resolved_ip: ips.first().copied(),
            message: format!("all resolved IPs for {dest_host} are private/non-routable"),
        })
    }

    /// Resolve, validate, and dial. Returns the connection and the resolved
    /// IP for audit logging.
    pub async fn dial_checked(
        &self,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<(TcpStream, IpAddr), DialFailure> {
        let ip = self.resolve_and_check(dest_host).await?;
        let addr = SocketAddr::new(ip, dest_port);
        let conn = self.dialer.dial(addr).await.map_err(|e| DialFailure {
            reason_code: reason::OTHER,
            resolved_ip: Some(ip),
            message: format!("dial {addr}: {e}"),
        })?;
        Ok((conn, ip))
    }
}

#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;

    /// Resolver returning a fixed address set for every lookup.
    pub struct StaticResolver(pub Vec<IpAddr>);

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            if self.0.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such host"));
            }
            Ok(self.0.clone())
        }
    }

    /// Dialer that ignores the checked address and connects to a fixed
    /// local endpoint instead (stands in for the public internet).
    pub struct RedirectDialer(pub SocketAddr);

    #[async_trait]
    impl Dialer for RedirectDialer {
        async fn dial(&self, _addr: SocketAddr) -> io::Result<TcpStream> {
            TcpStream::connect(self.0).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::StaticResolver;
    use super::*;

    fn cap(mode: NetMode, allow: &[&str]) -> NetCapability {
        NetCapability {
            mode,
            allow: allow.iter().map(|s| s.to_string()).collect(),
            ttl_seconds: 0,
        }
    }

    #[test]
    fn nil_capability_denies_all() {
        let p = Policy::new(None).unwrap();
        let r = p.check("example.com", 443);
        assert!(!r.allowed);
        assert_eq!(r.reason_code, reason::NET_MODE_NONE);
    }

    #[test]
    fn unrestricted_allows() {
        let p = Policy::new(Some(&cap(NetMode::Unrestricted, &[]))).unwrap();
        assert!(p.check("anything.example", 1).allowed);
        assert!(p.check("anything.example", 65535).allowed);
    }

    #[test]
    fn allowlist_matches_entries() {
        let p = Policy::new(Some(&cap(
            NetMode::Allowlist,
            &["github.com:443", "*.crates.io:443"],
        )))
        .unwrap();
        assert!(p.check("github.com", 443).allowed);
        assert!(p.check("static.crates.io", 443).allowed);
        let r = p.check("evil.com", 443);
        assert!(!r.allowed);
        assert_eq!(r.reason_code, reason::NOT_IN_ALLOWLIST);
        assert!(!p.check("github.com", 80).allowed);
    }

    #[test]
    fn allowlist_rejects_invalid_entry_at_construction() {
        let err = Policy::new(Some(&cap(NetMode::Allowlist, &["127.0.0.1:80"]))).unwrap_err();
        assert!(matches!(err, AllowlistError::IpLiteral(_)));
    }

    #[test]
    fn unknown_mode_fails_closed() {
        let p = Policy::new(Some(&cap(NetMode::Unknown, &[]))).unwrap();
        let r = p.check("example.com", 443);
        assert!(!r.allowed);
        assert_eq!(r.reason_code, reason::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn resolve_rejects_all_private() {
        let mut p = Policy::new(Some(&cap(NetMode::Unrestricted, &[]))).unwrap();
        p.set_resolver(Arc::new(StaticResolver(vec![
            "127.0.0.1".parse().unwrap(),
            "10.0.0.7".parse().unwrap(),
        ])));
        let err = p.resolve_and_check("localhost-aliased.example.com").await.unwrap_err();
        assert_eq!(err.reason_code, reason::DNS_DENIED);
        assert_eq!(err.resolved_ip, Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn resolve_picks_first_public() {
        let mut p = Policy::new(Some(&cap(NetMode::Unrestricted, &[]))).unwrap();
        p.set_resolver(Arc::new(StaticResolver(vec![
            "192.168.0.1".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
        ])));
        let ip = p.resolve_and_check("example.com").await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn resolve_failure_is_dns_denied() {
        let mut p = Policy::new(Some(&cap(NetMode::Unrestricted, &[]))).unwrap();
        p.set_resolver(Arc::new(StaticResolver(vec![])));
        let err = p.resolve_and_check("nxdomain.example").await.unwrap_err();
        assert_eq!(err.reason_code, reason::DNS_DENIED);
        assert!(err.resolved_ip.is_none());
    }
}

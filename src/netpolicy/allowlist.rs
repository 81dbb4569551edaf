use std::net::IpAddr;

/// A parsed `host:port` allowlist entry.
///
/// The host is either `localhost` or a DNS name with at least one dot; a
/// leading `*.` marks a subdomain-only wildcard. IP literals are rejected at
/// parse time so the policy can never pin a raw address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistEntry {
    pub raw: String,
    /// Normalized: lower-case, no trailing dot, no `*.` prefix.
    pub host: String,
    pub port: u16,
    pub wildcard: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllowlistError {
    #[error("invalid allowlist entry format, expected host:port")]
    InvalidFormat,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("port out of range: {0}")]
    PortOutOfRange(i64),
    #[error("IP literal is not allowed: {0:?}")]
    IpLiteral(String),
    #[error("invalid host: {0:?}")]
    InvalidHost(String),
}

/// Lower-case a hostname and strip surrounding whitespace and the trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_ip_literal(host: &str) -> bool {
    let h = host.trim();
    if h.starts_with('[') && h.ends_with(']') {
        return true;
    }
    // Naive IPv6 detection: a bare colon can only be an address here since
    // the port was already split off.
    if h.contains(':') {
        return true;
    }
    h.parse::<IpAddr>().is_ok()
}

/// One DNS label: 1-63 chars, alphanumeric at both ends, hyphens inside.
fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// `localhost`, or two-plus valid labels joined by dots.
fn is_valid_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    let labels: Vec<&str> = host.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| is_valid_label(l))
}

/// Parse a `host:port` entry, splitting on the final colon.
pub fn parse_allowlist_entry(s: &str) -> Result<AllowlistEntry, AllowlistError> {
    let raw = s.trim();
    let Some(idx) = raw.rfind(':') else {
        return Err(AllowlistError::InvalidFormat);
    };
    if idx == 0 || idx == raw.len() - 1 {
        return Err(AllowlistError::InvalidFormat);
    }
    let host_part = &raw[..idx];
    let port_part = &raw[idx + 1..];

    let port: i64 = port_part
        .parse()
        .map_err(|_| AllowlistError::InvalidPort(port_part.to_string()))?;
    if !(1..=65535).contains(&port) {
        return Err(AllowlistError::PortOutOfRange(port));
    }

    if is_ip_literal(host_part) {
        return Err(AllowlistError::IpLiteral(host_part.to_string()));
    }

    let (wildcard, host_raw) = match host_part.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, host_part),
    };
    let host = normalize_host(host_raw);

    // A wildcard must still have a dotted apex; "*.com" alone is too broad
    // only by operator judgment, but "*.localhost" is nonsense either way.
    if !is_valid_host(&host) || (wildcard && host == "localhost") {
        return Err(AllowlistError::InvalidHost(host_part.to_string()));
    }

    Ok(AllowlistEntry {
        raw: raw.to_string(),
        host,
        port: port as u16,
        wildcard,
    })
}

impl AllowlistEntry {
    /// Whether a destination matches this entry. A wildcard entry matches
    /// any subdomain depth but never the bare apex.
    pub fn matches(&self, dest_host: &str, dest_port: u16) -> bool {
        if dest_port != self.port {
            return false;
        }
        let h = normalize_host(dest_host);
        if self.wildcard {
            if h == self.host {
                return false;
            }
            return h.ends_with(&format!(".{}", self.host));
        }
        h == self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_entry() {
        let e = parse_allowlist_entry("GitHub.COM:443").unwrap();
        assert_eq!(e.host, "github.com");
        assert_eq!(e.port, 443);
        assert!(!e.wildcard);
    }

    #[test]
    fn parses_wildcard_entry() {
        let e = parse_allowlist_entry("*.example.com:8080").unwrap();
        assert_eq!(e.host, "example.com");
        assert!(e.wildcard);
    }

    #[test]
    fn accepts_localhost() {
        let e = parse_allowlist_entry("localhost:3000").unwrap();
        assert_eq!(e.host, "localhost");
    }

    #[test]
    fn strips_trailing_dot() {
        let e = parse_allowlist_entry("example.com.:443").unwrap();
        assert_eq!(e.host, "example.com");
    }

    #[test]
    fn rejects_missing_port() {
        assert_eq!(
            parse_allowlist_entry("example.com"),
            Err(AllowlistError::InvalidFormat)
        );
        assert_eq!(
            parse_allowlist_entry("example.com:"),
            Err(AllowlistError::InvalidFormat)
        );
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(matches!(
            parse_allowlist_entry("example.com:http"),
            Err(AllowlistError::InvalidPort(_))
        ));
        assert_eq!(
            parse_allowlist_entry("example.com:0"),
            Err(AllowlistError::PortOutOfRange(0))
        );
        assert_eq!(
            parse_allowlist_entry("example.com:65536"),
            Err(AllowlistError::PortOutOfRange(65536))
        );
    }

    #[test]
    fn rejects_ip_literals() {
        for bad in [
            "1.2.3.4:443",
            "[::1]:443",
            "2001:db8::1:443",
            "127.0.0.1:80",
        ] {
            let err = parse_allowlist_entry(bad).unwrap_err();
            assert!(
                matches!(err, AllowlistError::IpLiteral(_)),
                "{bad}: {err:?}"
            );
        }
    }

    #[test]
    fn rejects_dotless_hosts() {
        assert!(matches!(
            parse_allowlist_entry("intranet:80"),
            Err(AllowlistError::InvalidHost(_))
        ));
        assert!(matches!(
            parse_allowlist_entry("-bad.example.com:80"),
            Err(AllowlistError::InvalidHost(_))
        ));
    }

    #[test]
    fn exact_match() {
        let e = parse_allowlist_entry("example.com:443").unwrap();
        assert!(e.matches("example.com", 443));
        assert!(e.matches("EXAMPLE.com.", 443));
        assert!(!e.matches("example.com", 80));
        assert!(!e.matches("a.example.com", 443));
    }

    #[test]
    fn wildcard_matches_subdomains_not_apex() {
        let e = parse_allowlist_entry("*.example.com:443").unwrap();
        assert!(e.matches("a.example.com", 443));
        assert!(e.matches("b.a.example.com", 443));
        assert!(!e.matches("example.com", 443));
        assert!(!e.matches("notexample.com", 443));
    }
}

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Returns true if the address is private, loopback, link-local, or
/// otherwise non-routable. `None` is treated as non-routable (fail-closed).
///
/// Used by the egress proxy to deny connections to internal addresses even
/// in unrestricted mode.
pub fn is_private_ip(ip: Option<IpAddr>) -> bool {
    match ip {
        None => true,
        Some(IpAddr::V4(v4)) => is_private_v4(v4),
        Some(IpAddr::V6(v6)) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        // "this" network (RFC1122), RFC1918 10/8, loopback
        0 | 10 | 127 => true,
        // link-local
        169 if o[1] == 254 => true,
        // RFC1918 172.16/12
        172 if (16..=31).contains(&o[1]) => true,
        // RFC1918 192.168/16
        192 if o[1] == 168 => true,
        // shared address space (CGNAT) 100.64/10
        100 if (64..=127).contains(&o[1]) => true,
        // multicast 224/4 and reserved 240/4
        224..=255 => true,
        _ => false,
    }
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    // An IPv4-mapped address inherits the IPv4 classification.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    if ip.is_loopback() {
        return true;
    }
    let seg0 = ip.segments()[0];
    // unique-local fc00::/7
    if seg0 & 0xfe00 == 0xfc00 {
        return true;
    }
    // link-local unicast fe80::/10
    if seg0 & 0xffc0 == 0xfe80 {
        return true;
    }
    // link-local multicast ff02::/16
    if seg0 & 0xff0f == 0xff02 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn nil_is_private() {
        assert!(is_private_ip(None));
    }

    #[test]
    fn private_v4_ranges() {
        for s in [
            "0.1.2.3",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "100.64.0.1",
            "100.127.255.254",
            "224.0.0.251",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            assert!(is_private_ip(ip(s)), "{s} should be private");
        }
    }

    #[test]
    fn public_v4() {
        for s in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "100.128.0.1", "93.184.216.34"] {
            assert!(!is_private_ip(ip(s)), "{s} should be public");
        }
    }

    #[test]
    fn private_v6_ranges() {
        for s in ["::1", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::fb"] {
            assert!(is_private_ip(ip(s)), "{s} should be private");
        }
    }

    #[test]
    fn public_v6() {
        assert!(!is_private_ip(ip("2001:db8::1")));
        assert!(!is_private_ip(ip("2606:4700::1111")));
    }

    #[test]
    fn v4_mapped_v6_uses_v4_rules() {
        assert!(is_private_ip(ip("::ffff:127.0.0.1")));
        assert!(is_private_ip(ip("::ffff:10.1.2.3")));
        assert!(!is_private_ip(ip("::ffff:8.8.8.8")));
    }
}

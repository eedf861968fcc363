//! Coarse network classification used to diversify outbound peers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Network segment an address belongs to.
///
/// Routable IPv4 addresses group by /16, routable IPv6 by /32. Every
/// non-routable address (loopback, private, link-local, documentation,
/// unspecified) shares a single group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkGroup {
    /// Local or otherwise non-routable addresses.
    Unroutable,
    /// First two octets of a routable IPv4 address.
    Ipv4([u8; 2]),
    /// First two segments of a routable IPv6 address.
    Ipv6([u16; 2]),
}

impl NetworkGroup {
    /// Group of a socket address.
    pub fn of(addr: &SocketAddr) -> Self {
        Self::of_ip(addr.ip())
    }

    /// Group of an IP address.
    pub fn of_ip(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };

        if is_unroutable(&ip) {
            return NetworkGroup::Unroutable;
        }

        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                NetworkGroup::Ipv4([octets[0], octets[1]])
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                NetworkGroup::Ipv6([segments[0], segments[1]])
            }
        }
    }
}

impl fmt::Display for NetworkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkGroup::Unroutable => write!(f, "unroutable"),
            NetworkGroup::Ipv4([a, b]) => write!(f, "{a}.{b}.0.0/16"),
            NetworkGroup::Ipv6([a, b]) => write!(f, "{a:x}:{b:x}::/32"),
        }
    }
}

/// Check if an IP address cannot be reached over the public internet.
pub fn is_unroutable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified()
                || is_documentation_v4(*ip)
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || is_unicast_link_local_v6(*ip)
                || is_unique_local_v6(*ip)
        }
    }
}

/// 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24.
fn is_documentation_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
}

/// fe80::/10
fn is_unicast_link_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// fc00::/7
fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(s: &str) -> NetworkGroup {
        NetworkGroup::of(&s.parse().unwrap())
    }

    #[test]
    fn test_ipv4_groups_by_slash_16() {
        assert_eq!(group("8.8.4.4:53"), group("8.8.200.1:9333"));
        assert_ne!(group("8.8.4.4:53"), group("8.9.4.4:53"));
        assert_eq!(group("8.8.4.4:53"), NetworkGroup::Ipv4([8, 8]));
    }

    #[test]
    fn test_ipv6_groups_by_slash_32() {
        assert_eq!(group("[2001:db9:1::1]:9333"), group("[2001:db9:ffff::2]:9333"));
        assert_ne!(group("[2001:db9::1]:9333"), group("[2001:dba::1]:9333"));
    }

    #[test]
    fn test_mapped_ipv4_uses_ipv4_group() {
        assert_eq!(group("[::ffff:8.8.4.4]:9333"), NetworkGroup::Ipv4([8, 8]));
    }

    #[test]
    fn test_local_addresses_share_one_group() {
        assert_eq!(group("127.0.0.1:9333"), NetworkGroup::Unroutable);
        assert_eq!(group("192.168.1.7:9333"), NetworkGroup::Unroutable);
        assert_eq!(group("10.1.2.3:9333"), NetworkGroup::Unroutable);
        assert_eq!(group("[::1]:9333"), NetworkGroup::Unroutable);
        assert_eq!(group("[fe80::1]:9333"), NetworkGroup::Unroutable);
        assert_eq!(group("203.0.113.9:9333"), NetworkGroup::Unroutable);
    }

    #[test]
    fn test_display() {
        assert_eq!(NetworkGroup::Ipv4([8, 8]).to_string(), "8.8.0.0/16");
        assert_eq!(NetworkGroup::Ipv6([0x2001, 0xdb9]).to_string(), "2001:db9::/32");
    }
}

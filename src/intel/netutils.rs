//! IP address scope classification.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

/// Routing scope of an IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpScope {
    Invalid,
    HostLocal,
    LinkLocal,
    SiteLocal,
    Global,
    LocalMulticast,
    GlobalMulticast,
}

impl IpScope {
    /// Whether the address is globally routable unicast.
    pub fn is_global(&self) -> bool {
        *self == IpScope::Global
    }
}

// Ranges that are neither private nor routable on the public internet.
fn special_v4() -> &'static [IpNet] {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| {
        [
            "0.0.0.0/8",
            "100.64.0.0/10",
            "192.0.0.0/24",
            "192.0.2.0/24",
            "198.18.0.0/15",
            "198.51.100.0/24",
            "203.0.113.0/24",
            "240.0.0.0/4",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
    })
}

fn special_v6() -> &'static [IpNet] {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| {
        ["100::/64", "2001:db8::/32", "fc00::/7"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    })
}

/// Classify an IP address by routing scope.
pub fn classify_ip(ip: &IpAddr) -> IpScope {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(&v4),
            None => classify_v6(v6),
        },
    }
}

fn classify_v4(ip: &Ipv4Addr) -> IpScope {
    let addr = IpAddr::V4(*ip);
    if ip.is_unspecified() || ip.is_broadcast() {
        IpScope::Invalid
    } else if ip.is_loopback() {
        IpScope::HostLocal
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if ip.is_multicast() {
        // 224.0.0.0/24 is the local network control block.
        if ip.octets()[..3] == [224, 0, 0] {
            IpScope::LocalMulticast
        } else {
            IpScope::GlobalMulticast
        }
    } else if ip.is_private() || special_v4().iter().any(|net| net.contains(&addr)) {
        IpScope::SiteLocal
    } else {
        IpScope::Global
    }
}

fn classify_v6(ip: &Ipv6Addr) -> IpScope {
    let addr = IpAddr::V6(*ip);
    let first = ip.segments()[0];
    if ip.is_unspecified() {
        IpScope::Invalid
    } else if ip.is_loopback() {
        IpScope::HostLocal
    } else if first & 0xffc0 == 0xfe80 {
        IpScope::LinkLocal
    } else if ip.is_multicast() {
        // Multicast scope lives in the low nibble of the second byte.
        match first & 0x000f {
            0x1 | 0x2 | 0x3 | 0x4 | 0x5 => IpScope::LocalMulticast,
            _ => IpScope::GlobalMulticast,
        }
    } else if special_v6().iter().any(|net| net.contains(&addr)) {
        IpScope::SiteLocal
    } else {
        IpScope::Global
    }
}

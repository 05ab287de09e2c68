//! External-address classification.
//!
//! Shapes whose bandwidth accounting only counts public egress must never be
//! pointed at an address the provider ignores. The refused ranges are spelled
//! out octet by octet rather than leaning on std's classification helpers:
//! the policy needs CGNAT and benchmark space too, and it needs the *whole*
//! of each range, boundaries included.

#![allow(missing_docs)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether `addr` is routable on the public internet for egress-accounting
/// purposes.
#[must_use]
pub fn is_external(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_external_v4(v4),
        IpAddr::V6(v6) => is_external_v6(v6),
    }
}

/// Parse-and-classify convenience for configuration strings.
#[must_use]
pub fn is_external_str(raw: &str) -> bool {
    raw.parse::<IpAddr>().is_ok_and(is_external)
}

#[must_use]
pub fn is_external_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();

    // 0.0.0.0/8 "this network" + unspecified
    if a == 0 {
        return false;
    }
    // 10.0.0.0/8 private
    if a == 10 {
        return false;
    }
    // 100.64.0.0/10 CGNAT
    if a == 100 && (64..=127).contains(&b) {
        return false;
    }
    // 127.0.0.0/8 loopback
    if a == 127 {
        return false;
    }
    // 169.254.0.0/16 link-local
    if a == 169 && b == 254 {
        return false;
    }
    // 172.16.0.0/12 private
    if a == 172 && (16..=31).contains(&b) {
        return false;
    }
    // 192.0.0.0/24 IETF protocol assignments, 192.0.2.0/24 TEST-NET-1
    if a == 192 && b == 0 && (ip.octets()[2] == 0 || ip.octets()[2] == 2) {
        return false;
    }
    // 192.168.0.0/16 private
    if a == 192 && b == 168 {
        return false;
    }
    // 198.18.0.0/15 benchmarking
    if a == 198 && (18..=19).contains(&b) {
        return false;
    }
    // 198.51.100.0/24 TEST-NET-2
    if a == 198 && b == 51 && ip.octets()[2] == 100 {
        return false;
    }
    // 203.0.113.0/24 TEST-NET-3
    if a == 203 && b == 0 && ip.octets()[2] == 113 {
        return false;
    }
    // 224.0.0.0/4 multicast, 240.0.0.0/4 reserved, 255.255.255.255 broadcast
    if a >= 224 {
        return false;
    }
    true
}

#[must_use]
pub fn is_external_v6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return false;
    }
    let segments = ip.segments();
    // fc00::/7 unique-local
    if (segments[0] & 0xfe00) == 0xfc00 {
        return false;
    }
    // fe80::/10 link-local
    if (segments[0] & 0xffc0) == 0xfe80 {
        return false;
    }
    // ff00::/8 multicast
    if (segments[0] & 0xff00) == 0xff00 {
        return false;
    }
    // 2001:db8::/32 documentation
    if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        return false;
    }
    // ::ffff:a.b.c.d mapped IPv4 follows the IPv4 policy.
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_external_v4(mapped);
    }
    true
}

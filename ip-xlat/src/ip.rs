//! Address and protocol classification shared by the translators and the
//! address mappers.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Addresses that must never appear on a translated main packet:
/// 0.0.0.0/8, 127.0.0.0/8, 224.0.0.0/4 and the limited broadcast.
pub(crate) fn is_ipv4_unusable(addr: Ipv4Addr) -> bool {
    addr.octets()[0] == 0 || addr.is_loopback() || addr.is_multicast() || addr.is_broadcast()
}

/// [`is_ipv4_unusable`] plus every private, shared, link-local, reserved,
/// documentation and benchmarking block.
pub(crate) fn is_ipv4_unusable_or_private(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();

    octets[0] == 0
        || addr.is_private()
        || matches!(octets, [100, 64..=127, ..]) // 100.64.0.0/10
        || addr.is_loopback()
        || addr.is_link_local()
        || matches!(octets, [192, 0, 0, _]) // 192.0.0.0/24
        || matches!(octets, [192, 0, 2, _]) // 192.0.2.0/24
        || matches!(octets, [192, 88, 99, _]) // 192.88.99.0/24
        || matches!(octets, [198, 18..=19, ..]) // 198.18.0.0/15
        || matches!(octets, [198, 51, 100, _]) // 198.51.100.0/24
        || matches!(octets, [203, 0, 113, _]) // 203.0.113.0/24
        || octets[0] >= 224 // 224.0.0.0/4 and 240.0.0.0/4, incl. broadcast
}

/// ::, ::1 and ff00::/8.
pub(crate) fn is_ipv6_unusable(addr: Ipv6Addr) -> bool {
    addr.is_unspecified() || addr.is_loopback() || addr.is_multicast()
}

/// Protocols this translator refuses to carry: HOPOPT, IGMP, the IPv6
/// routing/fragment/destination-options extension numbers, AH, Mobility,
/// HIP and Shim6. ESP (50) passes through.
pub(crate) fn is_protocol_forbidden(protocol: u8) -> bool {
    matches!(protocol, 0 | 2 | 43 | 44 | 51 | 60 | 135 | 139 | 140)
}

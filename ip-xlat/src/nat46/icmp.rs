//! ICMPv4 → ICMPv6 message rewriting, including the IPv4 packet quoted
//! inside error messages.

use crate::addr::{self, MapOutcome};
use crate::checksum;
use crate::worker::WorkerContext;
use anyhow::Result;
use etherparse::{IpNumber, Ipv6FlowLabel, Ipv6FragmentHeader, Ipv6Header};

/// RFC 1191 plateau table, descending. Used to guess a next-hop MTU when an
/// old router reports Fragmentation Needed without one.
const PLATEAU_MTUS: [u16; 11] = [65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68];
const DEFAULT_PLATEAU_MTU: u16 = 68;

/// An ICMPv6 error message must fit the 1280-byte minimum MTU together with
/// a 40-byte IPv6 header.
const MAX_ICMPV6_MESSAGE: usize = 1240;

/// The rewritten ICMPv6 message: a stack-built head (ICMPv6 header, then
/// for errors the translated inner IPv6 header, optional inner fragment
/// header and optional inner ICMPv6 echo header) plus a tail borrowed from
/// the inbound buffer.
pub(super) struct Icmpv6Message<'a> {
    head: [u8; 64],
    head_len: usize,
    pub(super) tail: &'a [u8],
}

impl Icmpv6Message<'_> {
    pub(super) fn head(&self) -> &[u8] {
        &self.head[..self.head_len]
    }
}

struct InnerPacket<'a> {
    payload: &'a [u8],
    carried_protocol: u8,
    is_fragment: bool,
}

pub(super) fn translate_icmpv4_to_icmpv6<'a>(
    ctx: &mut WorkerContext,
    icmp_payload: &'a [u8],
    out_header: &Ipv6Header,
) -> Result<Option<Icmpv6Message<'a>>> {
    if icmp_payload.len() < 8 {
        return Ok(None);
    }

    let old_type = icmp_payload[0];
    let old_code = icmp_payload[1];

    let mut message = Icmpv6Message {
        head: [0u8; 64],
        head_len: 8,
        tail: &[],
    };

    let Some((new_type, new_code)) = translate_type_and_code(old_type, old_code) else {
        return Ok(None);
    };
    message.head[0] = new_type;
    message.head[1] = new_code;

    if !translate_rest_of_header(ctx, icmp_payload, &mut message.head) {
        return Ok(None);
    }

    let inner_payload = &icmp_payload[8..];

    if old_type == 0 || old_type == 8 {
        // Echo messages carry opaque data.
        message.tail = inner_payload;
    } else {
        let Some(inner) = translate_inner_header(ctx, inner_payload, &mut message)? else {
            return Ok(None);
        };

        if inner.carried_protocol == 58 {
            // A fragmented or truncated inner payload cannot be proven to
            // be an echo message, and nested errors must not be translated.
            if inner.is_fragment || inner.payload.len() < 8 {
                return Ok(None);
            }

            let echo = &mut message.head[message.head_len..message.head_len + 8];
            echo.copy_from_slice(&inner.payload[..8]);

            if echo[1] != 0 {
                return Ok(None);
            }
            match echo[0] {
                0 => echo[0] = 129, // Echo Reply
                8 => echo[0] = 128, // Echo Request
                _ => return Ok(None),
            }
            message.head_len += 8;

            message.tail = &inner.payload[8..];
        } else {
            message.tail = inner.payload;
        }

        let max_tail = MAX_ICMPV6_MESSAGE - message.head_len;
        message.tail = &message.tail[..message.tail.len().min(max_tail)];
    }

    let new_checksum = checksum::transport_checksum_v6(
        out_header.source.into(),
        out_header.destination.into(),
        58,
        &message.head[..message.head_len],
        message.tail,
    );
    message.head[2..4].copy_from_slice(&new_checksum.to_be_bytes());

    Ok(Some(message))
}

/// RFC 7915 §4.2.
fn translate_type_and_code(old_type: u8, old_code: u8) -> Option<(u8, u8)> {
    match (old_type, old_code) {
        (8, 0) => Some((128, 0)), // Echo Request
        (0, 0) => Some((129, 0)), // Echo Reply

        // Destination Unreachable
        (3, 0 | 1 | 5 | 6 | 7 | 8 | 11 | 12) => Some((1, 0)),
        (3, 9 | 10 | 13 | 15) => Some((1, 1)), // administratively prohibited
        (3, 2) => Some((4, 1)),                // Protocol Unreachable
        (3, 3) => Some((1, 4)),                // Port Unreachable
        (3, 4) => Some((2, 0)),                // Fragmentation Needed

        (11, 0 | 1) => Some((3, old_code)), // Time Exceeded

        (12, 0 | 2) => Some((4, 0)), // Parameter Problem

        // Everything else, including Timestamp, Information and Address
        // Mask messages, Router Advertisement/Solicitation, Redirect and
        // Source Quench, is silently dropped.
        _ => None,
    }
}

fn translate_rest_of_header(ctx: &WorkerContext, icmp_payload: &[u8], head: &mut [u8; 64]) -> bool {
    let old_type = icmp_payload[0];
    let old_code = icmp_payload[1];
    let old_rest = &icmp_payload[4..8];

    // Echo: identifier and sequence number carry over.
    if old_type == 0 || old_type == 8 {
        head[4..8].copy_from_slice(old_rest);
        return true;
    }

    if old_type == 3 && old_code == 2 {
        if old_rest != [0; 4] {
            return false;
        }

        // The ICMPv6 Parameter Problem pointer targets "Next Header".
        head[4..7].fill(0);
        head[7] = 6;
        return true;
    }

    if old_type == 3 && old_code == 4 {
        if old_rest[..2] != [0; 2] {
            return false;
        }

        let old_mtu = u16::from_be_bytes([old_rest[2], old_rest[3]]);
        let new_mtu = recalculate_packet_too_big_mtu(ctx, &icmp_payload[8..], old_mtu);

        head[4..6].fill(0);
        head[6..8].copy_from_slice(&new_mtu.to_be_bytes());
        return true;
    }

    if old_type == 12 {
        if old_rest[1..] != [0; 3] {
            return false;
        }

        head[4..7].fill(0);
        return match translate_parameter_problem_pointer(old_rest[0]) {
            Some(pointer) => {
                head[7] = pointer;
                true
            }
            None => false,
        };
    }

    // All remaining translatable messages have an unused rest-of-header.
    if old_rest != [0; 4] {
        return false;
    }
    head[4..8].fill(0);

    true
}

/// Both the argument and the result are host byte order.
fn recalculate_packet_too_big_mtu(ctx: &WorkerContext, quoted_packet: &[u8], mtu: u16) -> u16 {
    let mtu = if mtu == 0 { estimate_likely_mtu(quoted_packet) } else { mtu };

    // Some networks run below the formal minimum MTUs; the clamps below
    // follow RFC 7915 with the +20 adjustment for the smaller IPv4 header.
    let mut mtu = u32::from(mtu).min(65515);
    mtu = (mtu + 20).min(u32::from(ctx.config.ipv6_outbound_mtu));
    mtu = mtu.min(u32::from(ctx.config.ipv4_outbound_mtu) + 20);
    mtu = mtu.max(1280);

    mtu as u16
}

/// RFC 1191: the greatest plateau below the quoted packet's total length.
fn estimate_likely_mtu(quoted_packet: &[u8]) -> u16 {
    if quoted_packet.len() < 20 {
        return DEFAULT_PLATEAU_MTU;
    }

    let total_len = u16::from_be_bytes([quoted_packet[2], quoted_packet[3]]);

    PLATEAU_MTUS
        .into_iter()
        .find(|plateau| *plateau < total_len)
        .unwrap_or(DEFAULT_PLATEAU_MTU)
}

/// RFC 7915 §4.2, Figure 3.
fn translate_parameter_problem_pointer(old_pointer: u8) -> Option<u8> {
    match old_pointer {
        0 | 1 => Some(old_pointer),
        2 | 3 => Some(4),
        8 => Some(7),
        9 => Some(6),
        12..=15 => Some(8),
        16..=19 => Some(24),
        // 4, 5, 6, 7, 10 and 11 have no IPv6 equivalent.
        _ => None,
    }
}

/// Translates the quoted IPv4 header into an IPv6 (and possibly fragment)
/// header appended to the message head. Validation is the bare minimum; a
/// quoted packet is expected to be broken in some way.
fn translate_inner_header<'a>(
    ctx: &mut WorkerContext,
    inner_packet: &'a [u8],
    message: &mut Icmpv6Message<'_>,
) -> Result<Option<InnerPacket<'a>>> {
    if inner_packet.len() < 20 {
        return Ok(None);
    }

    if inner_packet[0] >> 4 != 4 {
        return Ok(None);
    }

    let header_len = usize::from(inner_packet[0] & 0xf) * 4;
    if header_len < 20 || header_len > inner_packet.len() {
        return Ok(None);
    }

    let protocol = inner_packet[9];
    let carried_protocol = if protocol == 1 { 58 } else { protocol };

    let total_len = u16::from_be_bytes([inner_packet[2], inner_packet[3]]);
    let flags_and_offset = u16::from_be_bytes([inner_packet[6], inner_packet[7]]);
    let more_fragments = flags_and_offset & 0x2000 != 0;
    let offset = flags_and_offset & 0x1fff;
    let is_fragment = more_fragments || offset != 0;

    let (src, dst) = match addr::map_inner_4to6(
        ctx,
        ipv4_addr(&inner_packet[12..16]),
        ipv4_addr(&inner_packet[16..20]),
    )? {
        MapOutcome::Mapped(pair) => pair,
        MapOutcome::Drop | MapOutcome::Unreachable => return Ok(None),
    };

    let inner_header = Ipv6Header {
        traffic_class: inner_packet[1],
        flow_label: Ipv6FlowLabel::ZERO,
        // May wrap for a quoted packet that lies about its length.
        payload_length: total_len.wrapping_sub(header_len as u16),
        next_header: if is_fragment { IpNumber::IPV6_FRAGMENTATION_HEADER } else { IpNumber(carried_protocol) },
        hop_limit: inner_packet[8],
        source: src.octets(),
        destination: dst.octets(),
    };

    message.head[8..48].copy_from_slice(&inner_header.to_bytes());
    message.head_len += 40;

    if is_fragment {
        let fragment = Ipv6FragmentHeader::new(
            IpNumber(carried_protocol),
            etherparse::IpFragOffset::try_new(offset).unwrap_or(etherparse::IpFragOffset::ZERO),
            more_fragments,
            u32::from(u16::from_be_bytes([inner_packet[4], inner_packet[5]])),
        );
        message.head[48..56].copy_from_slice(&crate::io::fragment_header_bytes(&fragment));
        message.head_len += 8;
    }

    Ok(Some(InnerPacket {
        payload: &inner_packet[header_len..],
        carried_protocol,
        is_fragment,
    }))
}

fn ipv4_addr(octets: &[u8]) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])
}

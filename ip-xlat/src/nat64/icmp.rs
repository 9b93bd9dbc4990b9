//! ICMPv6 → ICMPv4 message rewriting, including the IPv6 packet quoted
//! inside error messages.

use crate::addr::{self, MapOutcome};
use crate::checksum;
use crate::worker::WorkerContext;
use anyhow::Result;
use etherparse::{IpDscp, IpEcn, IpFragOffset, IpNumber, Ipv4Header};

/// An ICMPv4 error message is kept within 576 bytes of total packet size;
/// with the 20-byte outer header that leaves 556 bytes of ICMP message.
const MAX_ICMPV4_MESSAGE: usize = 556;

/// The rewritten ICMPv4 message. For error messages the head carries the
/// ICMPv4 header, the translated inner IPv4 header and up to 4 bytes of the
/// inner transport header, so that the borrowed tail stays 8-byte aligned
/// where possible.
pub(super) struct Icmpv4Message<'a> {
    head: [u8; 36],
    head_len: usize,
    /// `None` when the whole message lives in the head; the head is then
    /// not necessarily 8-byte aligned and must be sent as the trailing
    /// segment.
    pub(super) tail: Option<&'a [u8]>,
}

impl Icmpv4Message<'_> {
    pub(super) fn head(&self) -> &[u8] {
        &self.head[..self.head_len]
    }
}

struct InnerPacket<'a> {
    payload: &'a [u8],
    carried_protocol: u8,
    is_fragment: bool,
}

pub(super) fn translate_icmpv6_to_icmpv4<'a>(
    ctx: &mut WorkerContext,
    icmp_payload: &'a [u8],
) -> Result<Option<Icmpv4Message<'a>>> {
    if icmp_payload.len() < 8 {
        return Ok(None);
    }

    let old_type = icmp_payload[0];
    let old_code = icmp_payload[1];

    let mut message = Icmpv4Message {
        head: [0u8; 36],
        head_len: 8,
        tail: None,
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

    if old_type == 128 || old_type == 129 {
        message.tail = Some(inner_payload);
    } else {
        let Some(inner) = translate_inner_header(ctx, inner_payload, old_type, &mut message)?
        else {
            return Ok(None);
        };

        if inner.carried_protocol == 1 {
            // A fragmented or truncated inner payload cannot be proven to
            // be an echo message, and nested errors must not be translated.
            if inner.is_fragment || inner.payload.len() < 8 {
                return Ok(None);
            }

            // Only type, code and checksum are carried in the head; the
            // rest of the inner echo header sits in the tail.
            message.head[28..32].copy_from_slice(&inner.payload[..4]);

            if message.head[29] != 0 {
                return Ok(None);
            }
            match message.head[28] {
                128 => message.head[28] = 8, // Echo Request
                129 => message.head[28] = 0, // Echo Reply
                _ => return Ok(None),
            }
            message.head_len += 4;

            message.tail = Some(&inner.payload[4..]);
        } else if inner.payload.len() >= 4 {
            message.head[28..32].copy_from_slice(&inner.payload[..4]);
            message.head_len += 4;

            message.tail = Some(&inner.payload[4..]);
        } else {
            let len = inner.payload.len();
            message.head[28..28 + len].copy_from_slice(inner.payload);
            message.head_len += len;

            message.tail = None;
        }

        if let Some(tail) = message.tail {
            let max_tail = MAX_ICMPV4_MESSAGE - message.head_len;
            message.tail = Some(&tail[..tail.len().min(max_tail)]);
        }
    }

    let new_checksum = checksum::icmpv4_checksum(
        &message.head[..message.head_len],
        message.tail.unwrap_or(&[]),
    );
    message.head[2..4].copy_from_slice(&new_checksum.to_be_bytes());

    Ok(Some(message))
}

/// RFC 7915 §5.2.
fn translate_type_and_code(old_type: u8, old_code: u8) -> Option<(u8, u8)> {
    match (old_type, old_code) {
        (128, 0) => Some((8, 0)), // Echo Request
        (129, 0) => Some((0, 0)), // Echo Reply

        // Destination Unreachable
        (1, 0 | 2 | 3) => Some((3, 1)), // no route / beyond scope / address
        (1, 1) => Some((3, 10)),        // administratively prohibited
        (1, 4) => Some((3, 3)),         // port unreachable

        (2, 0) => Some((3, 4)), // Packet Too Big

        (3, 0 | 1) => Some((11, old_code)), // Time Exceeded

        // Parameter Problem
        (4, 0) => Some((12, 0)),
        (4, 1) => Some((3, 2)), // unrecognized Next Header

        // Everything else, notably all MLD and Neighbor Discovery
        // messages, is silently dropped.
        _ => None,
    }
}

fn translate_rest_of_header(ctx: &WorkerContext, icmp_payload: &[u8], head: &mut [u8; 36]) -> bool {
    let old_type = icmp_payload[0];
    let old_code = icmp_payload[1];
    let old_rest = &icmp_payload[4..8];

    // Echo: identifier and sequence number carry over.
    if old_type == 128 || old_type == 129 {
        head[4..8].copy_from_slice(old_rest);
        return true;
    }

    if old_type == 2 {
        if old_rest[..2] != [0; 2] {
            return false;
        }

        let old_mtu = u16::from_be_bytes([old_rest[2], old_rest[3]]);
        let new_mtu = recalculate_packet_too_big_mtu(ctx, old_mtu);

        head[4..6].fill(0);
        head[6..8].copy_from_slice(&new_mtu.to_be_bytes());
        return true;
    }

    if old_type == 4 {
        if old_code == 0 {
            if old_rest[..3] != [0; 3] {
                return false;
            }

            head[5..8].fill(0);
            return match translate_parameter_problem_pointer(old_rest[3]) {
                Some(pointer) => {
                    head[4] = pointer;
                    true
                }
                None => false,
            };
        }

        // Unrecognized Next Header: the pointer is intentionally left
        // unvalidated, the ICMPv4 message has no use for it.
        head[4..8].fill(0);
        return true;
    }

    // All remaining translatable messages have an unused rest-of-header.
    if old_rest != [0; 4] {
        return false;
    }
    head[4..8].fill(0);

    true
}

/// Both the argument and the result are host byte order.
fn recalculate_packet_too_big_mtu(ctx: &WorkerContext, mtu: u16) -> u16 {
    // Some networks run below the formal minimum MTUs; the clamps below
    // follow RFC 7915 with the −20 adjustment for the smaller IPv4 header.
    let mut mtu = u32::from(mtu).max(20);
    mtu = (mtu - 20).min(u32::from(ctx.config.ipv4_outbound_mtu));
    mtu = mtu.min(u32::from(ctx.config.ipv6_outbound_mtu) - 20);
    mtu = mtu.max(68);

    mtu as u16
}

/// RFC 7915 §5.2, Figure 6.
fn translate_parameter_problem_pointer(old_pointer: u8) -> Option<u8> {
    match old_pointer {
        0 | 1 => Some(old_pointer),
        4 | 5 => Some(2),
        6 => Some(9),
        7 => Some(8),
        8..=23 => Some(12),
        24..=39 => Some(16),
        // 2 and 3 (flow label) and everything past the addresses have no
        // IPv4 equivalent.
        _ => None,
    }
}

/// Translates the quoted IPv6 header into an IPv4 header appended to the
/// message head. The extension-header walk here is lenient: a quoted packet
/// is expected to be broken in some way.
fn translate_inner_header<'a>(
    ctx: &mut WorkerContext,
    inner_packet: &'a [u8],
    outer_type: u8,
    message: &mut Icmpv4Message<'_>,
) -> Result<Option<InnerPacket<'a>>> {
    if inner_packet.len() < 40 {
        return Ok(None);
    }

    if inner_packet[0] >> 4 != 6 {
        return Ok(None);
    }

    let traffic_class = (inner_packet[0] << 4) | (inner_packet[1] >> 4);
    let payload_len = u16::from_be_bytes([inner_packet[4], inner_packet[5]]);

    let mut offset = 40;
    let mut next_header = inner_packet[6];
    let mut fragment_header: Option<&[u8]> = None;

    while fragment_header.is_none() && matches!(next_header, 0 | 43 | 44 | 60) {
        if inner_packet.len() - offset < 8 {
            return Ok(None);
        }
        let extension = &inner_packet[offset..];

        if next_header == 44 {
            fragment_header = Some(&extension[..8]);
        }

        next_header = extension[0];
        let extension_len = 8 + usize::from(extension[1]) * 8;
        if extension_len > inner_packet.len() - offset {
            return Ok(None);
        }
        offset += extension_len;
    }

    let carried_protocol = if next_header == 58 { 1 } else { next_header };

    // "Packet Too Big" literally says the original sender had DF set.
    let dont_fragment = outer_type == 2;

    let (identification, fragment_offset, more_fragments) = match fragment_header {
        Some(fragment) => {
            let offset_and_flags = u16::from_be_bytes([fragment[2], fragment[3]]);

            (
                u16::from_be_bytes([fragment[6], fragment[7]]),
                offset_and_flags >> 3,
                offset_and_flags & 1 != 0,
            )
        }
        None => (ctx.next_ipv4_frag_id(), 0, false),
    };

    let (src, dst) = match addr::map_inner_6to4(
        ctx,
        super::ipv6_source(inner_packet),
        super::ipv6_destination(inner_packet),
    )? {
        MapOutcome::Mapped(pair) => pair,
        MapOutcome::Drop | MapOutcome::Unreachable => return Ok(None),
    };

    let mut inner_header = Ipv4Header {
        dscp: IpDscp::try_new(traffic_class >> 2).unwrap_or(IpDscp::ZERO),
        ecn: IpEcn::try_new(traffic_class & 0b11).unwrap_or(IpEcn::ZERO),
        // May wrap for a quoted packet that lies about its length.
        total_len: payload_len.wrapping_add(20),
        identification,
        dont_fragment,
        more_fragments,
        fragment_offset: IpFragOffset::try_new(fragment_offset).unwrap_or(IpFragOffset::ZERO),
        time_to_live: inner_packet[7],
        protocol: IpNumber(carried_protocol),
        header_checksum: 0,
        source: src.octets(),
        destination: dst.octets(),
        options: Default::default(),
    };
    inner_header.header_checksum = inner_header.calc_header_checksum();

    message.head[8..28].copy_from_slice(&inner_header.to_bytes());
    message.head_len += 20;

    Ok(Some(InnerPacket {
        payload: &inner_packet[offset..],
        carried_protocol,
        is_fragment: more_fragments || fragment_offset != 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_code_map_covers_rfc7915_table() {
        assert_eq!(translate_type_and_code(128, 0), Some((8, 0)));
        assert_eq!(translate_type_and_code(129, 0), Some((0, 0)));
        assert_eq!(translate_type_and_code(1, 0), Some((3, 1)));
        assert_eq!(translate_type_and_code(1, 1), Some((3, 10)));
        assert_eq!(translate_type_and_code(1, 2), Some((3, 1)));
        assert_eq!(translate_type_and_code(1, 3), Some((3, 1)));
        assert_eq!(translate_type_and_code(1, 4), Some((3, 3)));
        assert_eq!(translate_type_and_code(2, 0), Some((3, 4)));
        assert_eq!(translate_type_and_code(3, 0), Some((11, 0)));
        assert_eq!(translate_type_and_code(3, 1), Some((11, 1)));
        assert_eq!(translate_type_and_code(4, 0), Some((12, 0)));
        assert_eq!(translate_type_and_code(4, 1), Some((3, 2)));

        assert_eq!(translate_type_and_code(1, 5), None); // failed policy
        assert_eq!(translate_type_and_code(4, 2), None); // unrecognized option
        assert_eq!(translate_type_and_code(130, 0), None); // MLD query
        assert_eq!(translate_type_and_code(135, 0), None); // neighbor solicitation
    }

    #[test]
    fn parameter_problem_pointer_map() {
        assert_eq!(translate_parameter_problem_pointer(0), Some(0));
        assert_eq!(translate_parameter_problem_pointer(1), Some(1));
        assert_eq!(translate_parameter_problem_pointer(4), Some(2));
        assert_eq!(translate_parameter_problem_pointer(5), Some(2));
        assert_eq!(translate_parameter_problem_pointer(6), Some(9));
        assert_eq!(translate_parameter_problem_pointer(7), Some(8));
        assert_eq!(translate_parameter_problem_pointer(8), Some(12));
        assert_eq!(translate_parameter_problem_pointer(23), Some(12));
        assert_eq!(translate_parameter_problem_pointer(24), Some(16));
        assert_eq!(translate_parameter_problem_pointer(39), Some(16));

        for pointer in [2, 3, 40, 255] {
            assert_eq!(translate_parameter_problem_pointer(pointer), None);
        }
    }
}

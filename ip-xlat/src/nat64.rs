//! IPv6 → IPv4 translation.
//!
//! Mirrors the 4→6 direction: strict in-order validation of the base header
//! and extension-header chain, then per-transport payload handling, then
//! MTU-aware sending. IPv4 options are never generated; the IPv4 header is
//! always 20 bytes.

mod icmp;

use crate::addr::{self, MapOutcome};
use crate::io::{self, PacketSink};
use crate::worker::WorkerContext;
use crate::{checksum, ip, router};
use anyhow::Result;
use etherparse::{IpDscp, IpEcn, IpFragOffset, IpNumber, Ipv4Header};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Below this total size the translated packet travels with DF clear, so
/// every 1280-byte IPv6 packet survives translation even across a smaller
/// IPv4 path (1260 + 20 = 1280).
const DF_BOUNDARY: usize = 1260;

struct OutPacket<'a> {
    header: Ipv4Header,
    payload: &'a [u8],
    offset_is_zero: bool,
}

pub(crate) fn handle_packet<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    let Some(mut out) = validate_and_translate_header(ctx, packet, sink)? else {
        return Ok(());
    };

    // The base header and every extension header are valid at this point,
    // so ICMP messages back to the source are fair game now.
    if out.header.time_to_live < 1 {
        router::send_ipv6_time_exceeded(ctx, packet, sink)?;
        return Ok(());
    }

    match out.header.protocol.0 {
        1 => translate_icmp_and_send(ctx, packet, &mut out, sink),
        6 => translate_tcp_and_send(ctx, packet, &mut out, sink),
        17 => translate_udp_and_send(ctx, packet, &mut out, sink),
        _ => {
            let payload = out.payload;
            send_within_mtu(ctx, packet, &mut out, &[], payload, sink)
        }
    }
}

fn validate_and_translate_header<'a, S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &'a [u8],
    sink: &mut S,
) -> Result<Option<OutPacket<'a>>> {
    if packet.len() < 40 {
        return Ok(None);
    }

    let traffic_class = (packet[0] << 4) | (packet[1] >> 4);

    if usize::from(u16::from_be_bytes([packet[4], packet[5]])) != packet.len() - 40 {
        return Ok(None);
    }

    let hop_limit = packet[7];
    if hop_limit < 1 {
        return Ok(None); // Should have been dropped a hop earlier.
    }

    // Walk HOPOPT / Routing / Fragment / Destination Options until the
    // transport protocol is reached.
    let mut offset = 40;
    let mut next_header = packet[6];
    let mut fragment_header: Option<&[u8]> = None;

    while fragment_header.is_none() && matches!(next_header, 0 | 43 | 44 | 60) {
        if packet.len() - offset < 8 {
            return Ok(None);
        }
        let extension = &packet[offset..];

        if next_header == 43 {
            // A routing header with hops left cannot be translated
            // (RFC 7915 §5.1).
            if extension[3] != 0 {
                return Ok(None);
            }
        } else if next_header == 44 {
            let reserved_bits = u16::from_be_bytes([extension[2], extension[3]]) & 0b110;
            if extension[1] != 0 || reserved_bits != 0 {
                return Ok(None);
            }

            fragment_header = Some(&extension[..8]);
        }

        next_header = extension[0];
        // A fragment header's length byte is zero (validated above), so
        // this is exact for it too.
        let extension_len = 8 + usize::from(extension[1]) * 8;
        if extension_len > packet.len() - offset {
            return Ok(None);
        }
        offset += extension_len;
    }

    if ip::is_protocol_forbidden(next_header) || next_header == 1 {
        return Ok(None);
    }
    let protocol = if next_header == 58 { 1 } else { next_header };

    let payload = &packet[offset..];

    let (identification, fragment_offset, more_fragments) = match fragment_header {
        Some(fragment) => {
            let offset_and_flags = u16::from_be_bytes([fragment[2], fragment[3]]);
            let fragment_offset = offset_and_flags >> 3;
            let more_fragments = offset_and_flags & 1 != 0;

            if more_fragments && payload.len() % 8 != 0 {
                return Ok(None);
            }

            // The IPv4 identification is the low half of the IPv6 one.
            let identification = u16::from_be_bytes([fragment[6], fragment[7]]);

            (identification, fragment_offset, more_fragments)
        }
        None => (ctx.next_ipv4_frag_id(), 0, false),
    };

    let (src, dst) = match addr::map_main_6to4(
        ctx,
        ipv6_source(packet),
        ipv6_destination(packet),
    )? {
        MapOutcome::Mapped(pair) => pair,
        MapOutcome::Drop => return Ok(None),
        MapOutcome::Unreachable => {
            router::send_ipv6_address_unreachable(ctx, packet, sink)?;
            return Ok(None);
        }
    };

    let copy_tos = ctx.config.copy_dscp_ecn_6to4;
    let out_header = Ipv4Header {
        dscp: IpDscp::try_new(if copy_tos { traffic_class >> 2 } else { 0 })
            .unwrap_or(IpDscp::ZERO),
        ecn: IpEcn::try_new(if copy_tos { traffic_class & 0b11 } else { 0 })
            .unwrap_or(IpEcn::ZERO),
        total_len: 0, // Filled in on send.
        identification,
        dont_fragment: false,
        more_fragments,
        fragment_offset: IpFragOffset::try_new(fragment_offset).unwrap_or(IpFragOffset::ZERO),
        time_to_live: hop_limit - 1,
        protocol: IpNumber(protocol),
        header_checksum: 0,
        source: src.octets(),
        destination: dst.octets(),
        options: Default::default(),
    };

    Ok(Some(OutPacket {
        header: out_header,
        payload,
        offset_is_zero: fragment_offset == 0,
    }))
}

fn is_fragmented(header: &Ipv4Header) -> bool {
    header.more_fragments || header.fragment_offset.value() != 0
}

fn translate_icmp_and_send<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    sink: &mut S,
) -> Result<()> {
    // A fragment header with both offset and MF zero does not make the
    // packet a fragment; only actual fragments are refused here.
    if is_fragmented(&out.header) {
        return Ok(());
    }

    if checksum::transport_checksum_v6(
        ipv6_source(packet),
        ipv6_destination(packet),
        58,
        out.payload,
        &[],
    ) != 0
    {
        return Ok(());
    }

    let Some(message) = icmp::translate_icmpv6_to_icmpv4(ctx, out.payload)? else {
        return Ok(());
    };

    match message.tail {
        Some(tail) => send_within_mtu(ctx, packet, out, message.head(), tail, sink),
        // A head that is not a multiple of 8 bytes must travel as the
        // trailing segment so refragmentation stays 8-byte aligned.
        None => send_within_mtu(ctx, packet, out, &[], message.head(), sink),
    }
}

fn translate_tcp_and_send<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    sink: &mut S,
) -> Result<()> {
    let payload = out.payload;

    if !out.offset_is_zero || payload.len() < 20 {
        return send_within_mtu(ctx, packet, out, &[], payload, sink);
    }

    let mut rewritten = [0u8; 24];
    if payload.len() >= 24 {
        rewritten.copy_from_slice(&payload[..24]);
        patch_tcp_checksum(packet, &out.header, &mut rewritten);

        send_within_mtu(ctx, packet, out, &rewritten, &payload[24..], sink)
    } else {
        let rewritten = &mut rewritten[..payload.len()];
        rewritten.copy_from_slice(payload);
        patch_tcp_checksum(packet, &out.header, rewritten);

        let rewritten = &*rewritten;
        send_within_mtu(ctx, packet, out, &[], rewritten, sink)
    }
}

fn patch_tcp_checksum(packet: &[u8], out_header: &Ipv4Header, tcp_start: &mut [u8]) {
    let old = u16::from_be_bytes([tcp_start[16], tcp_start[17]]);
    let new = checksum::rewrite_checksum_6to4(
        old,
        ipv6_source(packet),
        ipv6_destination(packet),
        Ipv4Addr::from(out_header.source),
        Ipv4Addr::from(out_header.destination),
    );
    tcp_start[16..18].copy_from_slice(&new.to_be_bytes());
}

fn translate_udp_and_send<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    sink: &mut S,
) -> Result<()> {
    let payload = out.payload;

    if !out.offset_is_zero || payload.len() < 8 {
        return send_within_mtu(ctx, packet, out, &[], payload, sink);
    }

    let mut udp_header = [0u8; 8];
    udp_header.copy_from_slice(&payload[..8]);

    // A zero IPv6 UDP checksum is already invalid, and nothing here could
    // reconstruct a valid IPv4 one.
    let old = u16::from_be_bytes([udp_header[6], udp_header[7]]);
    if old == 0 {
        return Ok(());
    }

    let new = checksum::rewrite_checksum_6to4(
        old,
        ipv6_source(packet),
        ipv6_destination(packet),
        Ipv4Addr::from(out.header.source),
        Ipv4Addr::from(out.header.destination),
    );
    let new = if new == 0 { 0xffff } else { new };
    udp_header[6..8].copy_from_slice(&new.to_be_bytes());

    send_within_mtu(ctx, packet, out, &udp_header, &payload[8..], sink)
}

fn send_within_mtu<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    payload1: &[u8],
    payload2: &[u8],
    sink: &mut S,
) -> Result<()> {
    let config = ctx.config.clone();
    let total = Ipv4Header::MIN_LEN + payload1.len() + payload2.len();
    let ipv4_mtu = usize::from(config.ipv4_outbound_mtu);

    if total <= DF_BOUNDARY {
        out.header.dont_fragment = false;

        if total > ipv4_mtu {
            return fragment_and_send(&config, out, payload1, payload2, sink);
        }

        io::send_ipv4_packet(sink, &config, &mut out.header, payload1, payload2)?;

        return Ok(());
    }

    if total > ipv4_mtu {
        // The reported MTU accounts for the 20 bytes the packet shrinks by
        // during translation and never goes below the IPv6 minimum: a
        // 1280-byte IPv6 packet always fits through as a 1260-byte IPv4
        // packet that may be fragmented.
        let mtu = u16::max(1280, config.ipv4_outbound_mtu + 20);
        router::send_ipv6_packet_too_big(ctx, packet, sink, mtu)?;

        return Ok(());
    }

    // Big enough that the sender should learn the real path MTU: keep DF
    // set and let the downstream router handle any further fragmentation.
    out.header.dont_fragment = true;
    io::send_ipv4_packet(sink, &config, &mut out.header, payload1, payload2)?;

    Ok(())
}

fn fragment_and_send<S: PacketSink>(
    config: &crate::config::Config,
    out: &mut OutPacket<'_>,
    payload1: &[u8],
    payload2: &[u8],
    sink: &mut S,
) -> Result<()> {
    if payload1.len() % 8 != 0 {
        return Ok(()); // This should never happen.
    }

    let max_fragment_payload = (usize::from(config.ipv4_outbound_mtu) - Ipv4Header::MIN_LEN) & !7;
    let mut offset_chunks = usize::from(out.header.fragment_offset.value());
    let trailing_more_fragments = out.header.more_fragments;

    if !payload1.is_empty() {
        let more_after_part = !payload2.is_empty() || trailing_more_fragments;
        if !send_fragment_run(
            sink,
            config,
            &mut out.header,
            payload1,
            &mut offset_chunks,
            more_after_part,
            max_fragment_payload,
        )? {
            return Ok(());
        }
    }

    if !payload2.is_empty() {
        send_fragment_run(
            sink,
            config,
            &mut out.header,
            payload2,
            &mut offset_chunks,
            trailing_more_fragments,
            max_fragment_payload,
        )?;
    }

    Ok(())
}

fn send_fragment_run<S: PacketSink>(
    sink: &mut S,
    config: &crate::config::Config,
    header: &mut Ipv4Header,
    mut part: &[u8],
    offset_chunks: &mut usize,
    more_fragments_after_part: bool,
    max_fragment_payload: usize,
) -> Result<bool> {
    if more_fragments_after_part && part.len() % 8 != 0 {
        return Ok(false);
    }

    while !part.is_empty() {
        let fragment_payload_len = part.len().min(max_fragment_payload);
        let more_fragments = part.len() > max_fragment_payload || more_fragments_after_part;

        let Ok(offset) = u16::try_from(*offset_chunks)
            .map_err(drop)
            .and_then(|offset| IpFragOffset::try_new(offset).map_err(drop))
        else {
            return Ok(false);
        };

        header.fragment_offset = offset;
        header.more_fragments = more_fragments;

        io::send_ipv4_packet(sink, config, header, &part[..fragment_payload_len], &[])?;

        part = &part[fragment_payload_len..];
        *offset_chunks += fragment_payload_len / 8;
    }

    Ok(true)
}

fn ipv6_source(packet: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[8..24]);

    Ipv6Addr::from(octets)
}

fn ipv6_destination(packet: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[24..40]);

    Ipv6Addr::from(octets)
}

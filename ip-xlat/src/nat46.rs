//! IPv4 → IPv6 translation.
//!
//! The inbound header is validated strictly in order; only once the entire
//! header (including options and addresses) has been validated may an ICMP
//! error be sent back to the source. The translated packet is assembled as
//! an on-stack IPv6 header, an optional fragment extension header, an
//! optional small rewritten transport header and a borrowed payload tail.

mod icmp;

use crate::addr::{self, MapOutcome};
use crate::io::{self, PacketSink};
use crate::worker::WorkerContext;
use crate::{checksum, ip, router};
use anyhow::Result;
use etherparse::{
    IpFragOffset, IpNumber, Ipv4HeaderSlice, Ipv6FlowLabel, Ipv6FragmentHeader, Ipv6Header,
};
use std::net::Ipv6Addr;

struct OutPacket<'a> {
    header: Ipv6Header,
    fragment: Option<Ipv6FragmentHeader>,
    payload: &'a [u8],
    /// Next header after any fragment header; ICMPv4 is already mapped to 58.
    carried_protocol: u8,
    offset_is_zero: bool,
    dont_fragment: bool,
}

pub(crate) fn handle_packet<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    let Some(mut out) = validate_and_translate_header(ctx, packet, sink)? else {
        return Ok(());
    };

    // The whole IPv4 header, options included, is valid at this point, so
    // ICMP messages back to the source are fair game now.
    if out.header.hop_limit < 1 {
        router::send_ipv4_time_exceeded(ctx, packet, sink)?;
        return Ok(());
    }

    match out.carried_protocol {
        6 => translate_tcp_and_send(ctx, packet, &mut out, sink),
        17 => translate_udp_and_send(ctx, packet, &mut out, sink),
        58 => translate_icmp_and_send(ctx, packet, &mut out, sink),
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
    let Ok(header) = Ipv4HeaderSlice::from_slice(packet) else {
        return Ok(None);
    };
    let header_len = usize::from(header.ihl()) * 4;

    if usize::from(header.total_len()) != packet.len() {
        return Ok(None);
    }

    // Reserved bit of the flags field.
    if packet[6] & 0x80 != 0 {
        return Ok(None);
    }

    if header.ttl() < 1 {
        return Ok(None); // Should have been dropped a hop earlier.
    }

    if checksum::ipv4_header_checksum(&packet[..header_len]) != 0 {
        return Ok(None);
    }

    if !validate_options(header.options()) {
        return Ok(None);
    }

    let protocol = header.protocol().0;
    if ip::is_protocol_forbidden(protocol) || protocol == 58 {
        return Ok(None);
    }
    let carried_protocol = if protocol == 1 { 58 } else { protocol };

    let offset = header.fragments_offset();
    let more_fragments = header.more_fragments();

    let (src, dst) = match addr::map_main_4to6(ctx, header.source_addr(), header.destination_addr())?
    {
        MapOutcome::Mapped(pair) => pair,
        MapOutcome::Drop => return Ok(None),
        MapOutcome::Unreachable => {
            router::send_ipv4_host_unreachable(ctx, packet, sink)?;
            return Ok(None);
        }
    };

    let payload = &packet[header_len..];
    if more_fragments && payload.len() % 8 != 0 {
        return Ok(None);
    }

    let is_fragmented = offset.value() != 0 || more_fragments;
    let fragment = is_fragmented.then(|| {
        Ipv6FragmentHeader::new(
            IpNumber(carried_protocol),
            offset,
            more_fragments,
            u32::from(header.identification()),
        )
    });

    let out_header = Ipv6Header {
        traffic_class: if ctx.config.copy_dscp_ecn_4to6 { packet[1] } else { 0 },
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: 0, // Filled in on send.
        next_header: if is_fragmented { IpNumber::IPV6_FRAGMENTATION_HEADER } else { IpNumber(carried_protocol) },
        hop_limit: header.ttl() - 1,
        source: src.octets(),
        destination: dst.octets(),
    };

    Ok(Some(OutPacket {
        header: out_header,
        fragment,
        payload,
        carried_protocol,
        offset_is_zero: offset.value() == 0,
        dont_fragment: header.dont_fragment(),
    }))
}

/// RFC 7915 §4.1: options are discarded untranslated, except that an
/// unexpired source route must kill the packet.
fn validate_options(options: &[u8]) -> bool {
    let mut index = 0;

    while index < options.len() {
        let kind = options[index];
        if kind == 131 || kind == 137 {
            return false; // Loose / Strict Source Route
        }

        let length = if kind == 0 || kind == 1 {
            1 // End of Options List, No Operation
        } else {
            if options.len() - index < 2 {
                return false;
            }
            let length = usize::from(options[index + 1]);
            if length < 2 {
                return false;
            }

            length
        };

        index += length;
        if index > options.len() {
            return false;
        }
    }

    true
}

fn translate_icmp_and_send<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    sink: &mut S,
) -> Result<()> {
    // Fragmented ICMP is not translated (RFC 7915).
    if out.fragment.is_some() {
        return Ok(());
    }

    if checksum::icmpv4_checksum(out.payload, &[]) != 0 {
        return Ok(());
    }

    let Some(message) = icmp::translate_icmpv4_to_icmpv6(ctx, out.payload, &out.header)? else {
        return Ok(());
    };

    let tail = message.tail;
    send_within_mtu(ctx, packet, out, message.head(), tail, sink)
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

    // The checksum field sits at offset 16; grab the header start into a
    // stack buffer so it can be patched without touching the inbound
    // buffer. With 20 to 23 bytes present the whole header fits the buffer
    // and is sent as the only payload segment.
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

fn patch_tcp_checksum(packet: &[u8], out_header: &Ipv6Header, tcp_start: &mut [u8]) {
    let old = u16::from_be_bytes([tcp_start[16], tcp_start[17]]);
    let new = checksum::rewrite_checksum_4to6(
        old,
        ipv4_source(packet),
        ipv4_destination(packet),
        Ipv6Addr::from(out_header.source),
        Ipv6Addr::from(out_header.destination),
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

    // IPv6 requires UDP checksums; a zero checksum cannot be reconstructed.
    let old = u16::from_be_bytes([udp_header[6], udp_header[7]]);
    if old == 0 {
        return Ok(());
    }

    let new = checksum::rewrite_checksum_4to6(
        old,
        ipv4_source(packet),
        ipv4_destination(packet),
        Ipv6Addr::from(out.header.source),
        Ipv6Addr::from(out.header.destination),
    );
    let new = if new == 0 { 0xffff } else { new };
    udp_header[6..8].copy_from_slice(&new.to_be_bytes());

    send_within_mtu(ctx, packet, out, &udp_header, &payload[8..], sink)
}

/// Sends the translated packet, fragmenting or reporting back to the sender
/// if it does not fit the outbound MTU.
fn send_within_mtu<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    out: &mut OutPacket<'_>,
    payload1: &[u8],
    payload2: &[u8],
    sink: &mut S,
) -> Result<()> {
    let config = ctx.config.clone();
    let fragment_len = if out.fragment.is_some() { 8 } else { 0 };
    let total = Ipv6Header::LEN + fragment_len + payload1.len() + payload2.len();

    if total <= usize::from(config.ipv6_outbound_mtu) {
        io::send_ipv6_packet(
            sink,
            &config,
            &mut out.header,
            out.fragment.as_ref(),
            payload1,
            payload2,
        )?;

        return Ok(());
    }

    if out.dont_fragment {
        // A fragmented 1252-byte IPv4 packet is the worst case that still
        // fits a 1280-byte MTU after its 20-byte header is replaced by
        // 40 + 8 bytes of IPv6 headers; hence MTU − 28.
        router::send_ipv4_fragmentation_needed(ctx, packet, sink, config.ipv6_outbound_mtu - 28)?;

        return Ok(());
    }

    fragment_and_send(ctx, out, payload1, payload2, sink)
}

fn fragment_and_send<S: PacketSink>(
    ctx: &mut WorkerContext,
    out: &mut OutPacket<'_>,
    payload1: &[u8],
    payload2: &[u8],
    sink: &mut S,
) -> Result<()> {
    if payload1.len() % 8 != 0 {
        return Ok(()); // This should never happen.
    }

    let config = ctx.config.clone();
    // Fragment offsets count 8-byte units.
    let max_fragment_payload = (usize::from(config.ipv6_outbound_mtu) - 48) & !7;

    let (mut fragment, mut offset_chunks, trailing_more_fragments) = match out.fragment.take() {
        Some(fragment) => {
            let offset = usize::from(fragment.fragment_offset.value());
            let more = fragment.more_fragments;

            (fragment, offset, more)
        }
        None => {
            let fragment = Ipv6FragmentHeader::new(
                out.header.next_header,
                IpFragOffset::ZERO,
                false,
                ctx.next_ipv6_frag_id(),
            );
            out.header.next_header = IpNumber::IPV6_FRAGMENTATION_HEADER;

            (fragment, 0, false)
        }
    };

    if !payload1.is_empty() {
        let more_after_part = !payload2.is_empty() || trailing_more_fragments;
        if !send_fragment_run(
            sink,
            &config,
            &mut out.header,
            &mut fragment,
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
            &config,
            &mut out.header,
            &mut fragment,
            payload2,
            &mut offset_chunks,
            trailing_more_fragments,
            max_fragment_payload,
        )?;
    }

    Ok(())
}

/// Emits one payload run as a sequence of fragments. Returns `false` when
/// the run had to be abandoned (offset overflow or misaligned part).
fn send_fragment_run<S: PacketSink>(
    sink: &mut S,
    config: &crate::config::Config,
    header: &mut Ipv6Header,
    fragment: &mut Ipv6FragmentHeader,
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

        // The offset field is 13 bits wide.
        let Ok(offset) = u16::try_from(*offset_chunks)
            .map_err(drop)
            .and_then(|offset| IpFragOffset::try_new(offset).map_err(drop))
        else {
            return Ok(false);
        };

        fragment.fragment_offset = offset;
        fragment.more_fragments = more_fragments;

        io::send_ipv6_packet(
            sink,
            config,
            header,
            Some(fragment),
            &part[..fragment_payload_len],
            &[],
        )?;

        part = &part[fragment_payload_len..];
        *offset_chunks += fragment_payload_len / 8;
    }

    Ok(true)
}

fn ipv4_source(packet: &[u8]) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])
}

fn ipv4_destination(packet: &[u8]) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])
}

//! The internal router: ICMP errors sent back to the inbound packet's
//! source under the translator's own identity.
//!
//! Quotes of the offending packet are clamped so that a generated error
//! always fits the smallest MTU this program accepts: 68 bytes of quote
//! keep the ICMPv4 message within 96 bytes, 1232 bytes keep the ICMPv6
//! message within 1280.

use crate::io::{self, PacketSink};
use crate::worker::WorkerContext;
use crate::checksum;
use etherparse::{IpNumber, Ipv4Header, Ipv6FlowLabel, Ipv6Header};
use std::io::Result;

const MAX_ICMPV4_QUOTE: usize = 68;
const MAX_ICMPV6_QUOTE: usize = 1232;

pub(crate) fn send_ipv4_host_unreachable<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    send_icmpv4(ctx, in_packet, sink, 3, 1, 0)
}

pub(crate) fn send_ipv4_time_exceeded<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    send_icmpv4(ctx, in_packet, sink, 11, 0, 0)
}

pub(crate) fn send_ipv4_fragmentation_needed<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
    next_hop_mtu: u16,
) -> Result<()> {
    send_icmpv4(ctx, in_packet, sink, 3, 4, next_hop_mtu)
}

pub(crate) fn send_ipv6_address_unreachable<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    send_icmpv6(ctx, in_packet, sink, 1, 3, 0)
}

pub(crate) fn send_ipv6_time_exceeded<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    send_icmpv6(ctx, in_packet, sink, 3, 0, 0)
}

pub(crate) fn send_ipv6_packet_too_big<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
    mtu: u16,
) -> Result<()> {
    send_icmpv6(ctx, in_packet, sink, 2, 0, mtu)
}

fn send_icmpv4<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
    icmp_type: u8,
    icmp_code: u8,
    rest_of_header: u16,
) -> Result<()> {
    if in_packet.len() < 20 || in_packet[0] >> 4 != 4 {
        return Ok(());
    }

    let config = ctx.config.clone();
    let mut header = Ipv4Header {
        identification: ctx.next_ipv4_frag_id(),
        dont_fragment: false,
        time_to_live: config.generated_packet_ttl,
        protocol: IpNumber::ICMP,
        source: config.router_ipv4.octets(),
        destination: [in_packet[12], in_packet[13], in_packet[14], in_packet[15]],
        ..Default::default()
    };

    let mut icmp_header = [0u8; 8];
    icmp_header[0] = icmp_type;
    icmp_header[1] = icmp_code;
    icmp_header[6..8].copy_from_slice(&rest_of_header.to_be_bytes());

    let quote = &in_packet[..in_packet.len().min(MAX_ICMPV4_QUOTE)];
    let checksum = checksum::icmpv4_checksum(&icmp_header, quote);
    icmp_header[2..4].copy_from_slice(&checksum.to_be_bytes());

    io::send_ipv4_packet(sink, &config, &mut header, &icmp_header, quote)
}

fn send_icmpv6<S: PacketSink>(
    ctx: &mut WorkerContext,
    in_packet: &[u8],
    sink: &mut S,
    icmp_type: u8,
    icmp_code: u8,
    rest_of_header: u16,
) -> Result<()> {
    if in_packet.len() < 40 || in_packet[0] >> 4 != 6 {
        return Ok(());
    }

    let config = ctx.config.clone();
    let mut source_octets = [0u8; 16];
    source_octets.copy_from_slice(&in_packet[8..24]);

    let mut header = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: 0,
        next_header: IpNumber::IPV6_ICMP,
        hop_limit: config.generated_packet_ttl,
        source: config.router_ipv6.octets(),
        destination: source_octets,
    };

    let mut icmp_header = [0u8; 8];
    icmp_header[0] = icmp_type;
    icmp_header[1] = icmp_code;
    icmp_header[6..8].copy_from_slice(&rest_of_header.to_be_bytes());

    let quote = &in_packet[..in_packet.len().min(MAX_ICMPV6_QUOTE)];
    let checksum = checksum::transport_checksum_v6(
        config.router_ipv6,
        source_octets.into(),
        58,
        &icmp_header,
        quote,
    );
    icmp_header[2..4].copy_from_slice(&checksum.to_be_bytes());

    io::send_ipv6_packet(sink, &config, &mut header, None, &icmp_header, quote)
}

//! End-to-end translation tests: whole packets in, whole packets out.

use ip_xlat::config::{Addressing, Config, ExternalConfig, ExternalTransport};
use ip_xlat::{VecSink, WorkerContext, checksum, translate_packet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

const ROUTER_IPV4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

fn router_ipv6() -> Ipv6Addr {
    "2001:db8::1".parse().unwrap()
}

fn siit_config() -> Config {
    Config {
        addressing: Addressing::Siit {
            prefix: "64:ff9b::".parse().unwrap(),
            allow_private: true,
        },
        router_ipv4: ROUTER_IPV4,
        router_ipv6: router_ipv6(),
        generated_packet_ttl: 64,
        ipv4_outbound_mtu: 1500,
        ipv6_outbound_mtu: 1500,
        copy_dscp_ecn_4to6: true,
        copy_dscp_ecn_6to4: true,
        workers: 1,
    }
}

fn ctx(config: Config) -> WorkerContext {
    config.validate().unwrap();
    WorkerContext::new(1, Arc::new(config), None)
}

fn translate(ctx: &mut WorkerContext, packet: &[u8]) -> Vec<Vec<u8>> {
    let mut sink = VecSink::new();
    translate_packet(ctx, packet, &mut sink).unwrap();

    sink.packets
}

/// A minimal unfragmented IPv4 packet with a correct header checksum.
fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_packet_with_frag(src, dst, protocol, ttl, payload, 0, false, false, 0)
}

#[allow(clippy::too_many_arguments)]
fn ipv4_packet_with_frag(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload: &[u8],
    offset_units: u16,
    more_fragments: bool,
    dont_fragment: bool,
    identification: u16,
) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&identification.to_be_bytes());
    let flags_and_offset =
        offset_units | u16::from(more_fragments) << 13 | u16::from(dont_fragment) << 14;
    packet[6..8].copy_from_slice(&flags_and_offset.to_be_bytes());
    packet[8] = ttl;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());

    let header_checksum = checksum::ipv4_header_checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    packet[20..].copy_from_slice(payload);

    packet
}

fn ipv6_packet(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    hop_limit: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = vec![0u8; 40 + payload.len()];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    packet[6] = next_header;
    packet[7] = hop_limit;
    packet[8..24].copy_from_slice(&src.octets());
    packet[24..40].copy_from_slice(&dst.octets());
    packet[40..].copy_from_slice(payload);

    packet
}

fn icmpv4_echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut message = vec![0u8; 8 + data.len()];
    message[0] = 8;
    message[4..6].copy_from_slice(&identifier.to_be_bytes());
    message[6..8].copy_from_slice(&sequence.to_be_bytes());
    message[8..].copy_from_slice(data);

    let icmp_checksum = checksum::icmpv4_checksum(&message, &[]);
    message[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    message
}

fn icmpv6_message(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    icmp_type: u8,
    icmp_code: u8,
    rest: [u8; 4],
    body: &[u8],
) -> Vec<u8> {
    let mut message = vec![0u8; 8 + body.len()];
    message[0] = icmp_type;
    message[1] = icmp_code;
    message[4..8].copy_from_slice(&rest);
    message[8..].copy_from_slice(body);

    let icmp_checksum = checksum::transport_checksum_v6(src, dst, 58, &message, &[]);
    message[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    message
}

fn udp_payload_v4(src: Ipv4Addr, dst: Ipv4Addr, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 8 + data.len()];
    payload[0..2].copy_from_slice(&4242u16.to_be_bytes());
    payload[2..4].copy_from_slice(&53u16.to_be_bytes());
    let payload_len = payload.len() as u16;
    payload[4..6].copy_from_slice(&payload_len.to_be_bytes());
    payload[8..].copy_from_slice(data);

    let udp_checksum = checksum::transport_checksum_v4(src, dst, 17, &payload, &[]);
    payload[6..8].copy_from_slice(&(if udp_checksum == 0 { 0xffff } else { udp_checksum }).to_be_bytes());

    payload
}

// --- 4 → 6 ---

#[test]
fn echo_request_through_siit() {
    let src = Ipv4Addr::new(198, 51, 100, 2);
    let dst = Ipv4Addr::new(192, 0, 2, 33);
    let echo = icmpv4_echo_request(0x1234, 1, b"ping");
    let packet = ipv4_packet(src, dst, 1, 64, &echo);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];

    let expected_src: Ipv6Addr = "64:ff9b::c633:6402".parse().unwrap();
    let expected_dst: Ipv6Addr = "64:ff9b::c000:221".parse().unwrap();

    assert_eq!(out.len(), 40 + 8 + 4);
    assert_eq!(out[0] >> 4, 6);
    assert_eq!(u16::from_be_bytes([out[4], out[5]]), 12); // payload length
    assert_eq!(out[6], 58);
    assert_eq!(out[7], 63); // decremented hop limit
    assert_eq!(&out[8..24], &expected_src.octets());
    assert_eq!(&out[24..40], &expected_dst.octets());

    assert_eq!(out[40], 128); // Echo Request
    assert_eq!(out[41], 0);
    assert_eq!(u16::from_be_bytes([out[44], out[45]]), 0x1234);
    assert_eq!(u16::from_be_bytes([out[46], out[47]]), 1);
    assert_eq!(&out[48..], b"ping");

    assert_eq!(
        checksum::transport_checksum_v6(expected_src, expected_dst, 58, &out[40..], &[]),
        0
    );
}

#[test]
fn df_packet_larger_than_ipv6_mtu_answers_fragmentation_needed() {
    let mut config = siit_config();
    config.ipv6_outbound_mtu = 1280;

    let src = Ipv4Addr::new(8, 8, 8, 8);
    let payload = vec![0u8; 1480];
    let packet =
        ipv4_packet_with_frag(src, Ipv4Addr::new(1, 1, 1, 1), 50, 64, &payload, 0, false, true, 0);
    assert_eq!(packet.len(), 1500);

    let packets = translate(&mut ctx(config), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[0] >> 4, 4);
    assert_eq!(out[9], 1); // ICMPv4
    assert_eq!(&out[12..16], &ROUTER_IPV4.octets());
    assert_eq!(&out[16..20], &src.octets());
    assert_eq!(out[20], 3);
    assert_eq!(out[21], 4);
    assert_eq!(u16::from_be_bytes([out[26], out[27]]), 1252);
    assert_eq!(out.len(), 28 + 68);
}

#[test]
fn oversized_packet_without_df_is_refragmented() {
    let mut config = siit_config();
    config.ipv6_outbound_mtu = 1280;

    let payload = vec![0xabu8; 1480];
    let packet = ipv4_packet(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1), 50, 64, &payload);

    let packets = translate(&mut ctx(config), &packet);

    assert_eq!(packets.len(), 2);

    let first = &packets[0];
    assert_eq!(first.len(), 40 + 8 + 1232);
    assert_eq!(first[6], 44); // fragment header
    assert_eq!(first[40], 50); // carried protocol
    let first_offset_and_flags = u16::from_be_bytes([first[42], first[43]]);
    assert_eq!(first_offset_and_flags >> 3, 0);
    assert_eq!(first_offset_and_flags & 1, 1); // more fragments

    let second = &packets[1];
    assert_eq!(second.len(), 40 + 8 + 248);
    let second_offset_and_flags = u16::from_be_bytes([second[42], second[43]]);
    assert_eq!(second_offset_and_flags >> 3, 1232 / 8);
    assert_eq!(second_offset_and_flags & 1, 0);

    // Same identification on every fragment.
    assert_eq!(&first[44..48], &second[44..48]);

    // Payload bytes survive intact.
    assert_eq!(&first[48..], &payload[..1232]);
    assert_eq!(&second[48..], &payload[1232..]);
}

#[test]
fn fragment_offset_and_id_are_preserved_4to6() {
    let payload = vec![0u8; 64];
    let packet = ipv4_packet_with_frag(
        Ipv4Addr::new(8, 8, 8, 8),
        Ipv4Addr::new(1, 1, 1, 1),
        17,
        64,
        &payload,
        100,
        true,
        false,
        0xbeef,
    );

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[6], 44);
    assert_eq!(out[40], 17);
    let offset_and_flags = u16::from_be_bytes([out[42], out[43]]);
    assert_eq!(offset_and_flags >> 3, 100);
    assert_eq!(offset_and_flags & 1, 1);
    assert_eq!(u32::from_be_bytes([out[44], out[45], out[46], out[47]]), 0xbeef);
}

#[test]
fn udp_with_zero_checksum_is_dropped_4to6() {
    let src = Ipv4Addr::new(8, 8, 8, 8);
    let dst = Ipv4Addr::new(1, 1, 1, 1);
    let mut payload = udp_payload_v4(src, dst, b"hello");
    payload[6] = 0;
    payload[7] = 0;
    let packet = ipv4_packet(src, dst, 17, 64, &payload);

    assert!(translate(&mut ctx(siit_config()), &packet).is_empty());
}

#[test]
fn udp_checksum_is_rewritten_incrementally_4to6() {
    let src = Ipv4Addr::new(8, 8, 8, 8);
    let dst = Ipv4Addr::new(1, 1, 1, 1);
    let payload = udp_payload_v4(src, dst, b"hello");
    let packet = ipv4_packet(src, dst, 17, 64, &payload);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[6], 17);

    let out_src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let out_dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();
    assert_eq!(
        checksum::transport_checksum_v6(out_src, out_dst, 17, &out[40..], &[]),
        0
    );
}

#[test]
fn tcp_checksum_is_rewritten_incrementally_4to6() {
    let src = Ipv4Addr::new(8, 8, 8, 8);
    let dst = Ipv4Addr::new(1, 1, 1, 1);

    let mut tcp = vec![0u8; 20 + 12];
    tcp[0..2].copy_from_slice(&4242u16.to_be_bytes());
    tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
    tcp[12] = 5 << 4; // data offset
    tcp[20..].copy_from_slice(b"hello, world");
    let tcp_checksum = checksum::transport_checksum_v4(src, dst, 6, &tcp, &[]);
    tcp[16..18].copy_from_slice(&tcp_checksum.to_be_bytes());

    let packet = ipv4_packet(src, dst, 6, 64, &tcp);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    let out_src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let out_dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();
    assert_eq!(&out[40..][..16], &tcp[..16]); // ports, seq and ack untouched
    assert_eq!(
        checksum::transport_checksum_v6(out_src, out_dst, 6, &out[40..], &[]),
        0
    );
}

#[test]
fn forbidden_protocol_is_dropped_silently() {
    let packet = ipv4_packet(
        Ipv4Addr::new(8, 8, 8, 8),
        Ipv4Addr::new(1, 1, 1, 1),
        43,
        64,
        &[0u8; 16],
    );

    assert!(translate(&mut ctx(siit_config()), &packet).is_empty());
}

#[test]
fn expired_ttl_answers_time_exceeded() {
    let payload = udp_payload_v4(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1), b"x");
    let packet = ipv4_packet(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1), 17, 1, &payload);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[9], 1);
    assert_eq!(out[20], 11);
    assert_eq!(out[21], 0);
    assert_eq!(&out[16..20], &[8, 8, 8, 8]);
}

#[test]
fn source_route_option_kills_the_packet() {
    let src = Ipv4Addr::new(8, 8, 8, 8);
    let dst = Ipv4Addr::new(1, 1, 1, 1);
    let payload = udp_payload_v4(src, dst, b"x");

    // 24-byte header: IHL 6 with a loose-source-route option.
    let total_len = 24 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x46;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20] = 131;
    packet[21] = 4;
    let header_checksum = checksum::ipv4_header_checksum(&packet[..24]);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());
    packet[24..].copy_from_slice(&payload);

    assert!(translate(&mut ctx(siit_config()), &packet).is_empty());
}

#[test]
fn icmp_error_with_quoted_packet_is_translated_4to6() {
    let reporter = Ipv4Addr::new(8, 8, 8, 8);
    let victim = Ipv4Addr::new(1, 1, 1, 1);

    // The quoted packet: a UDP datagram the victim had sent.
    let quoted_udp = udp_payload_v4(victim, reporter, b"original");
    let quoted = ipv4_packet(victim, reporter, 17, 63, &quoted_udp);

    // Port Unreachable carrying the quoted packet.
    let mut icmp = vec![0u8; 8 + quoted.len()];
    icmp[0] = 3;
    icmp[1] = 3;
    icmp[8..].copy_from_slice(&quoted);
    let icmp_checksum = checksum::icmpv4_checksum(&icmp, &[]);
    icmp[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    let packet = ipv4_packet(reporter, victim, 1, 64, &icmp);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];

    assert_eq!(out[6], 58);
    assert_eq!(out[40], 1); // Destination Unreachable
    assert_eq!(out[41], 4); // Port Unreachable

    // The quoted packet was translated too: an IPv6 header whose addresses
    // are the prefix-mapped victim and reporter, carrying the original UDP.
    let inner = &out[48..];
    assert_eq!(inner[0] >> 4, 6);
    assert_eq!(inner[6], 17);
    assert_eq!(inner[7], 63); // inner hop limit is not decremented
    assert_eq!(&inner[8..24], &"64:ff9b::101:101".parse::<Ipv6Addr>().unwrap().octets());
    assert_eq!(&inner[24..40], &"64:ff9b::808:808".parse::<Ipv6Addr>().unwrap().octets());
    assert_eq!(&inner[40..48], &quoted_udp[..8]);

    let out_src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let out_dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();
    assert_eq!(
        checksum::transport_checksum_v6(out_src, out_dst, 58, &out[40..], &[]),
        0
    );
}

// --- 6 → 4 ---

#[test]
fn echo_reply_through_siit_6to4() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let mut echo = vec![0u8; 8 + 4];
    echo[0] = 129;
    echo[4..6].copy_from_slice(&0x4321u16.to_be_bytes());
    echo[6..8].copy_from_slice(&7u16.to_be_bytes());
    echo[8..].copy_from_slice(b"pong");
    let echo_checksum = checksum::transport_checksum_v6(src, dst, 58, &echo, &[]);
    echo[2..4].copy_from_slice(&echo_checksum.to_be_bytes());

    let packet = ipv6_packet(src, dst, 58, 64, &echo);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];

    assert_eq!(out[0], 0x45);
    assert_eq!(out[8], 63); // decremented TTL
    assert_eq!(out[9], 1);
    assert_eq!(&out[12..16], &[8, 8, 8, 8]);
    assert_eq!(&out[16..20], &[1, 1, 1, 1]);
    assert_eq!(checksum::ipv4_header_checksum(&out[..20]), 0);

    assert_eq!(out[20], 0); // Echo Reply
    assert_eq!(u16::from_be_bytes([out[24], out[25]]), 0x4321);
    assert_eq!(&out[28..], b"pong");
    assert_eq!(checksum::icmpv4_checksum(&out[20..], &[]), 0);
}

#[test]
fn packet_too_big_is_sent_when_ipv4_mtu_is_exceeded() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let payload = vec![0u8; 1500];
    let packet = ipv6_packet(src, dst, 50, 64, &payload);
    assert_eq!(packet.len(), 1540);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[0] >> 4, 6);
    assert_eq!(out[6], 58);
    assert_eq!(&out[8..24], &router_ipv6().octets());
    assert_eq!(&out[24..40], &src.octets());
    assert_eq!(out[40], 2); // Packet Too Big
    assert_eq!(out[41], 0);
    assert_eq!(u16::from_be_bytes([out[46], out[47]]), 1520);
}

#[test]
fn large_packet_within_ipv4_mtu_travels_with_df() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let payload = vec![0u8; 1460];
    let packet = ipv6_packet(src, dst, 50, 64, &payload);
    assert_eq!(packet.len(), 1500);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out.len(), 1480);
    assert_ne!(out[6] & 0x40, 0); // DF set
}

#[test]
fn small_packet_travels_with_df_clear() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let payload = vec![0u8; 64];
    let packet = ipv6_packet(src, dst, 50, 64, &payload);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][6] & 0x40, 0);
}

#[test]
fn hop_limit_expiry_answers_time_exceeded() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let payload = vec![0u8; 1400];
    let packet = ipv6_packet(src, dst, 50, 1, &payload);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[0] >> 4, 6);
    assert_eq!(out[6], 58);
    assert_eq!(&out[24..40], &src.octets());
    assert_eq!(out[40], 3); // Time Exceeded
    assert_eq!(out[41], 0);
    // Full packet would be 1448 bytes; the quote is clamped to 1232.
    assert_eq!(out.len(), 40 + 8 + 1232);
    assert_eq!(&out[48..88], &packet[..40]);
}

#[test]
fn fragment_header_is_collapsed_into_ipv4_fragment_fields() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let mut payload = vec![0u8; 8 + 64];
    payload[0] = 17; // next header after the fragment header
    payload[2..4].copy_from_slice(&((100u16 << 3) | 1).to_be_bytes());
    payload[4..8].copy_from_slice(&0xcafe_beefu32.to_be_bytes());

    let packet = ipv6_packet(src, dst, 44, 64, &payload);
    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[9], 17);
    assert_eq!(u16::from_be_bytes([out[4], out[5]]), 0xbeef);
    let flags_and_offset = u16::from_be_bytes([out[6], out[7]]);
    assert_eq!(flags_and_offset & 0x1fff, 100);
    assert_ne!(flags_and_offset & 0x2000, 0); // MF
    assert_eq!(flags_and_offset & 0x4000, 0); // DF clear
    assert_eq!(out.len(), 20 + 64);
}

#[test]
fn routing_header_with_segments_left_is_dropped() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let mut payload = vec![0u8; 8 + 8];
    payload[0] = 17;
    payload[1] = 0;
    payload[2] = 0; // routing type
    payload[3] = 1; // segments left
    let packet = ipv6_packet(src, dst, 43, 64, &payload);

    assert!(translate(&mut ctx(siit_config()), &packet).is_empty());
}

#[test]
fn icmpv6_error_with_quoted_packet_is_translated_6to4() {
    let reporter: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let victim: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    // The quoted packet: a UDP datagram the victim had sent over IPv6.
    let mut quoted_udp = vec![0u8; 8 + 8];
    quoted_udp[0..2].copy_from_slice(&4242u16.to_be_bytes());
    quoted_udp[2..4].copy_from_slice(&53u16.to_be_bytes());
    let quoted_udp_len = quoted_udp.len() as u16;
    quoted_udp[4..6].copy_from_slice(&quoted_udp_len.to_be_bytes());
    let quoted_checksum =
        checksum::transport_checksum_v6(victim, reporter, 17, &quoted_udp, &[]);
    quoted_udp[6..8].copy_from_slice(&quoted_checksum.to_be_bytes());
    let quoted = ipv6_packet(victim, reporter, 17, 63, &quoted_udp);

    let icmp = icmpv6_message(reporter, victim, 1, 4, [0; 4], &quoted);
    let packet = ipv6_packet(reporter, victim, 58, 64, &icmp);

    let packets = translate(&mut ctx(siit_config()), &packet);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];

    assert_eq!(out[9], 1);
    assert_eq!(out[20], 3); // Destination Unreachable
    assert_eq!(out[21], 3); // Port Unreachable

    // The quoted IPv6 packet shrank into an IPv4 one.
    let inner = &out[28..];
    assert_eq!(inner[0], 0x45);
    assert_eq!(inner[9], 17);
    assert_eq!(inner[8], 63); // inner TTL is not decremented
    assert_eq!(&inner[12..16], &[1, 1, 1, 1]);
    assert_eq!(&inner[16..20], &[8, 8, 8, 8]);
    assert_eq!(checksum::ipv4_header_checksum(&inner[..20]), 0);
    assert_eq!(u16::from_be_bytes([inner[2], inner[3]]), 20 + 16);
    assert_eq!(&inner[20..28], &quoted_udp[..8]);

    assert_eq!(checksum::icmpv4_checksum(&out[20..], &[]), 0);
}

#[test]
fn icmpv6_with_bad_checksum_is_dropped() {
    let src: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
    let dst: Ipv6Addr = "64:ff9b::101:101".parse().unwrap();

    let mut echo = icmpv6_message(src, dst, 129, 0, [0; 4], b"pong");
    echo[2] ^= 0xff;
    let packet = ipv6_packet(src, dst, 58, 64, &echo);

    assert!(translate(&mut ctx(siit_config()), &packet).is_empty());
}

// --- external addressing mode ---

#[test]
fn external_icmp_error_verdict_triggers_host_unreachable() {
    use std::io::{Read as _, Write as _};
    use std::os::unix::net::UnixListener;

    let path = std::env::temp_dir().join(format!("ip-xlat-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let helper = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut frame = [0u8; 40];
        stream.read_exact(&mut frame).unwrap();
        assert_eq!(frame[0], 0x54);
        assert_eq!(frame[2], 1); // 4→6 main request
        frame[2] |= 0xe0;
        stream.write_all(&frame).unwrap();
    });

    let config = Config {
        addressing: Addressing::External(ExternalConfig {
            transport: ExternalTransport::Unix { path: path.clone() },
            timeout: Duration::from_millis(500),
            cache_size_main: 16,
            cache_size_icmp: 16,
        }),
        ..siit_config()
    };

    let src = Ipv4Addr::new(8, 8, 8, 8);
    let payload = udp_payload_v4(src, Ipv4Addr::new(1, 1, 1, 1), b"x");
    let packet = ipv4_packet(src, Ipv4Addr::new(1, 1, 1, 1), 17, 64, &payload);

    let packets = translate(&mut ctx(config), &packet);
    helper.join().unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(packets.len(), 1);
    let out = &packets[0];
    assert_eq!(out[9], 1);
    assert_eq!(out[20], 3); // Destination Host Unreachable
    assert_eq!(out[21], 1);
    assert_eq!(&out[16..20], &src.octets());
}

//! Outbound packet assembly.
//!
//! Translators never copy payload bytes around: a finished packet is a small
//! stack-built header (plus, for IPv6, an optional fragment extension
//! header) followed by slices borrowed from the inbound buffer. This module
//! derives the remaining header fields (lengths, IPv4 header checksum),
//! enforces the outbound MTU and hands the segments to a [`PacketSink`].

use crate::config::Config;
use etherparse::{Ipv4Header, Ipv6Header, Ipv6FragmentHeader};
use std::io::{self, IoSlice};

/// Where finished packets go. Implemented with `writev` on the worker's
/// file descriptor in production and by [`VecSink`] in tests.
pub trait PacketSink {
    /// Writes one complete IP packet. The full byte count must be accepted
    /// in a single call; partial acceptance is an error.
    fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()>;
}

/// Finalizes and sends an IPv4 packet. Oversized packets are dropped here as
/// a last resort; callers are expected to have fragmented or replied first.
pub(crate) fn send_ipv4_packet<S: PacketSink>(
    sink: &mut S,
    config: &Config,
    header: &mut Ipv4Header,
    payload1: &[u8],
    payload2: &[u8],
) -> io::Result<()> {
    let total_len = Ipv4Header::MIN_LEN + payload1.len() + payload2.len();
    if total_len > usize::from(config.ipv4_outbound_mtu) {
        return Ok(());
    }

    header.total_len = total_len as u16;
    header.header_checksum = header.calc_header_checksum();
    let header_bytes = header.to_bytes();

    let mut segments = [IoSlice::new(&[]); 3];
    let mut count = 0;
    for segment in [&header_bytes[..], payload1, payload2] {
        if !segment.is_empty() {
            segments[count] = IoSlice::new(segment);
            count += 1;
        }
    }

    sink.send(&segments[..count])
}

/// Finalizes and sends an IPv6 packet with an optional fragment header.
pub(crate) fn send_ipv6_packet<S: PacketSink>(
    sink: &mut S,
    config: &Config,
    header: &mut Ipv6Header,
    fragment_header: Option<&Ipv6FragmentHeader>,
    payload1: &[u8],
    payload2: &[u8],
) -> io::Result<()> {
    let fragment_len = if fragment_header.is_some() { 8 } else { 0 };
    let total_len = Ipv6Header::LEN + fragment_len + payload1.len() + payload2.len();
    if total_len > usize::from(config.ipv6_outbound_mtu) {
        return Ok(());
    }

    header.payload_length = (total_len - Ipv6Header::LEN) as u16;
    let header_bytes = header.to_bytes();
    let fragment_bytes = fragment_header.map(fragment_header_bytes);

    let mut segments = [IoSlice::new(&[]); 4];
    let mut count = 0;
    for segment in [
        &header_bytes[..],
        fragment_bytes.as_ref().map(|bytes| &bytes[..]).unwrap_or(&[]),
        payload1,
        payload2,
    ] {
        if !segment.is_empty() {
            segments[count] = IoSlice::new(segment);
            count += 1;
        }
    }

    sink.send(&segments[..count])
}

/// On-the-wire form of a fragment extension header: next header, a
/// reserved byte, 13 bits of offset plus 2 reserved bits plus the M flag,
/// and the 32-bit identification.
pub(crate) fn fragment_header_bytes(fragment: &Ipv6FragmentHeader) -> [u8; 8] {
    let offset_and_flags =
        (fragment.fragment_offset.value() << 3) | u16::from(fragment.more_fragments);

    let mut bytes = [0u8; 8];
    bytes[0] = fragment.next_header.0;
    bytes[2..4].copy_from_slice(&offset_and_flags.to_be_bytes());
    bytes[4..8].copy_from_slice(&fragment.identification.to_be_bytes());

    bytes
}

/// Collects every sent packet as a contiguous byte vector. Test helper.
#[derive(Debug, Default)]
pub struct VecSink {
    pub packets: Vec<Vec<u8>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single_packet(&self) -> &[u8] {
        assert_eq!(self.packets.len(), 1, "expected exactly one emitted packet");
        &self.packets[0]
    }
}

impl PacketSink for VecSink {
    fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
        let mut packet = Vec::new();
        for segment in segments {
            packet.extend_from_slice(segment);
        }
        self.packets.push(packet);

        Ok(())
    }
}

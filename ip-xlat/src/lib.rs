//! Stateless IP/ICMP translation between IPv4 and IPv6 (RFC 7915), with the
//! NAT64, CLAT and SIIT addressing flavours plus an external address-mapping
//! protocol.
//!
//! The library is the whole data plane: packets come in as raw IP frames,
//! are validated, translated (headers rewritten, checksums fixed up, ICMP
//! messages re-expressed in the other family) and handed back to a
//! [`PacketSink`] as scatter-gather segments. Everything else — TUN devices,
//! CLI, signals — lives in the binary crate.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod addr;
pub mod checksum;
pub mod config;
mod external;
mod ip;
pub mod io;
mod nat46;
mod nat64;
mod router;
mod sys;
pub mod worker;

pub use config::{Addressing, Config, EndpointPair, ExternalConfig, ExternalTransport};
pub use io::{PacketSink, VecSink};
pub use worker::{WorkerContext, WorkerPool};

use anyhow::Result;

/// The largest IP packet a worker will read or emit.
pub const MAX_PACKET_SIZE: usize = 65535;

/// A broken internal invariant. The process exits with a dedicated code so
/// operators can tell these apart from ordinary crashes.
#[derive(Debug, thiserror::Error)]
#[error("invalid internal state: {0}")]
pub struct InvariantViolation(pub &'static str);

/// Translates one inbound IP frame, writing any resulting packets to `sink`.
///
/// Untranslatable input is dropped without an error; ICMP errors owed to the
/// sender are emitted through the same sink. An `Err` means the worker is no
/// longer usable (primary FD failure or a broken inherited mapper FD).
pub fn translate_packet<S: PacketSink>(
    ctx: &mut WorkerContext,
    packet: &[u8],
    sink: &mut S,
) -> Result<()> {
    if packet.len() < 20 {
        return Ok(());
    }

    match packet[0] >> 4 {
        4 => nat46::handle_packet(ctx, packet, sink),
        6 => nat64::handle_packet(ctx, packet, sink),
        _ => Ok(()),
    }
}

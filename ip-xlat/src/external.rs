//! The external address mapper: address pairs are resolved by a helper
//! process over a stream socket, speaking fixed 40-byte frames, with a
//! per-worker cache in front.
//!
//! Failure policy: protocol violations close the socket and drop the
//! current packet; the next packet reconnects lazily. The inherited-FDs
//! transport has nothing to reconnect to, so a failed FD pair is fatal to
//! the worker.

use crate::addr::MapOutcome;
use crate::config::{Config, ExternalConfig, ExternalTransport};
use crate::{ip, sys};
use anyhow::{Result, bail};
use std::net::{Ipv4Addr, Ipv6Addr, TcpStream, ToSocketAddrs as _};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

const MAGIC: u8 = 0x54;
const PROTOCOL_VERSION: u8 = 1;
const FRAME_LEN: usize = 40;

const TYPE_MAIN_4TO6: u8 = 1;
const TYPE_INNER_4TO6: u8 = 2;
const TYPE_MAIN_6TO4: u8 = 3;
const TYPE_INNER_6TO4: u8 = 4;

const RESPONSE: u8 = 0x80;
const RESPONSE_ERROR: u8 = 0xC0;
const RESPONSE_ICMP_ERROR: u8 = 0xE0;

pub(crate) struct ExternalState {
    conn: Option<Conn>,
    next_request_id: u32,
    cache_main_4to6: Cache,
    cache_inner_4to6: Cache,
    cache_main_6to4: Cache,
    cache_inner_6to4: Cache,
}

impl ExternalState {
    pub(crate) fn new(config: &ExternalConfig, inherited: Option<(OwnedFd, OwnedFd)>) -> Self {
        Self {
            conn: inherited.map(|(read, write)| Conn::Inherited { read, write }),
            next_request_id: rand::random(),
            cache_main_4to6: Cache::new(config.cache_size_main),
            cache_inner_4to6: Cache::new(config.cache_size_icmp),
            cache_main_6to4: Cache::new(config.cache_size_main),
            cache_inner_6to4: Cache::new(config.cache_size_icmp),
        }
    }
}

pub(crate) fn map_main_4to6(
    state: &mut ExternalState,
    config: &Config,
    external: &ExternalConfig,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<MapOutcome<(Ipv6Addr, Ipv6Addr)>> {
    if let Some(pair) = state.cache_main_4to6.get_4to6(src, dst) {
        return Ok(MapOutcome::Mapped(pair));
    }

    if ip::is_ipv4_unusable(src)
        || src == config.router_ipv4
        || ip::is_ipv4_unusable(dst)
        || dst == config.router_ipv4
    {
        return Ok(MapOutcome::Drop);
    }

    let frame = match exchange(state, external, TYPE_MAIN_4TO6, pad_v4(src), pad_v4(dst))? {
        Exchange::Response(frame) => frame,
        Exchange::Drop => return Ok(MapOutcome::Drop),
        Exchange::IcmpError => return Ok(MapOutcome::Unreachable),
    };

    let (out_src, out_dst, lifetime) = decode_v6_response(&frame);
    if ip::is_ipv6_unusable(out_src)
        || out_src == config.router_ipv6
        || ip::is_ipv6_unusable(out_dst)
        || out_dst == config.router_ipv6
    {
        return Ok(MapOutcome::Drop);
    }

    state
        .cache_main_4to6
        .store_by_v4((src, dst), (out_src, out_dst), lifetime);

    Ok(MapOutcome::Mapped((out_src, out_dst)))
}

pub(crate) fn map_inner_4to6(
    state: &mut ExternalState,
    _config: &Config,
    external: &ExternalConfig,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<MapOutcome<(Ipv6Addr, Ipv6Addr)>> {
    if let Some(pair) = state.cache_inner_4to6.get_4to6(src, dst) {
        return Ok(MapOutcome::Mapped(pair));
    }

    let frame = match exchange(state, external, TYPE_INNER_4TO6, pad_v4(src), pad_v4(dst))? {
        Exchange::Response(frame) => frame,
        Exchange::Drop | Exchange::IcmpError => return Ok(MapOutcome::Drop),
    };

    let (out_src, out_dst, lifetime) = decode_v6_response(&frame);
    state
        .cache_inner_4to6
        .store_by_v4((src, dst), (out_src, out_dst), lifetime);

    Ok(MapOutcome::Mapped((out_src, out_dst)))
}

pub(crate) fn map_main_6to4(
    state: &mut ExternalState,
    config: &Config,
    external: &ExternalConfig,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<MapOutcome<(Ipv4Addr, Ipv4Addr)>> {
    if let Some(pair) = state.cache_main_6to4.get_6to4(src, dst) {
        return Ok(MapOutcome::Mapped(pair));
    }

    if ip::is_ipv6_unusable(src)
        || src == config.router_ipv6
        || ip::is_ipv6_unusable(dst)
        || dst == config.router_ipv6
    {
        return Ok(MapOutcome::Drop);
    }

    let frame = match exchange(state, external, TYPE_MAIN_6TO4, src.octets(), dst.octets())? {
        Exchange::Response(frame) => frame,
        Exchange::Drop => return Ok(MapOutcome::Drop),
        Exchange::IcmpError => return Ok(MapOutcome::Unreachable),
    };

    let (out_src, out_dst) = decode_v4_addrs(&frame);
    if ip::is_ipv4_unusable(out_src)
        || out_src == config.router_ipv4
        || ip::is_ipv4_unusable(out_dst)
        || out_dst == config.router_ipv4
    {
        return Ok(MapOutcome::Drop);
    }
    if !v4_padding_is_zero(&frame) {
        tracing::warn!("External mapper sent an IPv4 response with non-zero padding");
        disconnect(state, external)?;
        return Ok(MapOutcome::Drop);
    }

    state
        .cache_main_6to4
        .store_by_v6((out_src, out_dst), (src, dst), frame[3]);

    Ok(MapOutcome::Mapped((out_src, out_dst)))
}

pub(crate) fn map_inner_6to4(
    state: &mut ExternalState,
    _config: &Config,
    external: &ExternalConfig,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Result<MapOutcome<(Ipv4Addr, Ipv4Addr)>> {
    if let Some(pair) = state.cache_inner_6to4.get_6to4(src, dst) {
        return Ok(MapOutcome::Mapped(pair));
    }

    let frame = match exchange(state, external, TYPE_INNER_6TO4, src.octets(), dst.octets())? {
        Exchange::Response(frame) => frame,
        Exchange::Drop | Exchange::IcmpError => return Ok(MapOutcome::Drop),
    };

    if !v4_padding_is_zero(&frame) {
        tracing::warn!("External mapper sent an IPv4 response with non-zero padding");
        disconnect(state, external)?;
        return Ok(MapOutcome::Drop);
    }
    let (out_src, out_dst) = decode_v4_addrs(&frame);

    state
        .cache_inner_6to4
        .store_by_v6((out_src, out_dst), (src, dst), frame[3]);

    Ok(MapOutcome::Mapped((out_src, out_dst)))
}

enum Exchange {
    Response([u8; FRAME_LEN]),
    Drop,
    /// The helper answered with an ICMP-error verdict; only legal for
    /// main-packet requests, where the socket stays open.
    IcmpError,
}

fn exchange(
    state: &mut ExternalState,
    external: &ExternalConfig,
    request_type: u8,
    src: [u8; 16],
    dst: [u8; 16],
) -> Result<Exchange> {
    if !ensure_connected(state, external)? {
        return Ok(Exchange::Drop);
    }

    let request_id = state.next_request_id;
    state.next_request_id = state.next_request_id.wrapping_add(1);

    let mut frame = [0u8; FRAME_LEN];
    frame[0] = MAGIC;
    frame[1] = PROTOCOL_VERSION;
    frame[2] = request_type;
    frame[4..8].copy_from_slice(&request_id.to_be_bytes());
    frame[8..24].copy_from_slice(&src);
    frame[24..40].copy_from_slice(&dst);

    let exchanged = {
        let conn = state.conn.as_ref().expect("connection was just established");

        sys::write_all(conn.write_fd(), &frame).and_then(|()| {
            let mut response = [0u8; FRAME_LEN];
            sys::read_exact(conn.read_fd(), &mut response)?;

            Ok(response)
        })
    };

    let response = match exchanged {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!("I/O failure talking to external mapper: {error}");
            disconnect(state, external)?;
            return Ok(Exchange::Drop);
        }
    };

    if response[0] != MAGIC
        || response[1] != PROTOCOL_VERSION
        || response[4..8] != request_id.to_be_bytes()
    {
        tracing::warn!("External mapper response failed frame validation");
        disconnect(state, external)?;
        return Ok(Exchange::Drop);
    }

    if response[2] == request_type | RESPONSE_ICMP_ERROR {
        match request_type {
            TYPE_MAIN_4TO6 | TYPE_MAIN_6TO4 => return Ok(Exchange::IcmpError),
            // An inner packet's addresses cannot be "the unreachable host";
            // a helper answering this way is broken.
            _ => {
                tracing::warn!("External mapper sent an ICMP-error verdict for an inner packet");
                disconnect(state, external)?;
                return Ok(Exchange::Drop);
            }
        }
    }

    if response[2] == request_type | RESPONSE_ERROR {
        return Ok(Exchange::Drop);
    }

    if response[2] == request_type | RESPONSE {
        return Ok(Exchange::Response(response));
    }

    tracing::warn!("External mapper sent an unknown message type");
    disconnect(state, external)?;

    Ok(Exchange::Drop)
}

/// `Ok(false)` means "could not connect, drop the packet and try again on
/// the next one".
fn ensure_connected(state: &mut ExternalState, external: &ExternalConfig) -> Result<bool> {
    if state.conn.is_some() {
        return Ok(true);
    }

    let conn = match &external.transport {
        ExternalTransport::InheritedFds => {
            bail!("inherited external mapper file descriptors are broken; cannot reconnect")
        }
        ExternalTransport::Unix { path } => match UnixStream::connect(path) {
            Ok(stream) => {
                stream.set_read_timeout(Some(external.timeout))?;
                stream.set_write_timeout(Some(external.timeout))?;
                Conn::Unix(stream)
            }
            Err(error) => {
                tracing::debug!(path = %path.display(), "Failed to connect to external mapper: {error}");
                return Ok(false);
            }
        },
        ExternalTransport::Tcp { host, port } => {
            match connect_tcp(host, *port, external.timeout) {
                Some(stream) => {
                    stream.set_read_timeout(Some(external.timeout))?;
                    stream.set_write_timeout(Some(external.timeout))?;
                    Conn::Tcp(stream)
                }
                None => return Ok(false),
            }
        }
    };

    tracing::debug!("Connected to external address mapper");
    state.conn = Some(conn);

    Ok(true)
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Option<TcpStream> {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(error) => {
            tracing::debug!(%host, "Failed to resolve external mapper host: {error}");
            return None;
        }
    };

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Some(stream),
            Err(error) => tracing::debug!(%addr, "Failed to connect to external mapper: {error}"),
        }
    }

    None
}

/// Drops the connection. For the inherited-FDs transport this is the point
/// of no return: the worker cannot obtain new descriptors.
fn disconnect(state: &mut ExternalState, external: &ExternalConfig) -> Result<()> {
    state.conn = None;

    if matches!(external.transport, ExternalTransport::InheritedFds) {
        bail!("I/O failure on inherited external mapper file descriptors");
    }

    Ok(())
}

enum Conn {
    Unix(UnixStream),
    Tcp(TcpStream),
    Inherited { read: OwnedFd, write: OwnedFd },
}

impl Conn {
    fn read_fd(&self) -> BorrowedFd<'_> {
        match self {
            Conn::Unix(stream) => stream.as_fd(),
            Conn::Tcp(stream) => stream.as_fd(),
            Conn::Inherited { read, .. } => read.as_fd(),
        }
    }

    fn write_fd(&self) -> BorrowedFd<'_> {
        match self {
            Conn::Unix(stream) => stream.as_fd(),
            Conn::Tcp(stream) => stream.as_fd(),
            Conn::Inherited { write, .. } => write.as_fd(),
        }
    }
}

fn pad_v4(addr: Ipv4Addr) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&addr.octets());

    bytes
}

fn decode_v6_response(frame: &[u8; FRAME_LEN]) -> (Ipv6Addr, Ipv6Addr, u8) {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&frame[8..24]);
    dst.copy_from_slice(&frame[24..40]);

    (Ipv6Addr::from(src), Ipv6Addr::from(dst), frame[3])
}

fn decode_v4_addrs(frame: &[u8; FRAME_LEN]) -> (Ipv4Addr, Ipv4Addr) {
    let src = Ipv4Addr::new(frame[8], frame[9], frame[10], frame[11]);
    let dst = Ipv4Addr::new(frame[24], frame[25], frame[26], frame[27]);

    (src, dst)
}

/// A helper that pads IPv4 responses with anything but zeros is broken and
/// costs itself the connection.
fn v4_padding_is_zero(frame: &[u8; FRAME_LEN]) -> bool {
    frame[12..24] == [0; 12] && frame[28..40] == [0; 12]
}

struct CacheEntry {
    ipv4: (Ipv4Addr, Ipv4Addr),
    ipv6: (Ipv6Addr, Ipv6Addr),
    /// `None` marks an unused slot.
    expires_at: Option<Instant>,
}

/// A direct-mapped cache: one slot per hash, unconditionally overwritten on
/// store. Collisions evicting unrelated entries is the intended, cheap
/// approximation of an LRU.
struct Cache {
    slots: Vec<CacheEntry>,
}

impl Cache {
    fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || CacheEntry {
            ipv4: (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED),
            ipv6: (Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED),
            expires_at: None,
        });

        Self { slots }
    }

    fn get_4to6(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<(Ipv6Addr, Ipv6Addr)> {
        if self.slots.is_empty() {
            return None;
        }
        let entry = &self.slots[hash_v4(src, dst) % self.slots.len()];

        (entry.ipv4 == (src, dst) && entry.is_live()).then_some(entry.ipv6)
    }

    fn get_6to4(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Option<(Ipv4Addr, Ipv4Addr)> {
        if self.slots.is_empty() {
            return None;
        }
        let entry = &self.slots[hash_v6(src, dst) % self.slots.len()];

        (entry.ipv6 == (src, dst) && entry.is_live()).then_some(entry.ipv4)
    }

    // Each direction indexes by its input side; the slot stores the full
    // bidirectional mapping either way.
    fn store_by_v4(
        &mut self,
        ipv4: (Ipv4Addr, Ipv4Addr),
        ipv6: (Ipv6Addr, Ipv6Addr),
        lifetime_secs: u8,
    ) {
        if self.slots.is_empty() || lifetime_secs == 0 {
            return;
        }

        let index = hash_v4(ipv4.0, ipv4.1) % self.slots.len();
        self.slots[index] = CacheEntry {
            ipv4,
            ipv6,
            expires_at: Some(Instant::now() + Duration::from_secs(u64::from(lifetime_secs))),
        };
    }

    fn store_by_v6(
        &mut self,
        ipv4: (Ipv4Addr, Ipv4Addr),
        ipv6: (Ipv6Addr, Ipv6Addr),
        lifetime_secs: u8,
    ) {
        if self.slots.is_empty() || lifetime_secs == 0 {
            return;
        }

        let index = hash_v6(ipv6.0, ipv6.1) % self.slots.len();
        self.slots[index] = CacheEntry {
            ipv4,
            ipv6,
            expires_at: Some(Instant::now() + Duration::from_secs(u64::from(lifetime_secs))),
        };
    }
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Instant::now() < expires_at)
    }
}

fn hash_v4(src: Ipv4Addr, dst: Ipv4Addr) -> usize {
    let src = u32::from_be_bytes(src.octets());
    let dst = u32::from_be_bytes(dst.octets());

    src.wrapping_add(dst) as usize
}

fn hash_v6(src: Ipv6Addr, dst: Ipv6Addr) -> usize {
    let src = src.octets();
    let dst = dst.octets();

    let mut sum = 0u64;
    for half in [&src[..8], &src[8..], &dst[..8], &dst[8..]] {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(half);
        sum = sum.wrapping_add(u64::from_be_bytes(bytes));
    }

    sum as usize
}

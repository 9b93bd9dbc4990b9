//! The immutable configuration record consumed by the translation pipeline.
//!
//! Construction (CLI parsing, defaults, environment) happens in the daemon;
//! the pipeline only ever sees a [`Config`] that passed [`Config::validate`],
//! shared read-only between all workers.

use anyhow::{Result, ensure};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Multi-queue TUN interfaces support at most 256 queues.
pub const MAX_WORKERS: usize = 256;
/// Below this the internal router could not quote 68 bytes of a packet in error.
pub const MIN_MTU_IPV4: u16 = 96;
pub const MIN_MTU_IPV6: u16 = 1280;
/// 65535 minus the 20 bytes an IPv4 header grows by during 6→4 translation.
pub const MAX_MTU: u16 = 65515;
pub const MIN_GENERATED_PACKET_TTL: u8 = 64;
pub const MIN_EXTERNAL_TIMEOUT: Duration = Duration::from_millis(10);
pub const MAX_EXTERNAL_TIMEOUT: Duration = Duration::from_millis(2000);
pub const MAX_EXTERNAL_CACHE_SIZE: usize = 10_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub addressing: Addressing,
    /// The IPv4 identity the internal router speaks as.
    pub router_ipv4: Ipv4Addr,
    /// The IPv6 identity the internal router speaks as.
    pub router_ipv6: Ipv6Addr,
    /// TTL / hop limit of router-generated ICMP packets.
    pub generated_packet_ttl: u8,
    pub ipv4_outbound_mtu: u16,
    pub ipv6_outbound_mtu: u16,
    /// Copy DSCP+ECN from the IPv4 TOS octet into the IPv6 traffic class.
    pub copy_dscp_ecn_4to6: bool,
    /// Copy the IPv6 traffic class into the IPv4 TOS octet.
    pub copy_dscp_ecn_6to4: bool,
    pub workers: usize,
}

/// How (src, dst) address pairs are mapped between the two families.
#[derive(Debug, Clone)]
pub enum Addressing {
    /// One IPv6 host is folded onto a single IPv4 address; everything on the
    /// IPv4 side is reached through the translation prefix.
    Nat64 {
        endpoint: EndpointPair,
        prefix: Ipv6Addr,
        allow_private: bool,
    },
    /// The mirror image of NAT64: one IPv4 host on the IPv4-facing side.
    Clat {
        endpoint: EndpointPair,
        prefix: Ipv6Addr,
        allow_private: bool,
    },
    /// Pure prefix-based stateless translation.
    Siit {
        prefix: Ipv6Addr,
        allow_private: bool,
    },
    /// Address mapping is delegated to an external helper process.
    External(ExternalConfig),
}

/// The translator's own addresses in NAT64 / CLAT mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

#[derive(Debug, Clone)]
pub struct ExternalConfig {
    pub transport: ExternalTransport,
    /// Send and receive timeout on the helper socket.
    pub timeout: Duration,
    /// Slots in each of the two main-packet caches. 0 disables them.
    pub cache_size_main: usize,
    /// Slots in each of the two ICMP-inner-packet caches. 0 disables them.
    pub cache_size_icmp: usize,
}

#[derive(Debug, Clone)]
pub enum ExternalTransport {
    /// One read/write FD pair per worker, handed over on the command line.
    /// Cannot reconnect: any I/O failure is fatal to the worker.
    InheritedFds,
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
}

impl Config {
    /// Checks every startup invariant. A configuration that fails here must
    /// never reach a worker.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_WORKERS).contains(&self.workers),
            "worker count must be between 1 and {MAX_WORKERS}"
        );
        ensure!(
            self.generated_packet_ttl >= MIN_GENERATED_PACKET_TTL,
            "generated-packet TTL must be between {MIN_GENERATED_PACKET_TTL} and 255"
        );
        ensure!(
            (MIN_MTU_IPV4..=MAX_MTU).contains(&self.ipv4_outbound_mtu),
            "IPv4 outbound MTU must be between {MIN_MTU_IPV4} and {MAX_MTU}"
        );
        ensure!(
            (MIN_MTU_IPV6..=MAX_MTU).contains(&self.ipv6_outbound_mtu),
            "IPv6 outbound MTU must be between {MIN_MTU_IPV6} and {MAX_MTU}"
        );

        match &self.addressing {
            Addressing::Nat64 { endpoint, prefix, .. }
            | Addressing::Clat { endpoint, prefix, .. } => {
                ensure!(
                    endpoint.ipv4 != self.router_ipv4,
                    "the translator's IPv4 address must differ from the router's"
                );
                ensure!(
                    endpoint.ipv6 != self.router_ipv6,
                    "the translator's IPv6 address must differ from the router's"
                );
                self.validate_prefix(*prefix)?;
            }
            Addressing::Siit { prefix, .. } => self.validate_prefix(*prefix)?,
            Addressing::External(external) => external.validate()?,
        }

        Ok(())
    }

    fn validate_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        let octets = prefix.octets();
        ensure!(
            octets[12..] == [0; 4],
            "the translation prefix must be a /96 (low 32 bits zero)"
        );
        ensure!(
            self.router_ipv6.octets()[..12] != octets[..12],
            "the router's IPv6 address must not be covered by the translation prefix"
        );

        Ok(())
    }
}

impl ExternalConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_EXTERNAL_TIMEOUT..=MAX_EXTERNAL_TIMEOUT).contains(&self.timeout),
            "external mapper timeout must be between {MIN_EXTERNAL_TIMEOUT:?} and {MAX_EXTERNAL_TIMEOUT:?}"
        );
        ensure!(
            self.cache_size_main <= MAX_EXTERNAL_CACHE_SIZE
                && self.cache_size_icmp <= MAX_EXTERNAL_CACHE_SIZE,
            "external mapper cache sizes must not exceed {MAX_EXTERNAL_CACHE_SIZE}"
        );

        match &self.transport {
            ExternalTransport::Unix { path } => {
                ensure!(!path.as_os_str().is_empty(), "UNIX socket path must not be empty")
            }
            ExternalTransport::Tcp { host, .. } => {
                ensure!(!host.is_empty(), "TCP host must not be empty")
            }
            ExternalTransport::InheritedFds => {}
        }

        Ok(())
    }
}

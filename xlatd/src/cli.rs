//! Command-line surface. Everything here is a thin shim: options are
//! collected, assembled into a validated [`Config`] and handed to the
//! translation engine.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Stateless SIIT / NAT64 / CLAT translator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// How addresses are mapped between the two families. Required unless
    /// only the TUN lifecycle commands are used.
    #[arg(long, env = "XLATD_ADDRESSING_MODE", value_enum)]
    pub addressing_mode: Option<AddressingMode>,

    /// The IPv4 address the translator itself answers from (ICMP errors).
    #[arg(long, env = "XLATD_ROUTER_IPV4")]
    pub router_ipv4: Option<Ipv4Addr>,

    /// The IPv6 address the translator itself answers from (ICMP errors).
    #[arg(long, env = "XLATD_ROUTER_IPV6")]
    pub router_ipv6: Option<Ipv6Addr>,

    /// TTL / hop limit of translator-generated ICMP packets.
    #[arg(long, env = "XLATD_GENERATED_PACKET_TTL", default_value_t = 224)]
    pub generated_packet_ttl: u8,

    /// The translator's own IPv4 address (NAT64 / CLAT only).
    #[arg(long, env = "XLATD_TRANSLATOR_IPV4")]
    pub translator_ipv4: Option<Ipv4Addr>,

    /// The translator's own IPv6 address (NAT64 / CLAT only).
    #[arg(long, env = "XLATD_TRANSLATOR_IPV6")]
    pub translator_ipv6: Option<Ipv6Addr>,

    /// The /96 translation prefix IPv4 addresses are embedded into.
    #[arg(long, env = "XLATD_PREFIX")]
    pub prefix: Option<Ipv6Addr>,

    /// Also translate private/reserved IPv4 ranges (RFC 1918, CGNAT, ...).
    #[arg(long, env = "XLATD_ALLOW_PRIVATE_IPS", default_value_t = false)]
    pub allow_translation_of_private_ips: bool,

    #[arg(long, env = "XLATD_IPV4_OUTBOUND_MTU", default_value_t = 1500)]
    pub ipv4_outbound_mtu: u16,

    #[arg(long, env = "XLATD_IPV6_OUTBOUND_MTU", default_value_t = 1500)]
    pub ipv6_outbound_mtu: u16,

    /// Copy DSCP+ECN from IPv4 into the IPv6 traffic class.
    #[arg(
        long,
        env = "XLATD_COPY_DSCP_ECN_4TO6",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub copy_dscp_ecn_4to6: bool,

    /// Copy the IPv6 traffic class into the IPv4 TOS octet.
    #[arg(
        long,
        env = "XLATD_COPY_DSCP_ECN_6TO4",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub copy_dscp_ecn_6to4: bool,

    /// Translator threads. Defaults to the number of CPUs (at most 256).
    #[arg(long, env = "XLATD_WORKERS")]
    pub workers: Option<usize>,

    /// Where packets come from and go to.
    #[arg(long, env = "XLATD_IO_MODE", value_enum, default_value_t = IoMode::Tun)]
    pub io_mode: IoMode,

    #[arg(long, env = "XLATD_TUN_DEVICE_PATH", default_value = "/dev/net/tun")]
    pub tun_device_path: PathBuf,

    #[arg(long, env = "XLATD_TUN_INTERFACE_NAME")]
    pub tun_interface_name: Option<String>,

    /// Give every worker its own TUN queue instead of sharing one FD.
    #[arg(long, env = "XLATD_TUN_MULTI_QUEUE", default_value_t = false)]
    pub tun_multi_queue: bool,

    /// Inherited packet FDs, one `READ,WRITE` pair per worker, separated by
    /// `:` (for example `0,1` or `3,3:4,4`).
    #[arg(long, env = "XLATD_IO_INHERITED_FDS")]
    pub io_inherited_fds: Option<String>,

    /// Transport towards the external address mapper.
    #[arg(long, env = "XLATD_EXTERNAL_TRANSPORT", value_enum)]
    pub external_transport: Option<ExternalTransportArg>,

    #[arg(long, env = "XLATD_EXTERNAL_UNIX_PATH")]
    pub external_unix_path: Option<PathBuf>,

    #[arg(long, env = "XLATD_EXTERNAL_TCP_HOST")]
    pub external_tcp_host: Option<String>,

    #[arg(long, env = "XLATD_EXTERNAL_TCP_PORT")]
    pub external_tcp_port: Option<u16>,

    /// Send/receive timeout towards the external mapper, in milliseconds.
    #[arg(long, env = "XLATD_EXTERNAL_TIMEOUT_MS", default_value_t = 1000)]
    pub external_timeout_ms: u64,

    /// Slots in each per-worker cache of main-packet mappings. 0 disables.
    #[arg(long, env = "XLATD_EXTERNAL_CACHE_SIZE_MAIN", default_value_t = 0)]
    pub external_cache_size_main: usize,

    /// Slots in each per-worker cache of ICMP-inner mappings. 0 disables.
    #[arg(long, env = "XLATD_EXTERNAL_CACHE_SIZE_ICMP", default_value_t = 0)]
    pub external_cache_size_icmp: usize,

    /// Inherited external-mapper FDs, one `READ,WRITE` pair per worker,
    /// separated by `:`.
    #[arg(long, env = "XLATD_EXTERNAL_INHERITED_FDS")]
    pub external_inherited_fds: Option<String>,
}

#[derive(Subcommand, Clone, Copy)]
pub enum Command {
    /// Run the translator (the default).
    Translate,
    /// Create a persistent TUN interface and exit.
    Mktun,
    /// Remove a persistent TUN interface and exit.
    Rmtun,
    /// Check the configuration and exit.
    ValidateConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum AddressingMode {
    Nat64,
    Clat,
    Siit,
    External,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    Tun,
    InheritedFds,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalTransportArg {
    InheritedFds,
    Unix,
    Tcp,
}

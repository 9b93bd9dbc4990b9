//! The translator daemon: CLI parsing, configuration assembly, logging and
//! signal setup, worker lifecycle. The actual translation lives in
//! `ip-xlat`; TUN device handling lives in `tun`.

mod cli;
mod inherited;
mod signals;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use cli::{AddressingMode, Cli, Command, ExternalTransportArg, IoMode};
use ip_xlat::config::{Addressing, Config, EndpointPair, ExternalConfig, ExternalTransport};
use ip_xlat::worker::{WorkerIo, WorkerPanicked, WorkerPool};
use ip_xlat::InvariantViolation;
use std::os::fd::{AsFd as _, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

const EXIT_CRASH: i32 = 1;
const EXIT_SYNC_FAILURE: i32 = 2;
const EXIT_INVARIANT_FAILURE: i32 = 3;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(&cli) {
        tracing::error!("{error:#}");
        std::process::exit(exit_code(&error));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    if error.is::<WorkerPanicked>() {
        EXIT_SYNC_FAILURE
    } else if error.is::<InvariantViolation>() {
        EXIT_INVARIANT_FAILURE
    } else {
        EXIT_CRASH
    }
}

fn run(cli: &Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Translate) {
        Command::Translate => translate(cli),
        Command::Mktun => set_tun_persistence(cli, true),
        Command::Rmtun => set_tun_persistence(cli, false),
        Command::ValidateConfig => {
            let config = build_config(cli)?;
            config.validate()?;
            tracing::info!("Configuration is valid");

            Ok(())
        }
    }
}

fn translate(cli: &Cli) -> Result<()> {
    let config = build_config(cli)?;
    config.validate()?;

    signals::install()?;

    let io = build_worker_io(cli, &config)?;
    let workers = io.len();
    let pool = WorkerPool::spawn(Arc::new(config), io)?;

    tracing::info!(
        workers,
        mode = ?cli.addressing_mode,
        "Translating packets"
    );

    pool.monitor()?;

    tracing::info!("Termination requested; waiting for workers");
    pool.shutdown()?;
    tracing::info!("Translator stopped");

    Ok(())
}

fn set_tun_persistence(cli: &Cli, persistent: bool) -> Result<()> {
    let interface_name = cli
        .tun_interface_name
        .as_deref()
        .context("--tun-interface-name is required")?;

    let fd = tun::open_queue(&cli.tun_device_path, interface_name, cli.tun_multi_queue)?;
    tun::set_persistent(fd.as_fd(), persistent)?;

    if persistent {
        tracing::info!("TUN interface '{interface_name}' is now persistent");
    } else {
        tracing::info!("TUN interface '{interface_name}' is no longer persistent");
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<Config> {
    let prefix = || cli.prefix.context("--prefix is required in this addressing mode");
    let endpoint = || -> Result<EndpointPair> {
        Ok(EndpointPair {
            ipv4: cli
                .translator_ipv4
                .context("--translator-ipv4 is required in this addressing mode")?,
            ipv6: cli
                .translator_ipv6
                .context("--translator-ipv6 is required in this addressing mode")?,
        })
    };

    let addressing = match cli.addressing_mode.context("--addressing-mode is required")? {
        AddressingMode::Nat64 => Addressing::Nat64 {
            endpoint: endpoint()?,
            prefix: prefix()?,
            allow_private: cli.allow_translation_of_private_ips,
        },
        AddressingMode::Clat => Addressing::Clat {
            endpoint: endpoint()?,
            prefix: prefix()?,
            allow_private: cli.allow_translation_of_private_ips,
        },
        AddressingMode::Siit => Addressing::Siit {
            prefix: prefix()?,
            allow_private: cli.allow_translation_of_private_ips,
        },
        AddressingMode::External => Addressing::External(build_external_config(cli)?),
    };

    Ok(Config {
        addressing,
        router_ipv4: cli.router_ipv4.context("--router-ipv4 is required")?,
        router_ipv6: cli.router_ipv6.context("--router-ipv6 is required")?,
        generated_packet_ttl: cli.generated_packet_ttl,
        ipv4_outbound_mtu: cli.ipv4_outbound_mtu,
        ipv6_outbound_mtu: cli.ipv6_outbound_mtu,
        copy_dscp_ecn_4to6: cli.copy_dscp_ecn_4to6,
        copy_dscp_ecn_6to4: cli.copy_dscp_ecn_6to4,
        workers: worker_count(cli),
    })
}

fn build_external_config(cli: &Cli) -> Result<ExternalConfig> {
    let transport = match cli
        .external_transport
        .context("--external-transport is required in the external addressing mode")?
    {
        ExternalTransportArg::InheritedFds => ExternalTransport::InheritedFds,
        ExternalTransportArg::Unix => ExternalTransport::Unix {
            path: cli
                .external_unix_path
                .clone()
                .context("--external-unix-path is required for the unix transport")?,
        },
        ExternalTransportArg::Tcp => ExternalTransport::Tcp {
            host: cli
                .external_tcp_host
                .clone()
                .context("--external-tcp-host is required for the tcp transport")?,
            port: cli
                .external_tcp_port
                .context("--external-tcp-port is required for the tcp transport")?,
        },
    };

    Ok(ExternalConfig {
        transport,
        timeout: Duration::from_millis(cli.external_timeout_ms),
        cache_size_main: cli.external_cache_size_main,
        cache_size_icmp: cli.external_cache_size_icmp,
    })
}

fn worker_count(cli: &Cli) -> usize {
    cli.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
            .min(ip_xlat::config::MAX_WORKERS)
    })
}

fn build_worker_io(cli: &Cli, config: &Config) -> Result<Vec<WorkerIo>> {
    let workers = config.workers;

    let mut external_fds: Vec<Option<(OwnedFd, OwnedFd)>> =
        if matches!(
            &config.addressing,
            Addressing::External(ExternalConfig {
                transport: ExternalTransport::InheritedFds,
                ..
            })
        ) {
            let spec = cli.external_inherited_fds.as_deref().context(
                "--external-inherited-fds is required for the inherited-fds transport",
            )?;

            inherited::external_fd_pairs(spec, workers)?
                .into_iter()
                .map(Some)
                .collect()
        } else {
            (0..workers).map(|_| None).collect()
        };

    let packet_fds: Vec<(Arc<OwnedFd>, Arc<OwnedFd>)> = match cli.io_mode {
        IoMode::InheritedFds => {
            let spec = cli
                .io_inherited_fds
                .as_deref()
                .context("--io-inherited-fds is required in the inherited-fds I/O mode")?;

            inherited::packet_fd_pairs(spec, workers)?
        }
        IoMode::Tun => {
            let interface_name = cli
                .tun_interface_name
                .as_deref()
                .context("--tun-interface-name is required in the tun I/O mode")?;

            if cli.tun_multi_queue {
                (0..workers)
                    .map(|_| {
                        let fd = Arc::new(tun::open_queue(
                            &cli.tun_device_path,
                            interface_name,
                            true,
                        )?);

                        Ok((fd.clone(), fd))
                    })
                    .collect::<Result<_>>()?
            } else {
                if workers > 1 && cli.workers.is_none() {
                    // Many workers sharing one queue is legal but usually a
                    // misconfiguration when it happens implicitly.
                    tracing::warn!(
                        workers,
                        "Single-queue TUN shared by all workers; consider --tun-multi-queue"
                    );
                }

                let fd = Arc::new(tun::open_queue(&cli.tun_device_path, interface_name, false)?);

                (0..workers).map(|_| (fd.clone(), fd.clone())).collect()
            }
        }
    };

    let io = packet_fds
        .into_iter()
        .zip(external_fds.iter_mut())
        .map(|((read_fd, write_fd), external)| WorkerIo {
            read_fd,
            write_fd,
            external_fds: external.take(),
        })
        .collect();

    Ok(io)
}

//! Linux TUN device handling: opening queue file descriptors and toggling
//! interface persistence. The translator itself only ever sees the
//! resulting file descriptors.

#![cfg(target_os = "linux")]

mod ioctl;

use anyhow::{Context as _, Result, ensure};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

/// Opens one queue of the named TUN interface, creating the interface if it
/// does not exist yet. With `multi_queue` every worker opens its own queue;
/// without it a single descriptor is shared.
pub fn open_queue(device_path: &Path, interface_name: &str, multi_queue: bool) -> Result<OwnedFd> {
    ensure!(
        interface_name.len() < libc::IF_NAMESIZE,
        "interface name '{interface_name}' is too long"
    );

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)
        .with_context(|| format!("failed to open {}", device_path.display()))?;
    let fd = OwnedFd::from(device);

    let mut request = ioctl::Request::set_tun_flags(interface_name, multi_queue);

    // Safety: `fd` is open and the request matches `TUNSETIFF`.
    unsafe { ioctl::exec(fd.as_fd(), libc::TUNSETIFF, &mut request) }
        .with_context(|| format!("failed to attach to TUN interface '{interface_name}'"))?;

    Ok(fd)
}

/// Makes the interface behind `fd` survive the process (`mktun`) or undoes
/// that (`rmtun`).
pub fn set_persistent(fd: BorrowedFd<'_>, persistent: bool) -> Result<()> {
    ioctl::set_persist(fd, persistent).context("failed to change TUN interface persistence")?;

    Ok(())
}

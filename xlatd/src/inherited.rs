//! Parsing of inherited file-descriptor lists: one `READ,WRITE` pair per
//! worker, pairs separated by `:`. A pair may name the same descriptor
//! twice (for example a connected socket used in both directions).

use anyhow::{Context as _, Result, bail, ensure};
use std::os::fd::{FromRawFd as _, OwnedFd, RawFd};
use std::sync::Arc;

// Safety of `from_raw_fd` throughout: by the inherited-FDs contract these
// descriptors were opened for us by the parent and are ours to own.

fn parse_raw_pairs(spec: &str, expected: usize, option: &str) -> Result<Vec<(RawFd, RawFd)>> {
    let mut pairs = Vec::new();

    for pair in spec.split(':') {
        let Some((read, write)) = pair.split_once(',') else {
            bail!("--{option}: '{pair}' is not a READ,WRITE pair");
        };

        let read: RawFd = read
            .parse()
            .with_context(|| format!("--{option}: bad file descriptor '{read}'"))?;
        let write: RawFd = write
            .parse()
            .with_context(|| format!("--{option}: bad file descriptor '{write}'"))?;
        ensure!(read >= 0 && write >= 0, "--{option}: file descriptors must not be negative");

        pairs.push((read, write));
    }

    ensure!(
        pairs.len() == expected,
        "--{option}: expected {expected} file descriptor pair(s), got {}",
        pairs.len()
    );

    Ok(pairs)
}

/// Packet FD pairs for the workers. A pair naming one descriptor twice
/// shares a single owner, so it is closed exactly once.
pub fn packet_fd_pairs(
    spec: &str,
    workers: usize,
) -> Result<Vec<(Arc<OwnedFd>, Arc<OwnedFd>)>> {
    let pairs = parse_raw_pairs(spec, workers, "io-inherited-fds")?;

    Ok(pairs
        .into_iter()
        .map(|(read, write)| {
            let same = read == write;
            let read = Arc::new(unsafe { OwnedFd::from_raw_fd(read) });
            let write = if same {
                read.clone()
            } else {
                Arc::new(unsafe { OwnedFd::from_raw_fd(write) })
            };

            (read, write)
        })
        .collect())
}

/// External-mapper FD pairs for the workers. A doubled descriptor is
/// `dup`ed so that each side has its own owner.
pub fn external_fd_pairs(spec: &str, workers: usize) -> Result<Vec<(OwnedFd, OwnedFd)>> {
    let pairs = parse_raw_pairs(spec, workers, "external-inherited-fds")?;

    pairs
        .into_iter()
        .map(|(read, write)| {
            let same = read == write;
            let read = unsafe { OwnedFd::from_raw_fd(read) };
            let write = if same {
                read.try_clone()
                    .context("failed to duplicate an inherited descriptor")?
            } else {
                unsafe { OwnedFd::from_raw_fd(write) }
            };

            Ok((read, write))
        })
        .collect()
}

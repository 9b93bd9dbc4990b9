//! The worker pool: N OS threads, each owning one read/write FD pair and a
//! private packet buffer, looping over blocking read → translate → writev.
//!
//! Termination: SIGTERM/SIGINT/SIGHUP set a process-wide flag (see
//! [`request_stop`]); the syscall wrappers re-check it whenever a call is
//! interrupted. The controller keeps re-delivering the signal to workers
//! that have not exited yet, so a worker parked in a blocking read is
//! guaranteed to notice within one wrapper iteration.

use crate::config::{Addressing, Config};
use crate::external::ExternalState;
use crate::io::PacketSink;
use crate::{MAX_PACKET_SIZE, sys, translate_packet};
use anyhow::{Context as _, Result, bail};
use std::io::{self, IoSlice};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::thread::JoinHandleExt as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub use crate::sys::{request_stop, stop_requested};

const MONITOR_INTERVAL: Duration = Duration::from_millis(900);
const TERMINATE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-thread translation state. Only ever touched by its owning worker.
pub struct WorkerContext {
    pub(crate) thread_id: usize,
    pub(crate) config: Arc<Config>,
    pub(crate) external: Option<ExternalState>,
    frag_id_ipv4: u16,
    frag_id_ipv6: u32,
}

impl WorkerContext {
    /// `external_fds` is only meaningful for the external addressing mode
    /// with the inherited-FDs transport.
    pub fn new(
        thread_id: usize,
        config: Arc<Config>,
        external_fds: Option<(OwnedFd, OwnedFd)>,
    ) -> Self {
        let external = match &config.addressing {
            Addressing::External(external_config) => {
                Some(ExternalState::new(external_config, external_fds))
            }
            Addressing::Nat64 { .. } | Addressing::Clat { .. } | Addressing::Siit { .. } => None,
        };

        Self {
            thread_id,
            config,
            external,
            // Seeded from the OS RNG once; afterwards plain wrapping
            // counters, so each thread emits its own opaque sequence.
            frag_id_ipv4: rand::random(),
            frag_id_ipv6: rand::random(),
        }
    }

    pub(crate) fn next_ipv4_frag_id(&mut self) -> u16 {
        let id = self.frag_id_ipv4;
        self.frag_id_ipv4 = self.frag_id_ipv4.wrapping_add(1);

        id
    }

    pub(crate) fn next_ipv6_frag_id(&mut self) -> u32 {
        let id = self.frag_id_ipv6;
        self.frag_id_ipv6 = self.frag_id_ipv6.wrapping_add(1);

        id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: Arc<Config>) -> Self {
        Self::new(1, config, None)
    }
}

/// The file descriptors a single worker drives. Read and write may refer to
/// the same descriptor (single-queue TUN); the `Arc` keeps exactly one
/// closer however the descriptors are shared between workers.
pub struct WorkerIo {
    pub read_fd: Arc<OwnedFd>,
    pub write_fd: Arc<OwnedFd>,
    pub external_fds: Option<(OwnedFd, OwnedFd)>,
}

#[repr(align(64))]
struct PacketBuf([u8; MAX_PACKET_SIZE + 1]);

struct FdSink {
    fd: Arc<OwnedFd>,
}

impl PacketSink for FdSink {
    fn send(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
        let total: usize = segments.iter().map(|segment| segment.len()).sum();
        let written = sys::writev(self.fd.as_fd(), segments)?;

        if written != total {
            return Err(io::Error::other(format!(
                "short write: {written} of {total} bytes accepted"
            )));
        }

        Ok(())
    }
}

fn run_worker(mut ctx: WorkerContext, read_fd: Arc<OwnedFd>, write_fd: Arc<OwnedFd>) -> Result<()> {
    let span = tracing::info_span!("worker", id = ctx.thread_id);
    let _entered = span.enter();
    tracing::debug!("Worker running");

    let mut buf = Box::new(PacketBuf([0; MAX_PACKET_SIZE + 1]));
    let mut sink = FdSink { fd: write_fd };

    loop {
        if stop_requested() {
            break;
        }

        let len = match sys::read(read_fd.as_fd(), &mut buf.0[..MAX_PACKET_SIZE]) {
            Ok(0) => bail!("end of file on the packet file descriptor"),
            Ok(len) => len,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => break,
            Err(error) => return Err(error).context("failed to read a packet"),
        };

        if let Err(error) = translate_packet(&mut ctx, &buf.0[..len], &mut sink) {
            if stop_requested() {
                break;
            }

            return Err(error).context("failed to translate a packet");
        }
    }

    tracing::debug!("Worker exiting after termination request");

    Ok(())
}

/// A worker thread panicked. Shared state can no longer be trusted, so the
/// process exits with a dedicated code.
#[derive(Debug, thiserror::Error)]
#[error("a translator thread panicked")]
pub struct WorkerPanicked;

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

struct WorkerHandle {
    thread: thread::JoinHandle<Result<()>>,
    done: Arc<AtomicBool>,
}

/// Sets the flag on drop so that panics are observed like errors.
struct DoneOnExit(Arc<AtomicBool>);

impl Drop for DoneOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl WorkerPool {
    /// Spawns one thread per entry of `io`. The configuration must already
    /// be validated; `io.len()` determines the worker count.
    pub fn spawn(config: Arc<Config>, io: Vec<WorkerIo>) -> Result<Self> {
        let mut workers = Vec::with_capacity(io.len());

        for (index, io) in io.into_iter().enumerate() {
            let thread_id = index + 1; // 0 is the controller
            let ctx = WorkerContext::new(thread_id, config.clone(), io.external_fds);
            let done = Arc::new(AtomicBool::new(false));

            let thread = {
                let done = DoneOnExit(done.clone());
                thread::Builder::new()
                    .name(format!("xlat-{thread_id}"))
                    .spawn(move || {
                        let _done = done;
                        let result = run_worker(ctx, io.read_fd, io.write_fd);
                        if let Err(error) = &result {
                            tracing::error!("Worker {thread_id} failed: {error:#}");
                        }

                        result
                    })
                    .context("failed to spawn a translator thread")?
            };

            workers.push(WorkerHandle { thread, done });
        }

        Ok(Self { workers })
    }

    /// Blocks until termination is requested. A worker exiting on its own
    /// beforehand is a fatal condition.
    pub fn monitor(&self) -> Result<()> {
        while !stop_requested() {
            if self.workers.iter().any(|worker| worker.done.load(Ordering::Acquire)) {
                bail!("a translator thread terminated unexpectedly");
            }

            thread::sleep(MONITOR_INTERVAL);
        }

        Ok(())
    }

    /// Re-delivers the termination signal to every still-running worker
    /// until all of them have been joined. A signal can arrive between the
    /// flag check and the blocking syscall, which is why one delivery is
    /// not enough.
    pub fn shutdown(self) -> Result<()> {
        request_stop();

        loop {
            let mut any_running = false;

            for worker in &self.workers {
                if worker.done.load(Ordering::Acquire) {
                    continue;
                }

                any_running = true;
                let pthread = worker.thread.as_pthread_t();
                if let Err(error) =
                    nix::sys::pthread::pthread_kill(pthread, nix::sys::signal::Signal::SIGTERM)
                {
                    tracing::warn!("Failed to signal a translator thread: {error}");
                }
            }

            if !any_running {
                break;
            }

            thread::sleep(TERMINATE_INTERVAL);
        }

        for worker in self.workers {
            if worker.thread.join().is_err() {
                return Err(WorkerPanicked.into());
            }
        }

        Ok(())
    }
}

//! Signal-aware wrappers around the blocking syscalls the pipeline uses.
//!
//! Every call that can block lives here and follows the same contract: on
//! `EINTR` the termination flag is re-checked — if set, the call gives up
//! with [`io::ErrorKind::Interrupted`] (the only way that kind escapes this
//! module) so the worker can unwind cleanly; otherwise the syscall is
//! retried.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide termination request, set from the signal handler.
static STOP: AtomicBool = AtomicBool::new(false);

/// Requests termination of every worker. Async-signal-safe.
pub fn request_stop() {
    STOP.store(true, Ordering::Relaxed);
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::Relaxed)
}

fn shutdown() -> io::Error {
    io::ErrorKind::Interrupted.into()
}

pub(crate) fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        if stop_requested() {
            return Err(shutdown());
        }

        let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }

        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

pub(crate) fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    loop {
        if stop_requested() {
            return Err(shutdown());
        }

        let ret = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }

        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

pub(crate) fn writev(fd: BorrowedFd<'_>, segments: &[IoSlice<'_>]) -> io::Result<usize> {
    loop {
        if stop_requested() {
            return Err(shutdown());
        }

        // IoSlice is ABI-compatible with iovec.
        let ret = unsafe {
            libc::writev(
                fd.as_raw_fd(),
                segments.as_ptr().cast::<libc::iovec>(),
                segments.len() as libc::c_int,
            )
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }

        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Reads exactly `buf.len()` bytes; end-of-file is an error.
pub(crate) fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;

    while filled < buf.len() {
        match read(fd, &mut buf[filled..])? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => filled += n,
        }
    }

    Ok(())
}

pub(crate) fn write_all(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;

    while written < buf.len() {
        match write(fd, &buf[written..])? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => written += n,
        }
    }

    Ok(())
}

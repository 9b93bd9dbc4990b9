use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Executes the `ioctl` syscall on the given file descriptor with the provided request.
///
/// # Safety
///
/// The file descriptor must be open and `code` must match the payload type.
pub(crate) unsafe fn exec<P>(
    fd: BorrowedFd<'_>,
    code: libc::c_ulong,
    req: &mut Request<P>,
) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// A control request to an IO device, addressed by the device's name.
///
/// The payload MUST be `#[repr(C)]`; its layout depends on the particular
/// request being sent.
#[repr(C)]
pub(crate) struct Request<P> {
    name: [std::ffi::c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

/// `TUNSETPERSIST` takes a plain integer argument instead of a request
/// struct.
pub(crate) fn set_persist(fd: BorrowedFd<'_>, persistent: bool) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETPERSIST as _, persistent as libc::c_ulong) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[repr(C)]
pub(crate) struct SetTunFlagsPayload {
    flags: std::ffi::c_short,
}

impl Request<SetTunFlagsPayload> {
    pub(crate) fn set_tun_flags(name: &str, multi_queue: bool) -> Self {
        let name_as_bytes = name.as_bytes();
        debug_assert!(name_as_bytes.len() < libc::IF_NAMESIZE);

        let mut name = [0u8; libc::IF_NAMESIZE];
        name[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        let mut flags = libc::IFF_TUN | libc::IFF_NO_PI;
        if multi_queue {
            flags |= libc::IFF_MULTI_QUEUE;
        }

        Self {
            name,
            payload: SetTunFlagsPayload { flags: flags as _ },
        }
    }
}


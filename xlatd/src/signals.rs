//! Signal plumbing. The handler does nothing but set the engine's stop
//! flag; everything else (retrying interrupted syscalls, re-delivering the
//! signal to lagging workers) happens in the worker pool.

use anyhow::{Context as _, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};

pub fn install() -> Result<()> {
    // SIGPIPE must be ignored: broken sockets are handled (and sometimes
    // recovered from) at the call sites.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("failed to ignore SIGPIPE")?;

    // Deliberately no SA_RESTART: blocking syscalls have to come back with
    // EINTR so workers re-check the stop flag.
    let action = SigAction::new(
        SigHandler::Handler(handle_termination_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for termination_signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
        unsafe { sigaction(termination_signal, &action) }
            .with_context(|| format!("failed to install a handler for {termination_signal:?}"))?;
    }

    Ok(())
}

extern "C" fn handle_termination_signal(_signal: nix::libc::c_int) {
    // Only async-signal-safe work is allowed here: a single atomic store.
    ip_xlat::worker::request_stop();
}

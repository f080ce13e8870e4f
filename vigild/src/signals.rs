// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process signal handling. Handlers only set flags; the main loop polls
//! them. The statics are written once by `install` before any thread
//! starts and read by the async-signal-safe handler path.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static DUMP_STATS: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signum: libc::c_int) {
    match signum {
        libc::SIGTERM | libc::SIGINT => SHUTDOWN.store(true, Ordering::SeqCst),
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => DUMP_STATS.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Installs the daemon's signal dispositions: SIGTERM/SIGINT request
/// shutdown, SIGHUP requests a config reload, SIGUSR1 a stats dump, and
/// SIGPIPE is ignored so a dead control client cannot kill the process.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handler only touches atomics.
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGHUP, &action)?;
        sigaction(Signal::SIGUSR1, &action)?;
        sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// For the control plane's shutdown command.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Consumes a pending reload request.
pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

/// Consumes a pending stats-dump request.
pub fn take_dump_stats() -> bool {
    DUMP_STATS.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn flags_follow_signals() {
        install().unwrap();

        assert!(!take_reload());
        raise(Signal::SIGHUP).unwrap();
        assert!(take_reload());
        assert!(!take_reload());

        assert!(!take_dump_stats());
        raise(Signal::SIGUSR1).unwrap();
        assert!(take_dump_stats());

        // SIGPIPE is ignored rather than fatal.
        raise(Signal::SIGPIPE).unwrap();
        assert!(!shutdown_requested());
    }
}

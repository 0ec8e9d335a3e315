//! SIGINT/SIGTERM handling for the controller.
//!
//! The handler only flips an atomic flag. It is installed without
//! `SA_RESTART`, so a blocked `waitpid` returns `EINTR` and the watch loop
//! gets to stop the child, disarm and detach before exiting.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::Result;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the handlers and return the flag they set.
pub fn install() -> Result<&'static AtomicBool> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // The handler touches nothing but an atomic.
        unsafe { sigaction(sig, &action) }.map_err(std::io::Error::from)?;
    }
    Ok(&INTERRUPTED)
}

pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

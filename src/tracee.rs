//! The operations the watch loop needs from a traced process.
//!
//! [`crate::process::Process`] implements this over ptrace. Keeping the
//! loop, the watchpoint programmer and the watcher generic over it lets them
//! be driven by a scripted process in tests.

use std::path::PathBuf;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::Result;
use crate::procfs::MemoryRegion;
use crate::types::{ProcessState, StopEvent, VirtAddr};

pub trait Tracee {
    fn pid(&self) -> Pid;

    fn state(&self) -> ProcessState;

    /// Block until the child changes state.
    fn wait_event(&mut self) -> Result<StopEvent>;

    /// Continue a stopped child, optionally delivering `signal`.
    fn resume(&mut self, signal: Option<Signal>) -> Result<()>;

    /// Ask a running child to stop (SIGSTOP).
    fn request_stop(&mut self) -> Result<()>;

    /// Release a stopped child; it keeps running untraced.
    fn detach(&mut self) -> Result<()>;

    /// Kill the child and reap it. Used when setup fails before watching.
    fn kill(&mut self) -> Result<()>;

    fn read_debug_reg(&self, reg: usize) -> Result<u64>;

    fn write_debug_reg(&mut self, reg: usize, value: u64) -> Result<()>;

    /// Read one word without going through ptrace.
    fn read_word(&self, addr: VirtAddr) -> Result<u64>;

    /// Read one word with `PTRACE_PEEKDATA`.
    fn peek_word(&self, addr: VirtAddr) -> Result<u64>;

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>>;

    /// Resolved path of the running executable.
    fn exe_path(&self) -> Result<PathBuf>;
}

/// Starts a program under trace and hands back the stopped tracee.
pub trait Launcher {
    type Tracee: Tracee;

    fn launch(&self, program: &std::path::Path, args: &[String]) -> Result<Self::Tracee>;
}

impl<L: Launcher + ?Sized> Launcher for &L {
    type Tracee = L::Tracee;

    fn launch(&self, program: &std::path::Path, args: &[String]) -> Result<Self::Tracee> {
        (**self).launch(program, args)
    }
}

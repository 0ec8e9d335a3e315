use std::fmt;

use nix::sys::signal::Signal;

/// Address in the traced process, or a static address read from the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_aligned(self, align: u64) -> bool {
        align != 0 && self.0 % align == 0
    }

    /// Relocate a static address by a load base.
    pub fn relocate(self, base: VirtAddr) -> VirtAddr {
        VirtAddr(base.0.wrapping_add(self.0))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Lifecycle of the traced child.
///
/// Only `wait` results move a process between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Forked and exec'd, first stop not yet observed.
    Launched,
    Stopped,
    Running,
    Exited,
}

/// What a single wait on the child reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Stopped by SIGTRAP.
    Trap,
    /// Stopped by any other signal, which is owed back to the child.
    Signal(Signal),
    /// A ptrace event stop (exec); nothing to deliver.
    PtraceEvent(i32),
    /// Exited normally.
    Exited(i32),
    /// Killed by a signal.
    Killed(Signal),
}

impl StopEvent {
    pub fn is_terminal(self) -> bool {
        matches!(self, StopEvent::Exited(_) | StopEvent::Killed(_))
    }
}

impl fmt::Display for StopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopEvent::Trap => write!(f, "stopped by SIGTRAP"),
            StopEvent::Signal(sig) => write!(f, "stopped by {}", sig),
            StopEvent::PtraceEvent(ev) => write!(f, "ptrace event {}", ev),
            StopEvent::Exited(code) => write!(f, "exited with status {}", code),
            StopEvent::Killed(sig) => write!(f, "killed by {}", sig),
        }
    }
}

//! A scripted stand-in for a traced process.

use std::cell::Cell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::procfs::{self, MemoryRegion};
use crate::tracee::{Launcher, Tracee};
use crate::types::{ProcessState, StopEvent, VirtAddr};

/// What the next `wait_event` reports.
#[derive(Debug, Clone)]
pub enum Step {
    /// Watchpoint hit; the watched word now holds this value.
    Hit(i64),
    /// Watchpoint hit readable only through `PTRACE_PEEKDATA`.
    HitPeekOnly(i64),
    /// Watchpoint hit where no read succeeds.
    HitUnreadable,
    /// SIGTRAP with DR6 clear.
    Trap,
    Signal(Signal),
    Event(i32),
    Exit(i32),
    Kill(Signal),
    Eintr,
    WaitError(Errno),
}

#[derive(Debug)]
pub struct ScriptedTracee {
    steps: VecDeque<Step>,
    pub state: ProcessState,
    pub memory: i64,
    pub debug_regs: [u64; 8],
    pub debug_writes: Vec<(usize, u64)>,
    pub resumes: Vec<Option<Signal>>,
    pub peeks: Cell<usize>,
    pub stop_requested: bool,
    pub detached: bool,
    pub killed: bool,
    pub maps: String,
    pub exe: Option<PathBuf>,
    pub fail_debug_writes: bool,
    vm_readable: bool,
    peek_readable: bool,
}

impl ScriptedTracee {
    pub fn new(steps: Vec<Step>) -> Self {
        ScriptedTracee {
            steps: steps.into(),
            state: ProcessState::Stopped,
            memory: 0,
            debug_regs: [0; 8],
            debug_writes: Vec::new(),
            resumes: Vec::new(),
            peeks: Cell::new(0),
            stop_requested: false,
            detached: false,
            killed: false,
            maps: String::new(),
            exe: None,
            fail_debug_writes: false,
            vm_readable: true,
            peek_readable: true,
        }
    }

    fn hit(&mut self, value: i64, vm: bool, peek: bool) -> StopEvent {
        self.memory = value;
        self.debug_regs[6] |= 1;
        self.vm_readable = vm;
        self.peek_readable = peek;
        StopEvent::Trap
    }
}

impl Tracee for ScriptedTracee {
    fn pid(&self) -> Pid {
        Pid::from_raw(4242)
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn wait_event(&mut self) -> Result<StopEvent> {
        assert_eq!(self.state, ProcessState::Running, "wait on a stopped tracee");
        self.vm_readable = true;
        self.peek_readable = true;

        let event = match self.steps.pop_front().unwrap_or(Step::Exit(0)) {
            Step::Hit(v) => self.hit(v, true, true),
            Step::HitPeekOnly(v) => self.hit(v, false, true),
            Step::HitUnreadable => self.hit(0, false, false),
            Step::Trap => StopEvent::Trap,
            Step::Signal(sig) => StopEvent::Signal(sig),
            Step::Event(ev) => StopEvent::PtraceEvent(ev),
            Step::Exit(code) => StopEvent::Exited(code),
            Step::Kill(sig) => StopEvent::Killed(sig),
            Step::Eintr => return Err(Error::Wait(Errno::EINTR)),
            Step::WaitError(errno) => return Err(Error::Wait(errno)),
        };
        self.state = if event.is_terminal() {
            ProcessState::Exited
        } else {
            ProcessState::Stopped
        };
        Ok(event)
    }

    fn resume(&mut self, signal: Option<Signal>) -> Result<()> {
        if self.state != ProcessState::Stopped {
            return Err(Error::NotStopped("resume"));
        }
        self.resumes.push(signal);
        self.state = ProcessState::Running;
        Ok(())
    }

    fn request_stop(&mut self) -> Result<()> {
        self.stop_requested = true;
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        if self.state != ProcessState::Stopped {
            return Err(Error::NotStopped("detach"));
        }
        self.detached = true;
        self.state = ProcessState::Running;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.killed = true;
        self.state = ProcessState::Exited;
        Ok(())
    }

    fn read_debug_reg(&self, reg: usize) -> Result<u64> {
        if self.state != ProcessState::Stopped {
            return Err(Error::NotStopped("PTRACE_PEEKUSER"));
        }
        Ok(self.debug_regs[reg])
    }

    fn write_debug_reg(&mut self, reg: usize, value: u64) -> Result<()> {
        if self.state != ProcessState::Stopped {
            return Err(Error::NotStopped("PTRACE_POKEUSER"));
        }
        if self.fail_debug_writes {
            return Err(Error::trace("PTRACE_POKEUSER")(Errno::EIO));
        }
        self.debug_regs[reg] = value;
        self.debug_writes.push((reg, value));
        Ok(())
    }

    fn read_word(&self, addr: VirtAddr) -> Result<u64> {
        if self.vm_readable {
            Ok(self.memory as u64)
        } else {
            Err(Error::MemoryRead { addr, errno: Errno::ENOSYS })
        }
    }

    fn peek_word(&self, addr: VirtAddr) -> Result<u64> {
        self.peeks.set(self.peeks.get() + 1);
        if self.peek_readable {
            Ok(self.memory as u64)
        } else {
            Err(Error::MemoryRead { addr, errno: Errno::EIO })
        }
    }

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>> {
        Ok(procfs::parse_maps(&self.maps))
    }

    fn exe_path(&self) -> Result<PathBuf> {
        self.exe
            .clone()
            .ok_or_else(|| Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
    }
}

/// Hands out one prepared tracee, or a launch error.
pub struct ScriptedLauncher {
    tracee: Cell<Option<ScriptedTracee>>,
    failure: Cell<Option<Error>>,
    pub launches: Cell<usize>,
}

impl ScriptedLauncher {
    pub fn new(tracee: ScriptedTracee) -> Self {
        ScriptedLauncher {
            tracee: Cell::new(Some(tracee)),
            failure: Cell::new(None),
            launches: Cell::new(0),
        }
    }

    pub fn failing(error: Error) -> Self {
        ScriptedLauncher {
            tracee: Cell::new(None),
            failure: Cell::new(Some(error)),
            launches: Cell::new(0),
        }
    }
}

impl Launcher for ScriptedLauncher {
    type Tracee = ScriptedTracee;

    fn launch(&self, _program: &Path, _args: &[String]) -> Result<ScriptedTracee> {
        self.launches.set(self.launches.get() + 1);
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        Ok(self.tracee.take().expect("launched twice"))
    }
}

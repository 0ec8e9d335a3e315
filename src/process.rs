//! Process control via ptrace.
//!
//! Launches the target under `PTRACE_TRACEME`, waits for the stop raised by
//! the exec, and afterwards only ever continues, stops or detaches it.
//! Every request checks that the child is actually stopped first; ptrace
//! on a running tracee fails with `ESRCH` at best.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pipe::ExecChannel;
use crate::procfs::{self, MemoryRegion};
use crate::tracee::{Launcher, Tracee};
use crate::types::{ProcessState, StopEvent, VirtAddr};

/// Byte offset of debug register `reg` within `struct user`.
fn debug_reg_offset(reg: usize) -> usize {
    std::mem::offset_of!(libc::user, u_debugreg) + reg * std::mem::size_of::<u64>()
}

fn check_debug_reg(reg: usize) -> Result<()> {
    // DR4/DR5 are reserved aliases of DR6/DR7.
    if reg > 7 || reg == 4 || reg == 5 {
        return Err(Error::Usage(format!("invalid debug register: DR{}", reg)));
    }
    Ok(())
}

fn c_string(s: &[u8], what: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Startup(format!("{} contains a NUL byte", what)))
}

/// The traced child.
pub struct Process {
    pid: Pid,
    state: ProcessState,
    attached: bool,
}

impl Process {
    /// Fork, request tracing in the child and exec `program`.
    ///
    /// Returns once the exec has either happened or failed; the child is
    /// left in [`ProcessState::Launched`] until [`Self::wait_for_initial_stop`].
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let prog = c_string(program.as_os_str().as_bytes(), "program path")?;
        let mut argv = vec![prog.clone()];
        for arg in args {
            argv.push(c_string(arg.as_bytes(), "argument")?);
        }
        // Built before fork: the child must not allocate.
        let argv_ptrs: Vec<*const libc::c_char> = argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (reader, writer) = ExecChannel::new()?.split();

        match unsafe { fork() }.map_err(|e| Error::Startup(format!("fork: {}", e)))? {
            ForkResult::Child => {
                drop(reader);
                let errno = match ptrace::traceme() {
                    Ok(()) => {
                        unsafe { libc::execv(prog.as_ptr(), argv_ptrs.as_ptr()) };
                        Errno::last()
                    }
                    Err(errno) => errno,
                };
                writer.report(errno);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop(writer);
                if let Err(errno) = reader.wait_for_exec()? {
                    // Reap the child that failed to exec.
                    let _ = waitpid(child, None);
                    return Err(Error::Startup(format!(
                        "cannot execute {}: {}",
                        program.display(),
                        errno
                    )));
                }
                debug!(pid = %child, program = %program.display(), "spawned traced child");
                Ok(Process {
                    pid: child,
                    state: ProcessState::Launched,
                    attached: true,
                })
            }
        }
    }

    /// Block until the stop raised by the exec.
    ///
    /// A child that exits or is killed before this point never had its
    /// registers touched.
    pub fn wait_for_initial_stop(&mut self) -> Result<()> {
        match waitpid(self.pid, None).map_err(Error::Wait)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, code) => {
                self.mark_gone();
                return Err(Error::Startup(format!(
                    "target process died during startup (exit status {})",
                    code
                )));
            }
            WaitStatus::Signaled(_, sig, _) => {
                self.mark_gone();
                return Err(Error::Startup(format!(
                    "target process died during startup ({})",
                    sig
                )));
            }
            other => return Err(Error::UnexpectedStatus(format!("{:?}", other))),
        }

        self.state = ProcessState::Stopped;
        // A later execve would otherwise show up as a plain SIGTRAP.
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACEEXEC)
            .map_err(Error::trace("PTRACE_SETOPTIONS"))?;
        Ok(())
    }

    /// Spawn and wait for the first stop.
    pub fn launch(program: &Path, args: &[String]) -> Result<Self> {
        let mut process = Process::spawn(program, args)?;
        process.wait_for_initial_stop()?;
        Ok(process)
    }

    fn mark_gone(&mut self) {
        self.state = ProcessState::Exited;
        self.attached = false;
    }

    fn require_stopped(&self, op: &'static str) -> Result<()> {
        if self.state == ProcessState::Stopped {
            Ok(())
        } else {
            Err(Error::NotStopped(op))
        }
    }
}

impl Tracee for Process {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn wait_event(&mut self) -> Result<StopEvent> {
        if self.state == ProcessState::Exited {
            return Err(Error::Wait(Errno::ECHILD));
        }

        let event = match waitpid(self.pid, None).map_err(Error::Wait)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => StopEvent::Trap,
            WaitStatus::Stopped(_, sig) => StopEvent::Signal(sig),
            WaitStatus::PtraceEvent(_, _, event) => StopEvent::PtraceEvent(event),
            WaitStatus::Exited(_, code) => StopEvent::Exited(code),
            WaitStatus::Signaled(_, sig, _) => StopEvent::Killed(sig),
            other => return Err(Error::UnexpectedStatus(format!("{:?}", other))),
        };

        if event.is_terminal() {
            self.mark_gone();
        } else {
            self.state = ProcessState::Stopped;
        }
        Ok(event)
    }

    fn resume(&mut self, signal: Option<Signal>) -> Result<()> {
        self.require_stopped("resume")?;
        ptrace::cont(self.pid, signal).map_err(Error::trace("PTRACE_CONT"))?;
        self.state = ProcessState::Running;
        Ok(())
    }

    fn request_stop(&mut self) -> Result<()> {
        if self.state == ProcessState::Exited {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGSTOP).map_err(Error::trace("kill(SIGSTOP)"))
    }

    fn detach(&mut self) -> Result<()> {
        self.require_stopped("detach")?;
        ptrace::detach(self.pid, None).map_err(Error::trace("PTRACE_DETACH"))?;
        self.attached = false;
        self.state = ProcessState::Running;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if self.state == ProcessState::Exited {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL).map_err(Error::trace("kill(SIGKILL)"))?;
        loop {
            match waitpid(self.pid, None).map_err(Error::Wait)? {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break,
                _ => continue,
            }
        }
        self.mark_gone();
        Ok(())
    }

    fn read_debug_reg(&self, reg: usize) -> Result<u64> {
        check_debug_reg(reg)?;
        self.require_stopped("PTRACE_PEEKUSER")?;
        Errno::clear();
        let val = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.pid.as_raw(),
                debug_reg_offset(reg) as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        // -1 is a valid register value; only errno tells them apart.
        if val == -1 && Errno::last() != Errno::UnknownErrno {
            return Err(Error::trace("PTRACE_PEEKUSER")(Errno::last()));
        }
        Ok(val as u64)
    }

    fn write_debug_reg(&mut self, reg: usize, value: u64) -> Result<()> {
        check_debug_reg(reg)?;
        self.require_stopped("PTRACE_POKEUSER")?;
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.pid.as_raw(),
                debug_reg_offset(reg) as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(Error::trace("PTRACE_POKEUSER")(Errno::last()));
        }
        Ok(())
    }

    fn read_word(&self, addr: VirtAddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        let remote = [RemoteIoVec {
            base: addr.addr() as usize,
            len: buf.len(),
        }];
        let n = process_vm_readv(self.pid, &mut [std::io::IoSliceMut::new(&mut buf)], &remote)
            .map_err(|errno| Error::MemoryRead { addr, errno })?;
        if n != buf.len() {
            return Err(Error::MemoryRead {
                addr,
                errno: Errno::EFAULT,
            });
        }
        Ok(u64::from_ne_bytes(buf))
    }

    fn peek_word(&self, addr: VirtAddr) -> Result<u64> {
        self.require_stopped("PTRACE_PEEKDATA")?;
        let val = ptrace::read(self.pid, addr.addr() as ptrace::AddressType)
            .map_err(|errno| Error::MemoryRead { addr, errno })?;
        Ok(val as u64)
    }

    fn memory_maps(&self) -> Result<Vec<MemoryRegion>> {
        procfs::read_memory_maps(self.pid)
    }

    fn exe_path(&self) -> Result<PathBuf> {
        procfs::get_exe_path(self.pid)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.attached && self.state == ProcessState::Stopped {
            if let Err(e) = ptrace::detach(self.pid, None) {
                warn!(pid = %self.pid, error = %e, "detach on drop failed");
            }
        }
    }
}

/// Launches real processes through [`Process::launch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PtraceLauncher;

impl Launcher for PtraceLauncher {
    type Tracee = Process;

    fn launch(&self, program: &Path, args: &[String]) -> Result<Process> {
        Process::launch(program, args)
    }
}

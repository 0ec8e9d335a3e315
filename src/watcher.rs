//! One complete watch: resolve, launch, relocate, arm, loop, clean up.
//!
//! Stdout (`out`) only ever receives event lines. The two address
//! diagnostics and any fallback warnings go to `diag`.

use std::io::Write;
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use crate::config::WatchConfig;
use crate::elf;
use crate::error::{Error, Result};
use crate::procfs::{self, LoadBase};
use crate::session::{sample, Session, SessionSummary, Termination, WatchTarget};
use crate::symbols::SymbolResolver;
use crate::tracee::{Launcher, Tracee};
use crate::types::VirtAddr;
use crate::watchpoint::Watchpoint;

pub struct Watcher<'a, R, L> {
    config: &'a WatchConfig,
    resolver: R,
    launcher: L,
    stop_flag: &'a AtomicBool,
}

impl<'a, R: SymbolResolver, L: Launcher> Watcher<'a, R, L> {
    pub fn new(config: &'a WatchConfig, resolver: R, launcher: L, stop_flag: &'a AtomicBool) -> Self {
        Watcher {
            config,
            resolver,
            launcher,
            stop_flag,
        }
    }

    /// Run the whole session. The target is only launched once the symbol
    /// has resolved.
    pub fn run<W: Write, D: Write>(&self, out: &mut W, diag: &mut D) -> Result<SessionSummary> {
        self.config.validate()?;

        let offset = self
            .resolver
            .resolve(&self.config.program, &self.config.symbol)
            .ok_or_else(|| Error::SymbolNotFound(self.config.symbol.clone()))?;
        writeln!(diag, "Symbol offset: 0x{:x}", offset.addr())?;

        let pie = elf::is_position_independent(&self.config.program);
        let mut tracee = self.launcher.launch(&self.config.program, &self.config.args)?;
        info!(pid = %tracee.pid(), program = %self.config.program.display(), "target launched");

        self.watch_launched(&mut tracee, offset, pie, out, diag)
    }

    /// Watch an already launched, stopped tracee.
    ///
    /// Setup failures kill the child. Once the loop has started, the
    /// watchpoint is disarmed here on every way out.
    pub fn watch_launched<T: Tracee, W: Write, D: Write>(
        &self,
        tracee: &mut T,
        offset: VirtAddr,
        pie: bool,
        out: &mut W,
        diag: &mut D,
    ) -> Result<SessionSummary> {
        let (target, watchpoint) = match self.prepare(tracee, offset, pie, diag) {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(kill_err) = tracee.kill() {
                    warn!(error = %kill_err, "failed to kill target after setup error");
                }
                return Err(e);
            }
        };

        let mut session = Session::new(target, watchpoint, self.stop_flag);
        let outcome = match session.watchpoint_mut().arm(tracee) {
            Ok(()) => session.run(tracee, out),
            Err(e) => Err(e),
        };

        if let Err(e) = session.watchpoint_mut().disarm(tracee) {
            warn!(error = %e, "failed to disarm watchpoint");
        }

        let summary = session.summary();
        match outcome {
            Ok(Termination::Finished(event)) => {
                info!(
                    %event,
                    writes = summary.writes,
                    reads = summary.reads,
                    skipped = summary.skipped,
                    forwarded = summary.forwarded_signals,
                    "session complete"
                );
                Ok(summary)
            }
            Ok(Termination::Interrupted) => {
                detach(tracee);
                Err(Error::Interrupted)
            }
            Err(e) => {
                if e.is_trace_fatal() {
                    detach(tracee);
                }
                Err(e)
            }
        }
    }

    fn prepare<T: Tracee, D: Write>(
        &self,
        tracee: &mut T,
        offset: VirtAddr,
        pie: bool,
        diag: &mut D,
    ) -> Result<(WatchTarget, Watchpoint)> {
        let runtime = if pie {
            self.relocate(tracee, offset, diag)?
        } else {
            info!(addr = %offset, "fixed-address executable, no relocation");
            offset
        };
        writeln!(diag, "Resolved runtime address: 0x{:x}", runtime.addr())?;

        let watchpoint = Watchpoint::read_write_u32(runtime)?;
        let initial = sample(&*tracee, runtime).unwrap_or_else(|| {
            warn!(addr = %runtime, "initial value unreadable, assuming 0");
            0
        });

        let target = WatchTarget::new(self.config.symbol.clone(), offset, runtime, initial);
        Ok((target, watchpoint))
    }

    fn relocate<T: Tracee, D: Write>(&self, tracee: &T, offset: VirtAddr, diag: &mut D) -> Result<VirtAddr> {
        let maps = tracee.memory_maps()?;
        let program = self.config.program_str();
        let base = procfs::locate_load_base(&maps, &program, || tracee.exe_path().ok());
        info!(%base, "load base");

        match base {
            LoadBase::Direct(base) | LoadBase::ViaExecutable(base) => Ok(offset.relocate(base)),
            LoadBase::Unresolved if self.config.require_load_base => {
                Err(Error::LoadBaseUnresolved(program))
            }
            LoadBase::Unresolved => {
                warn!(program = %program, "load base not found, using static address");
                writeln!(
                    diag,
                    "warning: load base of {} not found, using the static address",
                    program
                )?;
                Ok(offset)
            }
        }
    }
}

fn detach<T: Tracee>(tracee: &mut T) {
    match tracee.detach() {
        Ok(()) => info!(pid = %tracee.pid(), "detached from target"),
        Err(e) => warn!(error = %e, "detach failed"),
    }
}

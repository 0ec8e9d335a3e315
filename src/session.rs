//! The trap-dispatch loop.
//!
//! Resumes the child, blocks until it stops, and decides what the stop was:
//! a watchpoint hit is sampled and classified against the last value seen,
//! any other signal is handed back to the child untouched, and an exit
//! ends the session.
//!
//! Classification is a value diff, not a hardware load/store distinction:
//! a store of the value already present reports as a read.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::tracee::Tracee;
use crate::types::{StopEvent, VirtAddr};
use crate::watchpoint::Watchpoint;

/// The watched variable and the last value observed in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub symbol: String,
    pub static_offset: VirtAddr,
    runtime_address: VirtAddr,
    last_value: i64,
}

impl WatchTarget {
    pub fn new(
        symbol: impl Into<String>,
        static_offset: VirtAddr,
        runtime_address: VirtAddr,
        initial_value: i64,
    ) -> Self {
        WatchTarget {
            symbol: symbol.into(),
            static_offset,
            runtime_address,
            last_value: initial_value,
        }
    }

    pub fn runtime_address(&self) -> VirtAddr {
        self.runtime_address
    }

    pub fn last_value(&self) -> i64 {
        self.last_value
    }

    /// Classify a freshly sampled value and remember it.
    pub fn observe(&mut self, value: i64) -> WatchEvent {
        if value == self.last_value {
            WatchEvent::Read { value }
        } else {
            let old = std::mem::replace(&mut self.last_value, value);
            WatchEvent::Write { old, new: value }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Write { old: i64, new: i64 },
    Read { value: i64 },
}

impl WatchEvent {
    /// The stdout line for this event.
    pub fn line<'a>(&'a self, symbol: &'a str) -> EventLine<'a> {
        EventLine {
            symbol,
            event: self,
        }
    }
}

pub struct EventLine<'a> {
    symbol: &'a str,
    event: &'a WatchEvent,
}

impl fmt::Display for EventLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event {
            WatchEvent::Write { old, new } => write!(f, "{} write {} -> {}", self.symbol, old, new),
            WatchEvent::Read { value } => write!(f, "{} read {}", self.symbol, value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForEvent,
    ClassifyingTrap,
    Continuing,
    Terminated,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child exited or was killed.
    Finished(StopEvent),
    /// Stop was requested and the child is now halted at its SIGSTOP,
    /// ready to be disarmed and detached.
    Interrupted,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub writes: u64,
    pub reads: u64,
    /// Hits whose memory could not be read at all.
    pub skipped: u64,
    pub forwarded_signals: u64,
    pub exit: Option<StopEvent>,
}

/// Read the watched word, falling back from `process_vm_readv` to
/// `PTRACE_PEEKDATA`. `None` when both fail.
pub fn sample<T: Tracee>(tracee: &T, addr: VirtAddr) -> Option<i64> {
    match tracee.read_word(addr) {
        Ok(word) => Some(word as i64),
        Err(e) => {
            debug!(error = %e, "out-of-band read failed, falling back to PTRACE_PEEKDATA");
            match tracee.peek_word(addr) {
                Ok(word) => Some(word as i64),
                Err(e) => {
                    debug!(error = %e, "PTRACE_PEEKDATA failed, skipping sample");
                    None
                }
            }
        }
    }
}

pub struct Session<'a> {
    target: WatchTarget,
    watchpoint: Watchpoint,
    stop_flag: &'a AtomicBool,
    state: LoopState,
    draining: bool,
    summary: SessionSummary,
}

impl<'a> Session<'a> {
    /// `stop_flag` is polled before every wait; once set, the child is sent
    /// SIGSTOP and the loop ends when that stop arrives.
    pub fn new(target: WatchTarget, watchpoint: Watchpoint, stop_flag: &'a AtomicBool) -> Self {
        Session {
            target,
            watchpoint,
            stop_flag,
            state: LoopState::Continuing,
            draining: false,
            summary: SessionSummary::default(),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn watchpoint_mut(&mut self) -> &mut Watchpoint {
        &mut self.watchpoint
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> SessionSummary {
        self.summary
    }

    /// Run until the child exits or an interrupt completes.
    ///
    /// The child must be stopped on entry. On return the watchpoint is still
    /// armed; disarming is the caller's cleanup step.
    pub fn run<T: Tracee, W: Write>(&mut self, tracee: &mut T, out: &mut W) -> Result<Termination> {
        info!(
            symbol = %self.target.symbol,
            addr = %self.target.runtime_address,
            initial = self.target.last_value,
            "watch session started"
        );

        let mut pending: Option<Signal> = None;
        loop {
            self.transition(LoopState::Continuing);
            tracee.resume(pending.take())?;

            self.transition(LoopState::WaitingForEvent);
            let event = self.wait(tracee)?;
            trace!(%event, "child stopped");

            match event {
                StopEvent::Exited(_) | StopEvent::Killed(_) => {
                    self.summary.exit = Some(event);
                    self.transition(LoopState::Terminated);
                    info!(%event, "target finished");
                    return Ok(Termination::Finished(event));
                }
                StopEvent::Trap => {
                    if self.watchpoint.take_hit(tracee)? {
                        self.transition(LoopState::ClassifyingTrap);
                        self.classify(tracee, out)?;
                    } else {
                        debug!("SIGTRAP not raised by the watchpoint, forwarding");
                        pending = Some(Signal::SIGTRAP);
                        self.summary.forwarded_signals += 1;
                    }
                }
                StopEvent::Signal(Signal::SIGSTOP) if self.draining => {
                    self.transition(LoopState::Terminated);
                    info!("target halted after interrupt");
                    return Ok(Termination::Interrupted);
                }
                StopEvent::Signal(sig) => {
                    debug!(signal = %sig, "forwarding signal");
                    pending = Some(sig);
                    self.summary.forwarded_signals += 1;
                }
                StopEvent::PtraceEvent(ev) => {
                    debug!(event = ev, "ptrace event stop");
                }
            }
        }
    }

    fn wait<T: Tracee>(&mut self, tracee: &mut T) -> Result<StopEvent> {
        loop {
            if !self.draining && self.stop_flag.load(Ordering::SeqCst) {
                info!("interrupt received, stopping target");
                tracee.request_stop()?;
                self.draining = true;
            }
            match tracee.wait_event() {
                Err(Error::Wait(Errno::EINTR)) => continue,
                other => return other,
            }
        }
    }

    fn classify<T: Tracee, W: Write>(&mut self, tracee: &mut T, out: &mut W) -> Result<()> {
        let Some(value) = sample(tracee, self.target.runtime_address) else {
            self.summary.skipped += 1;
            return Ok(());
        };

        let event = self.target.observe(value);
        match event {
            WatchEvent::Write { .. } => self.summary.writes += 1,
            WatchEvent::Read { .. } => self.summary.reads += 1,
        }
        writeln!(out, "{}", event.line(&self.target.symbol))?;
        Ok(())
    }

    fn transition(&mut self, next: LoopState) {
        trace!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTracee, Step};

    fn session_for<'a>(flag: &'a AtomicBool, tracee: &mut ScriptedTracee, initial: i64) -> Session<'a> {
        let addr = VirtAddr(0x5555_0000_4010);
        let mut wp = Watchpoint::read_write_u32(addr).unwrap();
        wp.arm(tracee).unwrap();
        Session::new(WatchTarget::new("counter", VirtAddr(0x4010), addr, initial), wp, flag)
    }

    fn run_script(steps: Vec<Step>, initial: i64) -> (String, SessionSummary, ScriptedTracee) {
        let flag = AtomicBool::new(false);
        let mut tracee = ScriptedTracee::new(steps);
        let mut session = session_for(&flag, &mut tracee, initial);
        let mut out = Vec::new();
        let end = session.run(&mut tracee, &mut out).unwrap();
        assert!(matches!(end, Termination::Finished(_)));
        assert_eq!(session.state(), LoopState::Terminated);
        (String::from_utf8(out).unwrap(), session.summary(), tracee)
    }

    #[test]
    fn observe_classifies_by_value() {
        let mut target = WatchTarget::new("x", VirtAddr(0), VirtAddr(0), 5);
        assert_eq!(target.observe(5), WatchEvent::Read { value: 5 });
        assert_eq!(target.observe(6), WatchEvent::Write { old: 5, new: 6 });
        assert_eq!(target.last_value(), 6);
        assert_eq!(target.observe(6), WatchEvent::Read { value: 6 });
    }

    #[test]
    fn event_lines() {
        let write = WatchEvent::Write { old: -1, new: 2 };
        assert_eq!(write.line("counter").to_string(), "counter write -1 -> 2");
        let read = WatchEvent::Read { value: 7 };
        assert_eq!(read.line("counter").to_string(), "counter read 7");
    }

    #[test]
    fn consecutive_writes_reported_in_order() {
        let steps = (1..=5).map(Step::Hit).chain([Step::Exit(0)]).collect();
        let (out, summary, _) = run_script(steps, 0);
        assert_eq!(
            out,
            "counter write 0 -> 1\ncounter write 1 -> 2\ncounter write 2 -> 3\n\
             counter write 3 -> 4\ncounter write 4 -> 5\n"
        );
        assert_eq!(summary.writes, 5);
        assert_eq!(summary.reads, 0);
        assert_eq!(summary.exit, Some(StopEvent::Exited(0)));
    }

    #[test]
    fn counter_loop_with_reads() {
        // Each iteration stores i and loads it back, as the demo target does.
        let mut steps = Vec::new();
        for i in 0..10 {
            steps.push(Step::Hit(i));
            steps.push(Step::Hit(i));
        }
        steps.push(Step::Exit(0));
        let (out, summary, _) = run_script(steps, 0);

        let lines: Vec<&str> = out.lines().collect();
        let writes: Vec<&str> = lines.iter().copied().filter(|l| l.contains(" write ")).collect();
        assert_eq!(writes.first(), Some(&"counter write 0 -> 1"));
        assert_eq!(writes.last(), Some(&"counter write 8 -> 9"));
        assert_eq!(summary.writes, 9);
        assert_eq!(summary.reads, 11);
    }

    #[test]
    fn same_value_store_is_read() {
        let (out, summary, _) = run_script(vec![Step::Hit(3), Step::Hit(3), Step::Exit(0)], 3);
        assert_eq!(out, "counter read 3\ncounter read 3\n");
        assert_eq!(summary.writes, 0);
    }

    #[test]
    fn negative_values() {
        let (out, _, _) = run_script(vec![Step::Hit(-42), Step::Exit(0)], 0);
        assert_eq!(out, "counter write 0 -> -42\n");
    }

    #[test]
    fn unrelated_signals_forwarded() {
        let steps = vec![
            Step::Signal(Signal::SIGALRM),
            Step::Hit(1),
            Step::Signal(Signal::SIGUSR1),
            Step::Exit(0),
        ];
        let (out, summary, tracee) = run_script(steps, 0);
        assert_eq!(out, "counter write 0 -> 1\n");
        assert_eq!(summary.forwarded_signals, 2);
        assert_eq!(
            tracee.resumes,
            vec![None, Some(Signal::SIGALRM), None, Some(Signal::SIGUSR1)]
        );
    }

    #[test]
    fn foreign_sigtrap_forwarded_not_classified() {
        let (out, summary, tracee) = run_script(vec![Step::Trap, Step::Exit(0)], 0);
        assert_eq!(out, "");
        assert_eq!(summary.forwarded_signals, 1);
        assert_eq!(tracee.resumes, vec![None, Some(Signal::SIGTRAP)]);
    }

    #[test]
    fn exec_event_resumes_without_signal() {
        let (_, summary, tracee) = run_script(vec![Step::Event(4), Step::Exit(0)], 0);
        assert_eq!(summary.forwarded_signals, 0);
        assert_eq!(tracee.resumes, vec![None, None]);
    }

    #[test]
    fn vm_read_failure_falls_back_to_peek() {
        let (out, summary, tracee) = run_script(vec![Step::HitPeekOnly(9), Step::Exit(0)], 0);
        assert_eq!(out, "counter write 0 -> 9\n");
        assert_eq!(summary.skipped, 0);
        assert_eq!(tracee.peeks.get(), 1);
    }

    #[test]
    fn unreadable_sample_skipped() {
        let steps = vec![Step::HitUnreadable, Step::Hit(1), Step::Exit(0)];
        let (out, summary, _) = run_script(steps, 0);
        assert_eq!(out, "counter write 0 -> 1\n");
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn killed_target_terminates() {
        let (_, summary, _) = run_script(vec![Step::Hit(1), Step::Kill(Signal::SIGSEGV)], 0);
        assert_eq!(summary.exit, Some(StopEvent::Killed(Signal::SIGSEGV)));
    }

    #[test]
    fn eintr_without_interrupt_retries_wait() {
        let (out, _, tracee) = run_script(vec![Step::Eintr, Step::Hit(1), Step::Exit(0)], 0);
        assert_eq!(out, "counter write 0 -> 1\n");
        assert!(!tracee.stop_requested);
    }

    #[test]
    fn wait_failure_is_fatal() {
        let flag = AtomicBool::new(false);
        let mut tracee = ScriptedTracee::new(vec![Step::WaitError(Errno::ECHILD)]);
        let mut session = session_for(&flag, &mut tracee, 0);
        let err = session.run(&mut tracee, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Wait(Errno::ECHILD)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn interrupt_drains_until_sigstop() {
        let flag = AtomicBool::new(true);
        let steps = vec![
            Step::Hit(1),
            Step::Signal(Signal::SIGSTOP),
            Step::Hit(2),
        ];
        let mut tracee = ScriptedTracee::new(steps);
        let mut session = session_for(&flag, &mut tracee, 0);
        let mut out = Vec::new();

        let end = session.run(&mut tracee, &mut out).unwrap();
        assert_eq!(end, Termination::Interrupted);
        assert!(tracee.stop_requested);
        assert_eq!(String::from_utf8(out).unwrap(), "counter write 0 -> 1\n");
        // The SIGSTOP is consumed, not forwarded.
        assert_eq!(tracee.resumes, vec![None, None]);
    }

    #[test]
    fn sigstop_without_interrupt_is_forwarded() {
        let steps = vec![Step::Signal(Signal::SIGSTOP), Step::Exit(0)];
        let (_, _, tracee) = run_script(steps, 0);
        assert_eq!(tracee.resumes, vec![None, Some(Signal::SIGSTOP)]);
    }
}

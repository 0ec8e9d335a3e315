//! rwatch: watch one global variable of a freshly launched Linux x86_64
//! process with a hardware watchpoint.
//!
//! The target is started under ptrace, the variable's static address is
//! looked up in the binary and relocated by the load base found in
//! `/proc/<pid>/maps`, and debug register DR0 is armed as a 4-byte
//! read/write watchpoint. Every hit is reported as a write (value changed)
//! or a read (value unchanged).
//!
//! # Module overview
//!
//! - [`error`]: Error type and exit-code mapping.
//! - [`types`]: Core types: `VirtAddr`, `StopEvent`, `ProcessState`.
//! - [`config`]: Session configuration.
//! - [`logging`]: `tracing` subscriber setup.
//! - [`elf`]: ELF symbol table loading.
//! - [`symbols`]: Symbol resolution (`nm` or native ELF).
//! - [`procfs`]: `/proc/<pid>/maps` parsing and load base discovery.
//! - [`pipe`]: Fork/exec status pipe.
//! - [`tracee`]: The traced-process interface the loop is written against.
//! - [`process`]: ptrace implementation of it. *(Linux x86_64 only)*
//! - [`watchpoint`]: DR0/DR7 programming.
//! - [`session`]: The trap-dispatch loop and event classification.
//! - [`interrupt`]: SIGINT/SIGTERM flag.
//! - [`watcher`]: The full resolve, launch, watch and clean-up sequence.

pub mod config;
pub mod elf;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod pipe;
pub mod procfs;
pub mod session;
pub mod symbols;
pub mod tracee;
pub mod types;
pub mod watcher;
pub mod watchpoint;

// PEEKUSER offsets come from the x86_64 `struct user`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod process;

#[cfg(test)]
mod testing;

use nix::errno::Errno;
use thiserror::Error;

use crate::types::VirtAddr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("watch address {addr} must be aligned to {align} bytes")]
    Misaligned { addr: VirtAddr, align: u64 },

    #[error("could not determine load base of {0} (position-independent binary)")]
    LoadBaseUnresolved(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("waitpid: {0}")]
    Wait(Errno),

    #[error("unexpected wait status: {0}")]
    UnexpectedStatus(String),

    #[error("{op} failed: {errno}")]
    TraceControl { op: &'static str, errno: Errno },

    #[error("{0} requires the target to be stopped")]
    NotStopped(&'static str),

    #[error("cannot read memory at {addr}: {errno}")]
    MemoryRead { addr: VirtAddr, errno: Errno },

    #[error("interrupted, detached from target")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a failed ptrace request.
    pub fn trace(op: &'static str) -> impl FnOnce(Errno) -> Error {
        move |errno| Error::TraceControl { op, errno }
    }

    /// Process exit code for this failure.
    ///
    /// 2 is reserved for trace-control failures, everything else that stops
    /// a session is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TraceControl { .. } | Error::NotStopped(_) => 2,
            _ => 1,
        }
    }

    /// Whether the failure leaves a child that should be detached from.
    pub fn is_trace_fatal(&self) -> bool {
        self.exit_code() == 2
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::Usage("missing --var".into()).exit_code(), 1);
        assert_eq!(Error::SymbolNotFound("counter".into()).exit_code(), 1);
        assert_eq!(Error::Startup("exited".into()).exit_code(), 1);
        assert_eq!(Error::Wait(Errno::ECHILD).exit_code(), 1);
        assert_eq!(Error::Interrupted.exit_code(), 1);
        assert_eq!(Error::trace("PTRACE_CONT")(Errno::ESRCH).exit_code(), 2);
        assert_eq!(Error::NotStopped("resume").exit_code(), 2);
    }

    #[test]
    fn trace_error_message() {
        let err = Error::trace("POKEUSER DR7")(Errno::EIO);
        assert_eq!(err.to_string(), "POKEUSER DR7 failed: EIO: I/O error");
        assert!(err.is_trace_fatal());
    }
}

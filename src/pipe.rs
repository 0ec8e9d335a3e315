//! Close-on-exec pipe that reports a failed exec back to the parent.
//!
//! The child writes the errno of a failed `PTRACE_TRACEME` or `execv` into
//! the pipe before exiting. A successful exec closes the write end, so the
//! parent reads end-of-file and knows the new image is in place.

use std::fs::File;
use std::io::{Read, Write};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::{Error, Result};

pub struct ExecChannel {
    read: File,
    write: File,
}

/// Parent end.
pub struct ExecReader(File);

/// Child end.
pub struct ExecWriter(File);

impl ExecChannel {
    pub fn new() -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Startup(format!("pipe2: {}", e)))?;
        Ok(ExecChannel {
            read: File::from(read),
            write: File::from(write),
        })
    }

    pub fn split(self) -> (ExecReader, ExecWriter) {
        (ExecReader(self.read), ExecWriter(self.write))
    }
}

impl ExecReader {
    /// Block until the child has exec'd or reported why it could not.
    ///
    /// The caller must have dropped its copy of the write end first.
    pub fn wait_for_exec(mut self) -> Result<std::result::Result<(), Errno>> {
        let mut buf = Vec::with_capacity(4);
        self.0.read_to_end(&mut buf)?;
        match <[u8; 4]>::try_from(buf.as_slice()) {
            Ok(raw) => Ok(Err(Errno::from_raw(i32::from_ne_bytes(raw)))),
            Err(_) if buf.is_empty() => Ok(Ok(())),
            Err(_) => Err(Error::Startup(format!(
                "malformed exec status ({} bytes)",
                buf.len()
            ))),
        }
    }
}

impl ExecWriter {
    /// Child side. Must not allocate: runs between fork and exit.
    pub fn report(mut self, errno: Errno) {
        let _ = self.0.write_all(&(errno as i32).to_ne_bytes());
    }
}

//! Pipe that orders fork/exec against the parent's first `waitpid`.
//!
//! The launched child signals once `PTRACE_TRACEME` has succeeded; the
//! parent blocks on the pipe before waiting for the exec stop.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::{Error, Result};

pub struct SyncPipe {
    reader: Option<File>,
    writer: Option<File>,
}

impl SyncPipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            return Err(Error::Process(format!("pipe2 failed: {}", err)));
        }
        // SAFETY: pipe2 returned two fresh descriptors owned by nobody else.
        let (reader, writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(SyncPipe {
            reader: Some(File::from(reader)),
            writer: Some(File::from(writer)),
        })
    }

    /// Child side: report that tracing is set up.
    pub fn notify(&mut self) -> Result<()> {
        self.reader = None;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Process("pipe write end already closed".into()))?;
        writer.write_all(&[1])?;
        self.writer = None;
        Ok(())
    }

    /// Parent side: block until the child reported, or failed before reporting.
    pub fn wait(&mut self) -> Result<()> {
        self.writer = None;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Process("pipe read end already closed".into()))?;
        let mut buf = [0u8; 1];
        let n = reader.read(&mut buf)?;
        self.reader = None;
        if n == 0 {
            return Err(Error::Process("pipe closed before the child was traceable".into()));
        }
        Ok(())
    }
}

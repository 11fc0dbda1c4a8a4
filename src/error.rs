use thiserror::Error;

use crate::types::VirtAddr;

#[derive(Error, Debug)]
pub enum Error {
    /// The session lock could not be acquired within the configured trials.
    #[error("VM busy: session lock unavailable")]
    Busy,

    #[error("unreadable memory: {len} bytes at {addr}")]
    UnreadableMemory { addr: VirtAddr, len: usize },

    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: VirtAddr, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many watchpoints (limit {limit})")]
    TooManyWatchpoints { limit: usize },

    #[error("watchpoint overlaps existing watchpoint {existing} at {addr}")]
    DuplicateWatchpoint { existing: u32, addr: VirtAddr },

    /// Internal: a cached reference no longer describes the object at its origin.
    #[error("stale reference at {origin}")]
    StaleReference { origin: VirtAddr },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corrupt boot image: {0}")]
    CorruptBootImage(String),

    #[error("line {line}: {message}")]
    Command { line: usize, message: String },

    #[error("breakpoint error: {0}")]
    Breakpoint(String),

    #[error("register error: {0}")]
    Register(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[cfg(target_os = "linux")]
    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the inspection session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::CorruptBootImage(_))
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self, Error::UnreadableMemory { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Protocol("desync".into()).is_fatal());
        assert!(Error::CorruptBootImage("bad magic".into()).is_fatal());
        assert!(!Error::Busy.is_fatal());
        assert!(!Error::TooManyWatchpoints { limit: 4 }.is_fatal());
    }

    #[test]
    fn unreadable_display() {
        let err = Error::UnreadableMemory {
            addr: VirtAddr(0x1000),
            len: 8,
        };
        assert!(err.is_unreadable());
        assert_eq!(err.to_string(), "unreadable memory: 8 bytes at 0x1000");
    }
}

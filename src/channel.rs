//! Access to the inspected process: memory, registers, and execution control.
//!
//! Every backend (native ptrace, GDB remote protocol, core file) implements
//! the same two traits with the same semantics, so nothing above this layer
//! special-cases the backend:
//!
//! - [`MemoryChannel`] reads and writes memory and reads registers. Reads of
//!   unmapped memory fail with [`Error::UnreadableMemory`].
//! - [`ProcessChannel`] adds execution control. Read-only backends reject it
//!   with [`Error::InvalidRequest`].
//!
//! Execution is asynchronous: `resume` returns immediately and the matching
//! [`StopEvent`] is delivered by the backend's [`StopWaiter`], which is owned
//! by the session's request thread. An [`Interrupter`] may be used from any
//! thread to stop a running target.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registers::RegisterSet;
use crate::types::{AddressRange, ThreadId, VirtAddr};
use crate::watchpoint::{WatchpointSize, WatchpointType};

/// Which backend a channel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Remote,
    CoreDump,
    Simulated,
}

pub trait MemoryChannel: Send {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>>;

    fn write_bytes(&self, addr: VirtAddr, data: &[u8]) -> Result<()>;

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet>;

    fn backend(&self) -> Backend;

    fn read_word(&self, addr: VirtAddr) -> Result<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        Ok(word_at(&bytes, 0))
    }

    fn read_u32(&self, addr: VirtAddr) -> Result<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32_at(&bytes, 0))
    }

    fn write_word(&self, addr: VirtAddr, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// `true` if `len` bytes at `addr` can be read.
    fn is_readable(&self, addr: VirtAddr, len: usize) -> bool {
        self.read_bytes(addr, len).is_ok()
    }

    /// Every mapped range, when the backend can enumerate them.
    fn mapped_ranges(&self) -> Vec<AddressRange> {
        Vec::new()
    }
}

/// Kind of memory access reported for a watchpoint trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    /// The backend cannot distinguish reads from writes.
    Unknown,
}

/// Why the target stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// Software breakpoint; the thread's IP has already been reset to `address`.
    Breakpoint { thread: ThreadId, address: VirtAddr },
    Watchpoint {
        thread: ThreadId,
        address: VirtAddr,
        access: AccessKind,
    },
    SingleStep { thread: ThreadId },
    /// Stopped through an [`Interrupter`].
    Paused,
    Signal { thread: ThreadId, signal: i32 },
    Exited { code: i32 },
}

/// One hardware watch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareWatch {
    pub address: VirtAddr,
    pub size: WatchpointSize,
    pub kind: WatchpointType,
}

/// Blocks until the running target stops.
pub trait StopWaiter: Send {
    fn wait(&mut self) -> Result<StopEvent>;
}

/// Stops a running target; safe to call from any thread.
pub trait Interrupter: Send + Sync {
    fn interrupt(&self) -> Result<()>;
}

pub trait ProcessChannel: MemoryChannel {
    fn as_memory(&self) -> &dyn MemoryChannel;

    /// OS thread ids of the stopped process.
    fn threads(&self) -> Result<Vec<ThreadId>>;

    /// Location of the boot image header, when the backend knows it.
    fn boot_image_address(&self) -> Option<VirtAddr> {
        None
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Let all threads run. Returns once the target is running.
    fn resume(&mut self) -> Result<()>;

    /// Execute one instruction on `thread`; other threads stay stopped.
    fn single_step(&mut self, thread: ThreadId) -> Result<()>;

    fn set_instruction_pointer(&mut self, thread: ThreadId, ip: VirtAddr) -> Result<()>;

    fn stop_waiter(&mut self) -> Result<Box<dyn StopWaiter>>;

    fn interrupter(&self) -> Result<Arc<dyn Interrupter>>;

    fn kill(&mut self) -> Result<()>;

    fn max_watchpoints(&self) -> usize;

    fn activate_watchpoint(&mut self, slot: usize, watch: &HardwareWatch) -> Result<()>;

    fn deactivate_watchpoint(&mut self, slot: usize) -> Result<()>;
}

/// Error returned by read-only backends for execution requests.
pub fn read_only(operation: &str) -> Error {
    Error::InvalidRequest(format!("{} is not available on a read-only target", operation))
}

/// Read a little-endian word out of a byte buffer at `offset`.
pub fn word_at(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    if let Some(src) = bytes.get(offset..offset + 8) {
        word.copy_from_slice(src);
    }
    u64::from_le_bytes(word)
}

pub fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    if let Some(src) = bytes.get(offset..offset + 4) {
        word.copy_from_slice(src);
    }
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_helpers() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xef, 0xcd, 0xab, 0x90, 0x01];
        assert_eq!(word_at(&bytes, 0), 0x90ab_cdef_1234_5678);
        assert_eq!(u32_at(&bytes, 0), 0x1234_5678);
        assert_eq!(word_at(&bytes, 4), 0, "short buffer reads as zero");
    }

    #[test]
    fn read_only_message() {
        let err = read_only("resume");
        assert!(matches!(err, Error::InvalidRequest(ref m) if m.contains("resume")));
    }
}

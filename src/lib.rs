//! rtele — inspect a running (or dumped) VM from the outside.
//!
//! The engine reads a VM's memory through a narrow channel, decodes the
//! VM's own data structures from it (classes, heap objects, threads,
//! compiled code) and keeps a consistent picture of them while the target
//! runs, stops, collects garbage and moves objects. Every query sees one
//! published [`state::VmState`]; all execution goes through one request
//! thread owned by the [`session::Session`].
//!
//! # Module overview
//!
//! ## Target access
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — Core types: `VirtAddr`, `ThreadId`, `AddressRange`, `ProcessState`.
//! - [`registers`] — x86_64 register sets with a table-driven design.
//! - [`channel`] — The memory and process channel traits every backend implements.
//! - [`process`] — Local VM under ptrace (launch, attach). *(Linux-only)*
//! - [`procfs`] — `/proc/pid/maps` and thread listing. *(Linux-only)*
//! - [`pipe`] — Fork/exec synchronization pipe. *(Linux-only)*
//! - [`gdb_rsp`] — GDB Remote Serial Protocol client codec.
//! - [`remote`] — VM behind a GDB stub over TCP.
//! - [`coredump`] — ELF core file writing and read-only core file backend.
//!
//! ## VM model
//!
//! - [`layout`] — Boot image header and the VM's record layouts.
//! - [`heap_scheme`] — Heap regions and collector phases (semi-space, mark-sweep).
//! - [`classes`] — Class registry decoding and method keys.
//! - [`reference`] — Canonical remote references that track object moves.
//! - [`objects`] — Typed field, array and string access.
//! - [`code_cache`] — Compiled code regions and compilations.
//! - [`unwind`] — Stack walking over compiled frames.
//! - [`threads`] — VM thread list decoding.
//! - [`memory`] — Memory region map and address classification.
//! - [`disasm`] — x86_64 disassembly using iced-x86.
//!
//! ## Control
//!
//! - [`expr_eval`] — Breakpoint condition expressions.
//! - [`breakpoint`] — Machine and bytecode breakpoints.
//! - [`watchpoint`] — Region and object watchpoints on debug registers.
//! - [`triggers`] — System breakpoints reporting VM events.
//! - [`state`] — Immutable published VM states.
//! - [`session`] — Refresh coordination, locking and the request thread.
//! - [`commands`] — Text command files.
//! - [`config`] — TOML configuration and logging setup.

pub mod error;
pub mod types;
pub mod registers;
pub mod channel;
pub mod layout;
pub mod config;
pub mod heap_scheme;
pub mod classes;
pub mod reference;
pub mod objects;
pub mod code_cache;
pub mod unwind;
pub mod threads;
pub mod memory;
pub mod disasm;
pub mod expr_eval;
pub mod breakpoint;
pub mod watchpoint;
pub mod triggers;
pub mod state;
pub mod coredump;
pub mod session;
pub mod commands;
pub mod gdb_rsp;
pub mod remote;

// Linux-only modules (ptrace, procfs)
#[cfg(target_os = "linux")]
pub mod process;
#[cfg(target_os = "linux")]
pub mod procfs;
#[cfg(target_os = "linux")]
pub mod pipe;

#[cfg(test)]
pub mod testing;

//! Linux procfs helpers for the native backend.
//!
//! `/proc/[pid]/maps` gives the readable address ranges used when writing
//! core files, and `/proc/[pid]/task` lists the threads to attach to.

use nix::unistd::Pid;

use crate::error::Result;
use crate::types::{AddressRange, ThreadId, VirtAddr};

/// One line of `/proc/[pid]/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: AddressRange,
    pub perms: Permissions,
    pub offset: u64,
    pub pathname: String,
}

/// Mapping permissions (rwxp/s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
        )
    }
}

pub fn read_maps(pid: Pid) -> Result<Vec<Mapping>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

pub fn parse_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<Mapping> {
    // 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.splitn(6, char::is_whitespace);

    let addr_range = parts.next()?;
    let perms_str = parts.next()?;
    let offset_str = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("").trim().to_string();

    let (start_str, end_str) = addr_range.split_once('-')?;
    let perms = perms_str.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;
    if end < start {
        return None;
    }

    Some(Mapping {
        range: AddressRange::new(VirtAddr(start), end - start),
        perms: Permissions {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            private: perms[3] == b'p',
        },
        offset: u64::from_str_radix(offset_str, 16).ok()?,
        pathname,
    })
}

/// Ranges worth copying into a core file: readable, and not kernel-provided pages.
pub fn readable_ranges(maps: &[Mapping]) -> Vec<AddressRange> {
    maps.iter()
        .filter(|m| m.perms.read)
        .filter(|m| !matches!(m.pathname.as_str(), "[vvar]" | "[vsyscall]" | "[vvar_vclock]"))
        .map(|m| m.range)
        .collect()
}

pub fn find_mapping(maps: &[Mapping], addr: VirtAddr) -> Option<&Mapping> {
    maps.iter().find(|m| m.range.contains(addr))
}

/// Thread ids listed under `/proc/[pid]/task`, sorted.
pub fn list_threads(pid: Pid) -> Result<Vec<ThreadId>> {
    let mut threads: Vec<ThreadId> = std::fs::read_dir(format!("/proc/{}/task", pid))?
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<u64>().ok())
        .map(ThreadId)
        .collect();
    threads.sort();
    Ok(threads)
}

//! Named memory regions of the target, rebuilt every refresh.
//!
//! Regions form a shallow containment tree: a thread's stack contains its
//! thread-locals block. Lookups return the innermost region.

use std::fmt;
use std::sync::Arc;

use crate::channel::MemoryChannel;
use crate::code_cache::CodeRegion;
use crate::layout::{CodeRegionKind, HeapRegionKind, HeapRegionRecord};
use crate::threads::MaxThread;
use crate::types::{AddressRange, ThreadId, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Heap(HeapRegionKind),
    Code(CodeRegionKind),
    Stack,
    ThreadLocals,
    BootImage,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Heap(kind) => write!(f, "heap/{}", heap_kind_name(*kind)),
            RegionKind::Code(CodeRegionKind::Boot) => f.write_str("code/boot"),
            RegionKind::Code(CodeRegionKind::Runtime) => f.write_str("code/runtime"),
            RegionKind::Stack => f.write_str("stack"),
            RegionKind::ThreadLocals => f.write_str("thread-locals"),
            RegionKind::BootImage => f.write_str("boot-image"),
        }
    }
}

fn heap_kind_name(kind: HeapRegionKind) -> &'static str {
    match kind {
        HeapRegionKind::Boot => "boot",
        HeapRegionKind::Immortal => "immortal",
        HeapRegionKind::FromSpace => "from-space",
        HeapRegionKind::ToSpace => "to-space",
        HeapRegionKind::MarkSweep => "mark-sweep",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub range: AddressRange,
    pub name: String,
    pub kind: RegionKind,
    /// Thread owning a stack or thread-locals region.
    pub owner: Option<ThreadId>,
    pub children: Vec<MemoryRegion>,
}

impl MemoryRegion {
    fn leaf(range: AddressRange, name: String, kind: RegionKind, owner: Option<ThreadId>) -> Self {
        MemoryRegion {
            range,
            name,
            kind,
            owner,
            children: Vec::new(),
        }
    }

    /// Innermost region containing `addr`, searching this region and its children.
    pub fn find(&self, addr: VirtAddr) -> Option<&MemoryRegion> {
        if !self.range.contains(addr) {
            return None;
        }
        self.children
            .iter()
            .find_map(|c| c.find(addr))
            .or(Some(self))
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24} {} {}", self.name, self.range, self.kind)
    }
}

/// What an address refers to, for clients probing arbitrary memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryStatus {
    Unreadable,
    /// Readable but outside every known region.
    Unknown,
    Region { name: String, kind: RegionKind },
}

/// Assemble the region tree from the pieces each manager knows about.
pub fn build(
    boot_header: AddressRange,
    heap: &[HeapRegionRecord],
    code: &[CodeRegion],
    threads: &[Arc<MaxThread>],
) -> Vec<MemoryRegion> {
    let mut regions = vec![MemoryRegion::leaf(
        boot_header,
        "boot-header".to_string(),
        RegionKind::BootImage,
        None,
    )];
    for region in heap {
        let name = if region.name.is_empty() {
            format!("heap-{}", heap_kind_name(region.kind))
        } else {
            region.name.clone()
        };
        regions.push(MemoryRegion::leaf(
            AddressRange::new(region.start, region.size),
            name,
            RegionKind::Heap(region.kind),
            None,
        ));
    }
    for region in code {
        regions.push(MemoryRegion::leaf(
            region.range,
            region.name.clone(),
            RegionKind::Code(region.kind),
            None,
        ));
    }
    for thread in threads {
        let mut stack = MemoryRegion::leaf(
            thread.stack,
            format!("stack-{}", thread.name),
            RegionKind::Stack,
            Some(thread.id),
        );
        if thread.locals.size > 0 {
            stack.children.push(MemoryRegion::leaf(
                thread.locals,
                format!("locals-{}", thread.name),
                RegionKind::ThreadLocals,
                Some(thread.id),
            ));
        }
        regions.push(stack);
    }
    regions.sort_by_key(|r| r.range.start);
    regions
}

pub fn find(regions: &[MemoryRegion], addr: VirtAddr) -> Option<&MemoryRegion> {
    regions.iter().find_map(|r| r.find(addr))
}

pub fn status(
    regions: &[MemoryRegion],
    channel: &dyn MemoryChannel,
    addr: VirtAddr,
) -> MemoryStatus {
    if !channel.is_readable(addr, 1) {
        return MemoryStatus::Unreadable;
    }
    match find(regions, addr) {
        Some(region) => MemoryStatus::Region {
            name: region.name.clone(),
            kind: region.kind,
        },
        None => MemoryStatus::Unknown,
    }
}

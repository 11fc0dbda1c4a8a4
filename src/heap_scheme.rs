//! Heap-scheme capabilities.
//!
//! Everything the inspector needs to know about the VM's garbage collector
//! is expressed by the [`HeapScheme`] trait: where forwarding pointers live,
//! how to recognize and decode them, and which addresses can currently hold
//! live objects. [`ReferenceManager`](crate::reference::ReferenceManager) is
//! the only consumer.

use crate::channel::MemoryChannel;
use crate::config::HeapSchemeKind;
use crate::error::Result;
use crate::layout::{GcInfo, HeapPhase, HeapRegionKind, HeapRegionRecord, HUB_OFFSET};
use crate::types::{AddressRange, VirtAddr};

pub trait HeapScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Record the heap regions and GC state read during a refresh.
    fn update(&mut self, regions: &[HeapRegionRecord], gc: GcInfo);

    /// Whether objects can move.
    fn relocates(&self) -> bool;

    /// Offset from an object's origin of the word that holds a forwarding pointer.
    fn gc_forwarding_pointer_offset(&self) -> u64;

    fn is_forwarding_pointer(&self, word: u64) -> bool;

    /// Decode a word known to be a forwarding pointer.
    fn forwarded_origin(&self, word: u64) -> VirtAddr;

    /// Whether an object could currently be live at `addr`.
    fn is_in_live_memory(&self, addr: VirtAddr) -> bool;

    /// Whether `addr` lies in space being evacuated by an in-progress collection,
    /// where an object's fate is not yet known.
    fn is_condemned(&self, _addr: VirtAddr) -> bool {
        false
    }

    /// Origin of the forwarded copy of the object at `origin`, if a
    /// relocation is in progress and the object has been copied.
    fn get_forwarded_origin(
        &self,
        channel: &dyn MemoryChannel,
        origin: VirtAddr,
    ) -> Result<Option<VirtAddr>>;

    /// Forwarding target recorded at `origin`, regardless of GC phase.
    ///
    /// Used when settling references after a collection finished; the copy
    /// must lie in live memory.
    fn read_forwarding(
        &self,
        channel: &dyn MemoryChannel,
        origin: VirtAddr,
    ) -> Result<Option<VirtAddr>> {
        if !self.relocates() {
            return Ok(None);
        }
        let word = match channel.read_word(origin + self.gc_forwarding_pointer_offset()) {
            Ok(word) => word,
            Err(e) if e.is_unreadable() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !self.is_forwarding_pointer(word) {
            return Ok(None);
        }
        let target = self.forwarded_origin(word);
        Ok(self.is_in_live_memory(target).then_some(target))
    }
}

pub fn create(kind: HeapSchemeKind) -> Box<dyn HeapScheme> {
    match kind {
        HeapSchemeKind::SemiSpace => Box::new(SemiSpaceScheme::default()),
        HeapSchemeKind::MarkSweep => Box::new(MarkSweepScheme::default()),
    }
}

fn allocated(region: &HeapRegionRecord) -> AddressRange {
    let used = region.top.offset_from(region.start).unwrap_or(0).min(region.size);
    AddressRange::new(region.start, used)
}

/// Copying collector with two semispaces.
///
/// A copied object's hub word is overwritten with the address of the copy,
/// tagged with bit 0.
#[derive(Debug, Default)]
pub struct SemiSpaceScheme {
    phase: HeapPhase,
    immortal: Vec<AddressRange>,
    to_space: Option<AddressRange>,
    from_space: Option<AddressRange>,
}

impl SemiSpaceScheme {
    fn in_to_space(&self, addr: VirtAddr) -> bool {
        self.to_space.map_or(false, |r| r.contains(addr))
    }

    fn in_from_space(&self, addr: VirtAddr) -> bool {
        self.from_space.map_or(false, |r| r.contains(addr))
    }
}

impl HeapScheme for SemiSpaceScheme {
    fn name(&self) -> &'static str {
        "semispace"
    }

    fn update(&mut self, regions: &[HeapRegionRecord], gc: GcInfo) {
        self.phase = gc.phase;
        self.immortal.clear();
        self.to_space = None;
        self.from_space = None;
        for region in regions {
            match region.kind {
                HeapRegionKind::Boot | HeapRegionKind::Immortal => {
                    self.immortal.push(allocated(region))
                }
                HeapRegionKind::ToSpace => self.to_space = Some(allocated(region)),
                HeapRegionKind::FromSpace => self.from_space = Some(allocated(region)),
                HeapRegionKind::MarkSweep => {}
            }
        }
    }

    fn relocates(&self) -> bool {
        true
    }

    fn gc_forwarding_pointer_offset(&self) -> u64 {
        HUB_OFFSET
    }

    fn is_forwarding_pointer(&self, word: u64) -> bool {
        word & 1 == 1
    }

    fn forwarded_origin(&self, word: u64) -> VirtAddr {
        VirtAddr(word & !1)
    }

    fn is_in_live_memory(&self, addr: VirtAddr) -> bool {
        if self.immortal.iter().any(|r| r.contains(addr)) || self.in_to_space(addr) {
            return true;
        }
        self.phase == HeapPhase::Analyzing && self.in_from_space(addr)
    }

    fn is_condemned(&self, addr: VirtAddr) -> bool {
        self.phase == HeapPhase::Analyzing && self.in_from_space(addr)
    }

    fn get_forwarded_origin(
        &self,
        channel: &dyn MemoryChannel,
        origin: VirtAddr,
    ) -> Result<Option<VirtAddr>> {
        if self.phase != HeapPhase::Analyzing || !self.in_from_space(origin) {
            return Ok(None);
        }
        let forwarded = self.read_forwarding(channel, origin)?;
        Ok(forwarded.filter(|&copy| self.in_to_space(copy)))
    }
}

/// Non-moving collector; dead objects are recognized by their hub.
#[derive(Debug, Default)]
pub struct MarkSweepScheme {
    spaces: Vec<AddressRange>,
}

impl HeapScheme for MarkSweepScheme {
    fn name(&self) -> &'static str {
        "mark-sweep"
    }

    fn update(&mut self, regions: &[HeapRegionRecord], _gc: GcInfo) {
        self.spaces = regions.iter().map(allocated).collect();
    }

    fn relocates(&self) -> bool {
        false
    }

    fn gc_forwarding_pointer_offset(&self) -> u64 {
        HUB_OFFSET
    }

    fn is_forwarding_pointer(&self, _word: u64) -> bool {
        false
    }

    fn forwarded_origin(&self, word: u64) -> VirtAddr {
        VirtAddr(word)
    }

    fn is_in_live_memory(&self, addr: VirtAddr) -> bool {
        self.spaces.iter().any(|r| r.contains(addr))
    }

    fn get_forwarded_origin(
        &self,
        _channel: &dyn MemoryChannel,
        _origin: VirtAddr,
    ) -> Result<Option<VirtAddr>> {
        Ok(None)
    }
}

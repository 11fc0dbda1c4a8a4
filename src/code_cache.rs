//! Mirror of the VM's compiled-code cache.
//!
//! The cache consists of a boot region plus runtime regions, each listing
//! the compilations allocated in it. [`CodeCacheAccess::update`] re-reads
//! the region table, decodes compilations it has not seen, and reports
//! compilations that disappeared as evicted. A compilation record whose
//! serial changed was reused for new code: the old compilation is evicted
//! and the new one added.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::channel::MemoryChannel;
use crate::classes::{ClassAccess, MethodKey};
use crate::disasm::{self, DisasmInstruction, DisasmStyle};
use crate::error::Result;
use crate::layout::{
    CallSite, CodeRegionKind, CodeRegionRecord, CompilationRecord, CompilerTier, DebugEntry,
    FrameValue,
};
use crate::types::{AddressRange, VirtAddr};

/// One compiled version of a method.
#[derive(Debug)]
pub struct Compilation {
    pub serial: u64,
    /// Address of the compilation record in the target.
    pub record: VirtAddr,
    pub method_id: u64,
    /// Holder class and method, if the class was loaded when the code was decoded.
    pub method: Option<MethodKey>,
    pub range: AddressRange,
    pub entry_offset: u32,
    pub frame_size: u32,
    /// Sorted by `pc_offset`.
    pub debug_entries: Vec<DebugEntry>,
    pub call_sites: Vec<CallSite>,
    pub frame_values: Vec<FrameValue>,
    pub tier: CompilerTier,
    pub region: String,
    pub code: Vec<u8>,
    evicted: AtomicBool,
}

impl Compilation {
    fn from_record(
        record: CompilationRecord,
        method: Option<MethodKey>,
        region: &str,
        code: Vec<u8>,
    ) -> Self {
        let mut debug_entries = record.debug_entries;
        debug_entries.sort_by_key(|e| e.pc_offset);
        Compilation {
            serial: record.serial,
            record: record.address,
            method_id: record.method_id,
            method,
            range: AddressRange::new(record.code_start, record.code_size),
            entry_offset: record.entry_offset,
            frame_size: record.frame_size,
            debug_entries,
            call_sites: record.call_sites,
            frame_values: record.frame_values,
            tier: record.tier,
            region: region.to_string(),
            code,
            evicted: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.range.start
    }

    pub fn entry_point(&self) -> VirtAddr {
        self.range.start + self.entry_offset as u64
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.range.contains(addr)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    fn pc_offset(&self, pc: VirtAddr) -> Option<u32> {
        self.contains(pc)
            .then(|| pc.offset_from(self.range.start).map(|o| o as u32))
            .flatten()
    }

    fn debug_index_at(&self, pc: VirtAddr) -> Option<usize> {
        let offset = self.pc_offset(pc)?;
        let after = self.debug_entries.partition_point(|e| e.pc_offset <= offset);
        after.checked_sub(1)
    }

    /// Bytecode position of the code at `pc`: the last debug entry at or before it.
    pub fn bci_at(&self, pc: VirtAddr) -> Option<u32> {
        self.debug_index_at(pc).map(|i| self.debug_entries[i].bci)
    }

    /// Address of the first code for bytecode position `bci`.
    pub fn pc_for_bci(&self, bci: u32) -> Option<VirtAddr> {
        self.debug_entries
            .iter()
            .find(|e| e.bci == bci)
            .map(|e| self.range.start + e.pc_offset as u64)
    }

    /// Frame size in effect at `pc`; no frame exists until the entry sequence ran.
    pub fn effective_frame_size(&self, pc: VirtAddr) -> u64 {
        match self.pc_offset(pc) {
            Some(offset) if offset > self.entry_offset => self.frame_size as u64,
            _ => 0,
        }
    }

    /// Frame value descriptors valid at `pc`.
    pub fn frame_values_at(&self, pc: VirtAddr) -> Vec<FrameValue> {
        match self.debug_index_at(pc) {
            Some(index) => self
                .frame_values
                .iter()
                .filter(|v| v.debug_index as usize == index)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn call_site_at(&self, pc: VirtAddr) -> Option<&CallSite> {
        let offset = self.pc_offset(pc)?;
        self.call_sites.iter().find(|c| c.pc_offset == offset)
    }

    pub fn disassemble(&self, style: DisasmStyle) -> Vec<DisasmInstruction> {
        disasm::disassemble(&self.code, self.range.start, usize::MAX, style)
    }
}

impl fmt::Display for Compilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(key) => write!(f, "{}", key)?,
            None => write!(f, "method#{}", self.method_id)?,
        }
        write!(f, " [#{} {}]", self.serial, self.range)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    pub range: AddressRange,
    pub name: String,
    pub kind: CodeRegionKind,
    pub compilation_count: usize,
}

/// Changes found by one [`CodeCacheAccess::update`].
#[derive(Debug, Default)]
pub struct CodeCacheDelta {
    pub added: Vec<Arc<Compilation>>,
    pub evicted: Vec<Arc<Compilation>>,
}

impl CodeCacheDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.evicted.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CodeCacheAccess {
    /// Sorted by start address.
    regions: Vec<CodeRegion>,
    /// Keyed by code start.
    compilations: BTreeMap<VirtAddr, Arc<Compilation>>,
    by_record: HashMap<VirtAddr, Arc<Compilation>>,
}

impl CodeCacheAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        channel: &dyn MemoryChannel,
        classes: &ClassAccess,
        table: VirtAddr,
    ) -> Result<CodeCacheDelta> {
        let records = CodeRegionRecord::read_all(channel, table)?;
        let mut delta = CodeCacheDelta::default();
        let mut seen = HashSet::new();

        for region in &records {
            for &record in &region.compilations {
                seen.insert(record);
                if let Some(known) = self.by_record.get(&record) {
                    if channel.read_word(record)? == known.serial {
                        continue;
                    }
                    let old = known.clone();
                    self.evict(&old, &mut delta);
                }
                if let Some(added) = self.decode(channel, classes, record, &region.name)? {
                    trace!(compilation = %added, "new compilation");
                    self.compilations.insert(added.start(), added.clone());
                    self.by_record.insert(record, added.clone());
                    delta.added.push(added);
                }
            }
        }

        let gone: Vec<Arc<Compilation>> = self
            .by_record
            .iter()
            .filter(|(record, _)| !seen.contains(*record))
            .map(|(_, c)| c.clone())
            .collect();
        for compilation in gone {
            self.evict(&compilation, &mut delta);
        }

        self.regions = records
            .iter()
            .map(|r| CodeRegion {
                range: AddressRange::new(r.start, r.size),
                name: r.name.clone(),
                kind: r.kind,
                compilation_count: r.compilations.len(),
            })
            .collect();
        self.regions.sort_by_key(|r| r.range.start);

        if !delta.is_empty() {
            debug!(
                added = delta.added.len(),
                evicted = delta.evicted.len(),
                live = self.compilations.len(),
                "code cache updated"
            );
        }
        Ok(delta)
    }

    fn decode(
        &self,
        channel: &dyn MemoryChannel,
        classes: &ClassAccess,
        record: VirtAddr,
        region: &str,
    ) -> Result<Option<Arc<Compilation>>> {
        let record = CompilationRecord::read(channel, record)?;
        let code = match channel.read_bytes(record.code_start, record.code_size as usize) {
            Ok(code) => code,
            Err(e) if e.is_unreadable() => {
                warn!(
                    record = %record.address,
                    start = %record.code_start,
                    "compilation code unreadable; skipped"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let method = classes.method_key(record.method_id);
        Ok(Some(Arc::new(Compilation::from_record(record, method, region, code))))
    }

    fn evict(&mut self, compilation: &Arc<Compilation>, delta: &mut CodeCacheDelta) {
        compilation.mark_evicted();
        self.by_record.remove(&compilation.record);
        if self
            .compilations
            .get(&compilation.start())
            .map_or(false, |c| Arc::ptr_eq(c, compilation))
        {
            self.compilations.remove(&compilation.start());
        }
        debug!(%compilation, "compilation evicted");
        delta.evicted.push(compilation.clone());
    }

    pub fn regions(&self) -> &[CodeRegion] {
        &self.regions
    }

    pub fn find_region(&self, addr: VirtAddr) -> Option<&CodeRegion> {
        let after = self.regions.partition_point(|r| r.range.start <= addr);
        let region = self.regions.get(after.checked_sub(1)?)?;
        region.range.contains(addr).then_some(region)
    }

    /// Live compilation whose code contains `addr`; `None` in padding between
    /// compilations or in evicted code.
    pub fn find_compilation(&self, addr: VirtAddr) -> Option<Arc<Compilation>> {
        self.find_region(addr)?;
        let (_, compilation) = self.compilations.range(..=addr).next_back()?;
        (compilation.contains(addr) && !compilation.is_evicted()).then(|| compilation.clone())
    }

    /// Live compilations of method `method_id`, oldest first.
    pub fn compilations_for(&self, method_id: u64) -> Vec<Arc<Compilation>> {
        let mut found: Vec<_> = self
            .compilations
            .values()
            .filter(|c| c.method_id == method_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.serial);
        found
    }

    pub fn compilations(&self) -> impl Iterator<Item = &Arc<Compilation>> {
        self.compilations.values()
    }

    pub fn len(&self) -> usize {
        self.compilations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compilations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BootHeader, Kind};
    use crate::testing::{ClassSpec, CompilationSpec, ImageBuilder};

    const CODE: u64 = 0x4000_0000;

    fn setup() -> (ImageBuilder, ClassAccess, VirtAddr) {
        let mut image = ImageBuilder::new();
        image.add_class(ClassSpec::tuple("Foo").method(7, "bar", "()V").field("x", Kind::Int));
        image.add_code_region(CODE, 0x1000, "boot-code", CodeRegionKind::Boot);
        let mut classes = ClassAccess::new();
        classes.update(&image.memory(), image.class_registry()).unwrap();
        let header = BootHeader::read(&image.memory(), image.boot_address()).unwrap();
        (image, classes, header.code_cache)
    }

    #[test]
    fn lookup_skips_padding() {
        let (mut image, classes, table) = setup();
        image.add_compilation(
            0,
            CompilationSpec::new(1, 7, CODE, 0x40)
                .entry(4)
                .frame(0x20)
                .debug(0, 0)
                .debug(0x10, 5),
        );
        image.add_compilation(0, CompilationSpec::new(2, 7, CODE + 0x80, 0x40));
        let mut cache = CodeCacheAccess::new();
        let delta = cache.update(&image.memory(), &classes, table).unwrap();
        assert_eq!(delta.added.len(), 2);

        let c = cache.find_compilation(VirtAddr(CODE + 0x18)).unwrap();
        assert_eq!(c.serial, 1);
        assert_eq!(c.method.as_ref().unwrap().to_string(), "Foo.bar()V");
        assert_eq!(c.bci_at(VirtAddr(CODE + 0x18)), Some(5));
        assert_eq!(c.bci_at(VirtAddr(CODE + 0x8)), Some(0));
        assert_eq!(c.pc_for_bci(5), Some(VirtAddr(CODE + 0x10)));
        assert_eq!(c.effective_frame_size(VirtAddr(CODE + 2)), 0);
        assert_eq!(c.effective_frame_size(VirtAddr(CODE + 0x18)), 0x20);
        assert_eq!(c.code.len(), 0x40);

        assert!(cache.find_compilation(VirtAddr(CODE + 0x50)).is_none(), "padding");
        assert!(cache.find_compilation(VirtAddr(CODE + 0x2000)).is_none(), "outside cache");
        assert_eq!(cache.compilations_for(7).len(), 2);
    }

    #[test]
    fn update_is_incremental() {
        let (mut image, classes, table) = setup();
        image.add_compilation(0, CompilationSpec::new(1, 7, CODE, 0x40));
        let mut cache = CodeCacheAccess::new();
        cache.update(&image.memory(), &classes, table).unwrap();
        let again = cache.update(&image.memory(), &classes, table).unwrap();
        assert!(again.is_empty());
        assert_eq!(cache.regions()[0].compilation_count, 1);
    }

    #[test]
    fn eviction_is_reported() {
        let (mut image, classes, table) = setup();
        let record = image.add_compilation(0, CompilationSpec::new(1, 7, CODE, 0x40));
        let mut cache = CodeCacheAccess::new();
        cache.update(&image.memory(), &classes, table).unwrap();
        let held = cache.find_compilation(VirtAddr(CODE + 4)).unwrap();

        image.evict(record);
        let delta = cache.update(&image.memory(), &classes, table).unwrap();
        assert_eq!(delta.evicted.len(), 1);
        assert!(Arc::ptr_eq(&delta.evicted[0], &held));
        assert!(held.is_evicted());
        assert!(cache.find_compilation(VirtAddr(CODE + 4)).is_none());
    }

    #[test]
    fn reused_record_replaces_compilation() {
        let (mut image, classes, table) = setup();
        let record = image.add_compilation(0, CompilationSpec::new(1, 7, CODE, 0x40));
        let mut cache = CodeCacheAccess::new();
        cache.update(&image.memory(), &classes, table).unwrap();

        let mut mem = image.memory();
        mem.poke_word(record, 9);
        let delta = cache.update(&image.memory(), &classes, table).unwrap();
        assert_eq!(delta.evicted.len(), 1);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(cache.find_compilation(VirtAddr(CODE)).unwrap().serial, 9);
    }

    #[test]
    fn disassembles_code() {
        let (mut image, classes, table) = setup();
        image.add_compilation(0, CompilationSpec::new(1, 7, CODE, 4));
        let mut cache = CodeCacheAccess::new();
        cache.update(&image.memory(), &classes, table).unwrap();
        let insns = cache.find_compilation(VirtAddr(CODE)).unwrap().disassemble(DisasmStyle::Intel);
        assert_eq!(insns.len(), 4);
        assert_eq!(insns[0].text, "nop");
    }
}

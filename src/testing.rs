//! Simulated targets for unit tests.
//!
//! [`SimMemory`] is a sparse address space shared between clones, so a test
//! can keep mutating the target while a session reads it. [`ImageBuilder`]
//! lays out VM metadata in that memory the way a real VM publishes it, and
//! [`SimTarget`] adds scripted execution on top.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{
    Backend, HardwareWatch, Interrupter, MemoryChannel, ProcessChannel, StopEvent, StopWaiter,
};
use crate::error::{Error, Result};
use crate::layout::*;
use crate::registers::RegisterSet;
use crate::types::{AddressRange, ThreadId, VirtAddr};

#[derive(Default)]
struct SimState {
    regions: BTreeMap<u64, Vec<u8>>,
    registers: HashMap<ThreadId, RegisterSet>,
    threads: Vec<ThreadId>,
}

/// Sparse little-endian address space plus per-thread registers.
#[derive(Clone, Default)]
pub struct SimMemory {
    state: Arc<Mutex<SimState>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` zero bytes at `start`, replacing any region starting there.
    pub fn map(&mut self, start: VirtAddr, size: u64) {
        self.state.lock().regions.insert(start.0, vec![0; size as usize]);
    }

    pub fn unmap(&mut self, start: VirtAddr) {
        self.state.lock().regions.remove(&start.0);
    }

    pub fn poke(&mut self, addr: VirtAddr, data: &[u8]) {
        self.store(addr, data).expect("poke into unmapped memory");
    }

    pub fn poke_word(&mut self, addr: VirtAddr, value: u64) {
        self.poke(addr, &value.to_le_bytes());
    }

    pub fn poke_u32(&mut self, addr: VirtAddr, value: u32) {
        self.poke(addr, &value.to_le_bytes());
    }

    pub fn peek(&self, addr: VirtAddr, len: usize) -> Vec<u8> {
        self.read_bytes(addr, len).expect("peek into unmapped memory")
    }

    pub fn add_thread(&mut self, thread: ThreadId, registers: RegisterSet) {
        let mut state = self.state.lock();
        if !state.threads.contains(&thread) {
            state.threads.push(thread);
        }
        state.registers.insert(thread, registers);
    }

    pub fn remove_thread(&mut self, thread: ThreadId) {
        let mut state = self.state.lock();
        state.threads.retain(|&t| t != thread);
        state.registers.remove(&thread);
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.state.lock().threads.clone()
    }

    pub fn update_registers(&mut self, thread: ThreadId, update: impl FnOnce(&mut RegisterSet)) {
        let mut state = self.state.lock();
        update(state.registers.entry(thread).or_default());
    }

    fn store(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let (start, bytes) = state
            .regions
            .range_mut(..=addr.0)
            .next_back()
            .ok_or(Error::UnreadableMemory { addr, len: data.len() })?;
        let offset = (addr.0 - *start) as usize;
        let dest = bytes
            .get_mut(offset..offset + data.len())
            .ok_or(Error::UnreadableMemory { addr, len: data.len() })?;
        dest.copy_from_slice(data);
        Ok(())
    }
}

impl MemoryChannel for SimMemory {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (start, bytes) = state
            .regions
            .range(..=addr.0)
            .next_back()
            .ok_or(Error::UnreadableMemory { addr, len })?;
        let offset = (addr.0 - *start) as usize;
        bytes
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or(Error::UnreadableMemory { addr, len })
    }

    fn write_bytes(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.store(addr, data)
    }

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet> {
        self.state
            .lock()
            .registers
            .get(&thread)
            .cloned()
            .ok_or_else(|| Error::Register(format!("no thread {}", thread)))
    }

    fn backend(&self) -> Backend {
        Backend::Simulated
    }

    fn mapped_ranges(&self) -> Vec<AddressRange> {
        self.state
            .lock()
            .regions
            .iter()
            .map(|(start, bytes)| AddressRange::new(VirtAddr(*start), bytes.len() as u64))
            .collect()
    }
}

// ── Boot image builder ──────────────────────────────────────────────

pub const IMAGE_BASE: u64 = 0x1000_0000;
const IMAGE_SIZE: u64 = 0x10_0000;
const CLASS_CAPACITY: u64 = 256;
const REGION_CAPACITY: u64 = 16;
const COMPILATION_CAPACITY: u64 = 256;
const TRIGGER_CAPACITY: u64 = 16;

/// Description of a class to register.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    kind: ClassKind,
    element: Option<Kind>,
    superclass: Option<String>,
    fields: Vec<(String, String, Kind)>,
    methods: Vec<(u64, String, String)>,
}

impl ClassSpec {
    pub fn tuple(name: &str) -> Self {
        ClassSpec {
            name: name.to_string(),
            kind: ClassKind::Tuple,
            element: None,
            superclass: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn array(name: &str, element: Kind) -> Self {
        ClassSpec {
            kind: ClassKind::Array,
            element: Some(element),
            ..ClassSpec::tuple(name)
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn field(mut self, name: &str, kind: Kind) -> Self {
        self.fields.push((name.to_string(), String::new(), kind));
        self
    }

    pub fn ref_field(mut self, name: &str, type_name: &str) -> Self {
        self.fields.push((name.to_string(), type_name.to_string(), Kind::Reference));
        self
    }

    pub fn method(mut self, id: u64, name: &str, signature: &str) -> Self {
        self.methods.push((id, name.to_string(), signature.to_string()));
        self
    }
}

/// Description of one compiled method.
#[derive(Debug, Clone)]
pub struct CompilationSpec {
    pub serial: u64,
    pub method_id: u64,
    pub code_start: VirtAddr,
    pub code_size: u64,
    pub entry_offset: u32,
    pub frame_size: u32,
    pub debug: Vec<(u32, u32)>,
    pub call_sites: Vec<(u32, CallKind, u64)>,
    pub tier: CompilerTier,
}

impl CompilationSpec {
    pub fn new(serial: u64, method_id: u64, code_start: u64, code_size: u64) -> Self {
        CompilationSpec {
            serial,
            method_id,
            code_start: VirtAddr(code_start),
            code_size,
            entry_offset: 0,
            frame_size: 0,
            debug: Vec::new(),
            call_sites: Vec::new(),
            tier: CompilerTier::Baseline,
        }
    }

    pub fn entry(mut self, offset: u32) -> Self {
        self.entry_offset = offset;
        self
    }

    pub fn frame(mut self, size: u32) -> Self {
        self.frame_size = size;
        self
    }

    pub fn debug(mut self, pc_offset: u32, bci: u32) -> Self {
        self.debug.push((pc_offset, bci));
        self
    }

    pub fn call(mut self, pc_offset: u32, kind: CallKind, target: u64) -> Self {
        self.call_sites.push((pc_offset, kind, target));
        self
    }
}

/// Description of a VM thread.
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub handle: u64,
    pub name: String,
    pub state: VmThreadState,
    pub stack_base: u64,
    pub stack_size: u64,
    pub locals_size: u64,
}

impl ThreadSpec {
    pub fn new(handle: u64, name: &str, stack_base: u64, stack_size: u64) -> Self {
        ThreadSpec {
            handle,
            name: name.to_string(),
            state: VmThreadState::Running,
            stack_base,
            stack_size,
            locals_size: 0x100,
        }
    }
}

struct CodeRegionSlot {
    record: VirtAddr,
    list: VirtAddr,
    compilations: Vec<VirtAddr>,
}

/// Writes VM metadata into a [`SimMemory`] in the layout a VM publishes.
pub struct ImageBuilder {
    memory: SimMemory,
    next_free: u64,
    class_table: VirtAddr,
    class_entries: VirtAddr,
    class_count: u64,
    class_records: HashMap<String, (VirtAddr, Vec<(String, String, Kind, u32)>)>,
    code_table: VirtAddr,
    code_regions: Vec<CodeRegionSlot>,
    thread_head: VirtAddr,
    threads: Vec<(u64, VirtAddr)>,
    heap_table: VirtAddr,
    heap_regions: Vec<HeapRegionRecord>,
    gc_info: VirtAddr,
    trigger_table: VirtAddr,
    trigger_count: u64,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut memory = SimMemory::new();
        memory.map(VirtAddr(IMAGE_BASE), IMAGE_SIZE);
        let mut image = ImageBuilder {
            memory,
            next_free: IMAGE_BASE + BOOT_HEADER_SIZE as u64,
            class_table: VirtAddr::NULL,
            class_entries: VirtAddr::NULL,
            class_count: 0,
            class_records: HashMap::new(),
            code_table: VirtAddr::NULL,
            code_regions: Vec::new(),
            thread_head: VirtAddr::NULL,
            threads: Vec::new(),
            heap_table: VirtAddr::NULL,
            heap_regions: Vec::new(),
            gc_info: VirtAddr::NULL,
            trigger_table: VirtAddr::NULL,
            trigger_count: 0,
        };
        image.class_table = image.alloc(16);
        image.class_entries = image.alloc(CLASS_CAPACITY * WORD_SIZE);
        image.code_table = image.alloc(16);
        let code_records = image.alloc(REGION_CAPACITY * CODE_REGION_RECORD_SIZE as u64);
        image.thread_head = image.alloc(WORD_SIZE);
        image.heap_table = image.alloc(16);
        let heap_records = image.alloc(REGION_CAPACITY * HEAP_REGION_RECORD_SIZE as u64);
        image.gc_info = image.alloc(16);
        image.trigger_table = image.alloc(16);
        let trigger_records = image.alloc(TRIGGER_CAPACITY * TRIGGER_RECORD_SIZE as u64);

        let base = VirtAddr(IMAGE_BASE);
        let mem = &mut image.memory;
        mem.poke_word(base, BOOT_MAGIC);
        mem.poke_u32(base + 8, BOOT_VERSION);
        mem.poke_u32(base + 12, WORD_SIZE as u32);
        mem.poke_word(base + 16, image.class_table.0);
        mem.poke_word(base + 24, image.code_table.0);
        mem.poke_word(base + 32, image.thread_head.0);
        mem.poke_word(base + 40, image.heap_table.0);
        mem.poke_word(base + 48, image.gc_info.0);
        mem.poke_word(base + 56, image.trigger_table.0);
        mem.poke_word(image.class_table + 8, image.class_entries.0);
        mem.poke_word(image.code_table + 8, code_records.0);
        mem.poke_word(image.heap_table + 8, heap_records.0);
        mem.poke_word(image.trigger_table + 8, trigger_records.0);
        image
    }

    /// Shared handle to the simulated memory.
    pub fn memory(&self) -> SimMemory {
        self.memory.clone()
    }

    pub fn boot_address(&self) -> VirtAddr {
        VirtAddr(IMAGE_BASE)
    }

    pub fn class_registry(&self) -> VirtAddr {
        self.class_table
    }

    fn alloc(&mut self, size: u64) -> VirtAddr {
        let addr = VirtAddr(self.next_free);
        self.next_free += (size + 7) & !7;
        assert!(self.next_free <= IMAGE_BASE + IMAGE_SIZE, "boot image full");
        addr
    }

    fn string(&mut self, text: &str) -> VirtAddr {
        if text.is_empty() {
            return VirtAddr::NULL;
        }
        let addr = self.alloc(WORD_SIZE + text.len() as u64);
        self.memory.poke_word(addr, text.len() as u64);
        self.memory.poke(addr + WORD_SIZE, text.as_bytes());
        addr
    }

    fn words(&mut self, values: &[u64]) -> VirtAddr {
        if values.is_empty() {
            return VirtAddr::NULL;
        }
        let addr = self.alloc(values.len() as u64 * WORD_SIZE);
        for (i, value) in values.iter().enumerate() {
            self.memory.poke_word(addr + i as u64 * WORD_SIZE, *value);
        }
        addr
    }

    /// Register a class; returns the address of its hub.
    pub fn add_class(&mut self, spec: ClassSpec) -> VirtAddr {
        assert!(self.class_count < CLASS_CAPACITY, "class registry full");
        let (super_record, mut fields) = match &spec.superclass {
            Some(name) => self.class_records.get(name).cloned().expect("superclass not registered"),
            None => (VirtAddr::NULL, Vec::new()),
        };
        let mut offset = fields
            .iter()
            .map(|f| f.3 + f.2.size() as u32)
            .max()
            .unwrap_or(MISC_OFFSET as u32 + 8);
        for (name, type_name, kind) in &spec.fields {
            let size = kind.size().max(1) as u32;
            offset = (offset + size - 1) / size * size;
            fields.push((name.clone(), type_name.clone(), *kind, offset));
            offset += size;
        }
        let instance_size = ((offset as u64 + 7) & !7).max(16);

        let record = self.alloc(CLASS_RECORD_SIZE as u64);
        let hub = self.alloc(16);
        let name = self.string(&spec.name);

        let field_table = if fields.is_empty() {
            VirtAddr::NULL
        } else {
            self.alloc(fields.len() as u64 * FIELD_RECORD_SIZE as u64)
        };
        for (i, (fname, ftype, kind, foffset)) in fields.iter().enumerate() {
            let at = field_table + (i * FIELD_RECORD_SIZE) as u64;
            let fname = self.string(fname);
            let ftype = self.string(ftype);
            self.memory.poke_word(at, fname.0);
            self.memory.poke_word(at + 8, ftype.0);
            self.memory.poke_u32(at + 16, kind.code());
            self.memory.poke_u32(at + 20, *foffset);
        }

        let method_table = if spec.methods.is_empty() {
            VirtAddr::NULL
        } else {
            self.alloc(spec.methods.len() as u64 * METHOD_RECORD_SIZE as u64)
        };
        for (i, (id, mname, sig)) in spec.methods.iter().enumerate() {
            let at = method_table + (i * METHOD_RECORD_SIZE) as u64;
            let mname = self.string(mname);
            let sig = self.string(sig);
            self.memory.poke_word(at, *id);
            self.memory.poke_word(at + 8, mname.0);
            self.memory.poke_word(at + 16, sig.0);
        }
        let method_ids: Vec<u64> = spec.methods.iter().map(|m| m.0).collect();
        let vtable = self.words(&method_ids);

        let id = self.class_count as u32 + 1;
        let mem = &mut self.memory;
        mem.poke_u32(record, id);
        mem.poke_u32(record + 4, spec.kind.code());
        mem.poke_word(record + 8, name.0);
        mem.poke_word(record + 16, super_record.0);
        mem.poke_word(record + 24, hub.0);
        mem.poke_word(record + 32, instance_size);
        mem.poke_u32(record + 40, spec.element.map_or(0, Kind::code));
        mem.poke_word(record + 48, fields.len() as u64);
        mem.poke_word(record + 56, field_table.0);
        mem.poke_word(record + 64, spec.methods.len() as u64);
        mem.poke_word(record + 72, method_table.0);
        mem.poke_word(record + 80, method_ids.len() as u64);
        mem.poke_word(record + 88, vtable.0);

        mem.poke_word(self.class_entries + self.class_count * WORD_SIZE, record.0);
        self.class_count += 1;
        mem.poke_word(self.class_table, self.class_count);
        self.class_records.insert(spec.name.clone(), (record, fields));
        hub
    }

    /// Add a code region backed by mapped memory filled with `nop`s.
    pub fn add_code_region(
        &mut self,
        start: u64,
        size: u64,
        name: &str,
        kind: CodeRegionKind,
    ) -> usize {
        let index = self.code_regions.len();
        assert!((index as u64) < REGION_CAPACITY, "too many code regions");
        self.memory.map(VirtAddr(start), size);
        self.memory.poke(VirtAddr(start), &vec![0x90; size as usize]);

        let records = VirtAddr(self.memory.read_word(self.code_table + 8).unwrap_or(0));
        let record = records + (index * CODE_REGION_RECORD_SIZE) as u64;
        let list = self.alloc(COMPILATION_CAPACITY * WORD_SIZE);
        let name = self.string(name);
        let mem = &mut self.memory;
        mem.poke_word(record, start);
        mem.poke_word(record + 8, size);
        mem.poke_word(record + 16, name.0);
        mem.poke_u32(record + 24, if kind == CodeRegionKind::Boot { 0 } else { 1 });
        mem.poke_word(record + 32, 0);
        mem.poke_word(record + 40, list.0);
        mem.poke_word(self.code_table, index as u64 + 1);
        self.code_regions.push(CodeRegionSlot {
            record,
            list,
            compilations: Vec::new(),
        });
        index
    }

    /// Publish a compilation in code region `region`; returns its record address.
    pub fn add_compilation(&mut self, region: usize, spec: CompilationSpec) -> VirtAddr {
        let record = self.alloc(COMPILATION_RECORD_SIZE as u64);
        let debug = if spec.debug.is_empty() {
            VirtAddr::NULL
        } else {
            self.alloc(spec.debug.len() as u64 * DEBUG_ENTRY_SIZE as u64)
        };
        for (i, (pc, bci)) in spec.debug.iter().enumerate() {
            let at = debug + (i * DEBUG_ENTRY_SIZE) as u64;
            self.memory.poke_u32(at, *pc);
            self.memory.poke_u32(at + 4, *bci);
        }
        let calls = if spec.call_sites.is_empty() {
            VirtAddr::NULL
        } else {
            self.alloc(spec.call_sites.len() as u64 * CALL_SITE_SIZE as u64)
        };
        for (i, (pc, kind, target)) in spec.call_sites.iter().enumerate() {
            let at = calls + (i * CALL_SITE_SIZE) as u64;
            let code = match kind {
                CallKind::Direct => 0,
                CallKind::Indirect => 1,
                CallKind::Safepoint => 2,
                CallKind::DataPatch => 3,
            };
            self.memory.poke_u32(at, *pc);
            self.memory.poke_u32(at + 4, code);
            self.memory.poke_word(at + 8, *target);
        }
        let mem = &mut self.memory;
        mem.poke_word(record, spec.serial);
        mem.poke_word(record + 8, spec.method_id);
        mem.poke_word(record + 16, spec.code_start.0);
        mem.poke_word(record + 24, spec.code_size);
        mem.poke_u32(record + 32, spec.entry_offset);
        mem.poke_u32(record + 36, spec.frame_size);
        mem.poke_word(record + 40, spec.debug.len() as u64);
        mem.poke_word(record + 48, debug.0);
        mem.poke_word(record + 56, spec.call_sites.len() as u64);
        mem.poke_word(record + 64, calls.0);
        mem.poke_u32(record + 88, if spec.tier == CompilerTier::Baseline { 0 } else { 1 });

        self.code_regions[region].compilations.push(record);
        self.write_compilation_list(region);
        record
    }

    /// Drop a compilation from its region's list, as the code cache does on eviction.
    pub fn evict(&mut self, record: VirtAddr) {
        for region in 0..self.code_regions.len() {
            let slot = &mut self.code_regions[region];
            let before = slot.compilations.len();
            slot.compilations.retain(|&c| c != record);
            if slot.compilations.len() != before {
                self.write_compilation_list(region);
            }
        }
    }

    fn write_compilation_list(&mut self, region: usize) {
        let slot = &self.code_regions[region];
        for (i, c) in slot.compilations.iter().enumerate() {
            self.memory.poke_word(slot.list + i as u64 * WORD_SIZE, c.0);
        }
        self.memory.poke_word(slot.record + 32, slot.compilations.len() as u64);
    }

    /// Add a VM thread; maps its stack and registers it with the OS thread list.
    pub fn add_thread(&mut self, spec: ThreadSpec) -> VirtAddr {
        let record = self.alloc(THREAD_RECORD_SIZE as u64);
        let name = self.string(&spec.name);
        self.memory.map(VirtAddr(spec.stack_base), spec.stack_size);
        let locals_start = spec.stack_base + spec.stack_size - spec.locals_size;
        let mem = &mut self.memory;
        mem.poke_word(record + 8, spec.handle);
        mem.poke_word(record + 16, name.0);
        mem.poke_u32(record + 24, spec.state.code());
        mem.poke_u32(record + 28, self.threads.len() as u32 + 1);
        mem.poke_word(record + 32, spec.stack_base);
        mem.poke_word(record + 40, spec.stack_size);
        mem.poke_word(record + 48, locals_start);
        mem.poke_word(record + 56, spec.locals_size);

        let mut registers = RegisterSet::new();
        registers.set_sp(VirtAddr(locals_start));
        mem.add_thread(ThreadId(spec.handle), registers);
        self.threads.push((spec.handle, record));
        self.write_thread_list();
        record
    }

    pub fn remove_thread(&mut self, handle: u64) {
        self.threads.retain(|t| t.0 != handle);
        self.memory.remove_thread(ThreadId(handle));
        self.write_thread_list();
    }

    fn write_thread_list(&mut self) {
        let head = self.threads.first().map_or(0, |t| t.1 .0);
        self.memory.poke_word(self.thread_head, head);
        for pair in self.threads.windows(2) {
            self.memory.poke_word(pair[0].1, pair[1].1 .0);
        }
        if let Some(last) = self.threads.last() {
            self.memory.poke_word(last.1, 0);
        }
    }

    /// Add a heap region and map its memory.
    pub fn add_heap_region(
        &mut self,
        start: u64,
        size: u64,
        top: u64,
        kind: HeapRegionKind,
    ) -> usize {
        self.memory.map(VirtAddr(start), size);
        self.heap_regions.push(HeapRegionRecord {
            start: VirtAddr(start),
            size,
            top: VirtAddr(top),
            name: String::new(),
            kind,
        });
        self.write_heap_regions();
        self.heap_regions.len() - 1
    }

    pub fn set_heap_region(&mut self, index: usize, kind: HeapRegionKind, top: u64) {
        self.heap_regions[index].kind = kind;
        self.heap_regions[index].top = VirtAddr(top);
        self.write_heap_regions();
    }

    fn write_heap_regions(&mut self) {
        let records = VirtAddr(self.memory.read_word(self.heap_table + 8).unwrap_or(0));
        for (i, region) in self.heap_regions.clone().iter().enumerate() {
            let at = records + (i * HEAP_REGION_RECORD_SIZE) as u64;
            self.memory.poke_word(at, region.start.0);
            self.memory.poke_word(at + 8, region.size);
            self.memory.poke_word(at + 16, region.top.0);
            self.memory.poke_u32(at + 32, region.kind.code());
        }
        self.memory.poke_word(self.heap_table, self.heap_regions.len() as u64);
    }

    pub fn set_gc(&mut self, phase: HeapPhase, gc_count: u64) {
        self.memory.poke_word(self.gc_info, phase.code());
        self.memory.poke_word(self.gc_info + 8, gc_count);
    }

    pub fn add_trigger(&mut self, kind_code: u32, address: u64) {
        assert!(self.trigger_count < TRIGGER_CAPACITY, "trigger table full");
        let records = VirtAddr(self.memory.read_word(self.trigger_table + 8).unwrap_or(0));
        let at = records + self.trigger_count * TRIGGER_RECORD_SIZE as u64;
        self.memory.poke_u32(at, kind_code);
        self.memory.poke_word(at + 8, address);
        self.trigger_count += 1;
        self.memory.poke_word(self.trigger_table, self.trigger_count);
    }
}

// ── Scripted execution ──────────────────────────────────────────────

/// One scripted run of the target: mutates memory and reports why it stopped.
pub type Step = Box<dyn FnOnce(&mut SimMemory) -> StopEvent + Send>;

struct SimControl {
    script: VecDeque<Step>,
    step_script: VecDeque<Step>,
    watch_slots: Vec<Option<HardwareWatch>>,
    log: Vec<String>,
    killed: bool,
}

/// Process channel over [`SimMemory`] whose runs follow a script.
///
/// `resume` runs the next scripted [`Step`]; with an empty script the
/// target keeps running until interrupted. `single_step` runs the next
/// step from the step script, or advances the thread by one byte.
#[derive(Clone)]
pub struct SimTarget {
    memory: SimMemory,
    control: Arc<Mutex<SimControl>>,
    events: Arc<Mutex<mpsc::Sender<StopEvent>>>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<StopEvent>>>>,
    boot: VirtAddr,
}

impl SimTarget {
    pub fn new(memory: SimMemory, boot: VirtAddr) -> Self {
        let (tx, rx) = mpsc::channel();
        SimTarget {
            memory,
            control: Arc::new(Mutex::new(SimControl {
                script: VecDeque::new(),
                step_script: VecDeque::new(),
                watch_slots: vec![None; 4],
                log: Vec::new(),
                killed: false,
            })),
            events: Arc::new(Mutex::new(tx)),
            receiver: Arc::new(Mutex::new(Some(rx))),
            boot,
        }
    }

    pub fn with_watch_slots(self, slots: usize) -> Self {
        self.control.lock().watch_slots = vec![None; slots];
        self
    }

    pub fn push(&self, step: impl FnOnce(&mut SimMemory) -> StopEvent + Send + 'static) {
        self.control.lock().script.push_back(Box::new(step));
    }

    pub fn push_step(&self, step: impl FnOnce(&mut SimMemory) -> StopEvent + Send + 'static) {
        self.control.lock().step_script.push_back(Box::new(step));
    }

    pub fn pending_steps(&self) -> usize {
        self.control.lock().script.len()
    }

    pub fn active_watches(&self) -> Vec<HardwareWatch> {
        self.control.lock().watch_slots.iter().flatten().copied().collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.control.lock().log.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.control.lock().killed
    }

    fn send(&self, event: StopEvent) {
        let _ = self.events.lock().send(event);
    }
}

impl MemoryChannel for SimTarget {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        self.memory.read_bytes(addr, len)
    }

    fn write_bytes(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        self.memory.write_bytes(addr, data)
    }

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet> {
        self.memory.read_registers(thread)
    }

    fn backend(&self) -> Backend {
        Backend::Simulated
    }

    fn mapped_ranges(&self) -> Vec<AddressRange> {
        self.memory.mapped_ranges()
    }
}

impl ProcessChannel for SimTarget {
    fn as_memory(&self) -> &dyn MemoryChannel {
        self
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.memory.threads())
    }

    fn boot_image_address(&self) -> Option<VirtAddr> {
        Some(self.boot)
    }

    fn resume(&mut self) -> Result<()> {
        let step = {
            let mut control = self.control.lock();
            control.log.push("resume".into());
            control.script.pop_front()
        };
        if let Some(step) = step {
            let mut memory = self.memory.clone();
            let event = step(&mut memory);
            self.send(event);
        }
        Ok(())
    }

    fn single_step(&mut self, thread: ThreadId) -> Result<()> {
        let step = {
            let mut control = self.control.lock();
            control.log.push(format!("step {}", thread));
            control.step_script.pop_front()
        };
        let mut memory = self.memory.clone();
        let event = match step {
            Some(step) => step(&mut memory),
            None => {
                memory.update_registers(thread, |regs| regs.set_ip(regs.ip() + 1));
                StopEvent::SingleStep { thread }
            }
        };
        self.send(event);
        Ok(())
    }

    fn set_instruction_pointer(&mut self, thread: ThreadId, ip: VirtAddr) -> Result<()> {
        self.memory.update_registers(thread, |regs| regs.set_ip(ip));
        Ok(())
    }

    fn stop_waiter(&mut self) -> Result<Box<dyn StopWaiter>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidRequest("stop waiter already taken".into()))?;
        Ok(Box::new(SimWaiter { receiver }))
    }

    fn interrupter(&self) -> Result<Arc<dyn Interrupter>> {
        Ok(Arc::new(SimInterrupter {
            events: self.events.clone(),
        }))
    }

    fn kill(&mut self) -> Result<()> {
        let mut control = self.control.lock();
        control.log.push("kill".into());
        control.killed = true;
        Ok(())
    }

    fn max_watchpoints(&self) -> usize {
        self.control.lock().watch_slots.len()
    }

    fn activate_watchpoint(&mut self, slot: usize, watch: &HardwareWatch) -> Result<()> {
        let mut control = self.control.lock();
        let entry = control
            .watch_slots
            .get_mut(slot)
            .ok_or_else(|| Error::InvalidRequest(format!("no watch slot {}", slot)))?;
        *entry = Some(*watch);
        Ok(())
    }

    fn deactivate_watchpoint(&mut self, slot: usize) -> Result<()> {
        if let Some(entry) = self.control.lock().watch_slots.get_mut(slot) {
            *entry = None;
        }
        Ok(())
    }
}

struct SimWaiter {
    receiver: mpsc::Receiver<StopEvent>,
}

impl StopWaiter for SimWaiter {
    fn wait(&mut self) -> Result<StopEvent> {
        self.receiver
            .recv()
            .map_err(|_| Error::Protocol("simulated target vanished".into()))
    }
}

struct SimInterrupter {
    events: Arc<Mutex<mpsc::Sender<StopEvent>>>,
}

impl Interrupter for SimInterrupter {
    fn interrupt(&self) -> Result<()> {
        let _ = self.events.lock().send(StopEvent::Paused);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_reads_fail_cleanly() {
        let mut mem = SimMemory::new();
        mem.map(VirtAddr(0x1000), 0x10);
        assert!(mem.read_bytes(VirtAddr(0x1008), 8).is_ok());
        assert!(matches!(
            mem.read_bytes(VirtAddr(0x100c), 8),
            Err(Error::UnreadableMemory { .. })
        ));
        assert!(mem.read_bytes(VirtAddr(0x800), 1).is_err());
    }

    #[test]
    fn image_has_valid_boot_header() {
        let image = ImageBuilder::new();
        let header = BootHeader::read(&image.memory(), image.boot_address()).unwrap();
        assert_eq!(header.class_registry, image.class_registry());
        assert_eq!(read_table(&image.memory(), header.class_registry).unwrap().0, 0);
    }
}

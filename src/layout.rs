//! Layout of the VM metadata the inspector reads out of target memory.
//!
//! The VM publishes a boot header at a well-known address. Everything else
//! (class registry, code cache, thread list, heap regions, GC state, system
//! trigger addresses) is reached from pointers in that header. All words are
//! 8-byte little-endian; tables are `[count][pointer to entries]` pairs.
//!
//! Object representation:
//!
//! ```text
//! origin + 0   hub      (class metadata address, or a tagged forwarding pointer)
//! origin + 8   misc     (hash / lock word)
//! origin + 16  length   (arrays only)
//! origin + 24  elements (arrays only)
//! ```

use crate::channel::{u32_at, word_at, MemoryChannel};
use crate::error::{Error, Result};
use crate::types::VirtAddr;

pub const WORD_SIZE: u64 = 8;

/// `"TELEBOOT"` read as a little-endian word.
pub const BOOT_MAGIC: u64 = u64::from_le_bytes(*b"TELEBOOT");
pub const BOOT_VERSION: u32 = 1;
pub const BOOT_HEADER_SIZE: usize = 64;

pub const HUB_OFFSET: u64 = 0;
pub const MISC_OFFSET: u64 = 8;
pub const ARRAY_LENGTH_OFFSET: u64 = 16;
pub const ARRAY_HEADER_SIZE: u64 = 24;

/// Upper bound on table sizes and string lengths; larger values mean the
/// metadata is corrupt.
const MAX_TABLE_ENTRIES: u64 = 1 << 20;
const MAX_STRING_LEN: u64 = 1 << 16;

/// Declared kind of a field, array element, or frame value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Word,
    Reference,
    Void,
}

impl Kind {
    pub fn from_code(code: u32) -> Option<Kind> {
        Some(match code {
            0 => Kind::Boolean,
            1 => Kind::Byte,
            2 => Kind::Char,
            3 => Kind::Short,
            4 => Kind::Int,
            5 => Kind::Float,
            6 => Kind::Long,
            7 => Kind::Double,
            8 => Kind::Word,
            9 => Kind::Reference,
            10 => Kind::Void,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        match self {
            Kind::Boolean => 0,
            Kind::Byte => 1,
            Kind::Char => 2,
            Kind::Short => 3,
            Kind::Int => 4,
            Kind::Float => 5,
            Kind::Long => 6,
            Kind::Double => 7,
            Kind::Word => 8,
            Kind::Reference => 9,
            Kind::Void => 10,
        }
    }

    /// Width in bytes of a value of this kind in an object.
    pub fn size(self) -> usize {
        match self {
            Kind::Boolean | Kind::Byte => 1,
            Kind::Char | Kind::Short => 2,
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double | Kind::Word | Kind::Reference => 8,
            Kind::Void => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Boolean => "boolean",
            Kind::Byte => "byte",
            Kind::Char => "char",
            Kind::Short => "short",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Long => "long",
            Kind::Double => "double",
            Kind::Word => "word",
            Kind::Reference => "reference",
            Kind::Void => "void",
        }
    }
}

fn corrupt(what: &str, addr: VirtAddr) -> Error {
    Error::CorruptBootImage(format!("{} at {}", what, addr))
}

fn kind_at(bytes: &[u8], offset: usize, addr: VirtAddr) -> Result<Kind> {
    Kind::from_code(u32_at(bytes, offset)).ok_or_else(|| corrupt("invalid kind code", addr))
}

/// Read a length-prefixed UTF-8 string. A null pointer yields an empty string.
pub fn read_string(channel: &dyn MemoryChannel, ptr: VirtAddr) -> Result<String> {
    if ptr.is_null() {
        return Ok(String::new());
    }
    let len = channel.read_word(ptr)?;
    if len > MAX_STRING_LEN {
        return Err(corrupt("oversized string", ptr));
    }
    let bytes = channel.read_bytes(ptr + WORD_SIZE, len as usize)?;
    String::from_utf8(bytes).map_err(|_| corrupt("invalid UTF-8 string", ptr))
}

/// Read a `[count][entries ptr]` table header.
pub fn read_table(channel: &dyn MemoryChannel, addr: VirtAddr) -> Result<(u64, VirtAddr)> {
    let bytes = channel.read_bytes(addr, 16)?;
    let count = word_at(&bytes, 0);
    if count > MAX_TABLE_ENTRIES {
        return Err(corrupt("oversized table", addr));
    }
    Ok((count, VirtAddr(word_at(&bytes, 8))))
}

/// Read `count` fixed-size records starting at `base`, decoding each with `decode`.
fn read_records<T>(
    channel: &dyn MemoryChannel,
    base: VirtAddr,
    count: u64,
    size: usize,
    mut decode: impl FnMut(&[u8], VirtAddr) -> Result<T>,
) -> Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = channel.read_bytes(base, count as usize * size)?;
    bytes
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| decode(chunk, base + (i * size) as u64))
        .collect()
}

/// Read `count` pointers starting at `base`.
pub fn read_pointers(
    channel: &dyn MemoryChannel,
    base: VirtAddr,
    count: u64,
) -> Result<Vec<VirtAddr>> {
    read_records(channel, base, count, 8, |b, _| Ok(VirtAddr(word_at(b, 0))))
}

// ── Boot header ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootHeader {
    pub address: VirtAddr,
    pub class_registry: VirtAddr,
    pub code_cache: VirtAddr,
    pub thread_list: VirtAddr,
    pub heap_info: VirtAddr,
    pub gc_info: VirtAddr,
    pub trigger_table: VirtAddr,
}

impl BootHeader {
    /// Read and validate the header. A bad magic or version is fatal.
    pub fn read(channel: &dyn MemoryChannel, address: VirtAddr) -> Result<Self> {
        let bytes = channel
            .read_bytes(address, BOOT_HEADER_SIZE)
            .map_err(|e| match e {
                Error::UnreadableMemory { .. } => corrupt("unreadable boot header", address),
                other => other,
            })?;
        if word_at(&bytes, 0) != BOOT_MAGIC {
            return Err(corrupt("bad boot image magic", address));
        }
        let version = u32_at(&bytes, 8);
        if version != BOOT_VERSION {
            return Err(Error::CorruptBootImage(format!(
                "unsupported boot image version {}",
                version
            )));
        }
        if u32_at(&bytes, 12) as u64 != WORD_SIZE {
            return Err(corrupt("unsupported word size", address));
        }
        Ok(BootHeader {
            address,
            class_registry: VirtAddr(word_at(&bytes, 16)),
            code_cache: VirtAddr(word_at(&bytes, 24)),
            thread_list: VirtAddr(word_at(&bytes, 32)),
            heap_info: VirtAddr(word_at(&bytes, 40)),
            gc_info: VirtAddr(word_at(&bytes, 48)),
            trigger_table: VirtAddr(word_at(&bytes, 56)),
        })
    }
}

// ── Class registry ──────────────────────────────────────────────────

pub const CLASS_RECORD_SIZE: usize = 112;
pub const FIELD_RECORD_SIZE: usize = 24;
pub const METHOD_RECORD_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Tuple,
    Array,
    Hub,
    Interface,
}

impl ClassKind {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ClassKind::Tuple,
            1 => ClassKind::Array,
            2 => ClassKind::Hub,
            3 => ClassKind::Interface,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        match self {
            ClassKind::Tuple => 0,
            ClassKind::Array => 1,
            ClassKind::Hub => 2,
            ClassKind::Interface => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub name: String,
    /// Declared type name for reference fields; empty for primitives.
    pub type_name: String,
    pub kind: Kind,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    pub id: u64,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub address: VirtAddr,
    pub id: u32,
    pub kind: ClassKind,
    pub name: String,
    pub super_class: VirtAddr,
    pub hub: VirtAddr,
    pub instance_size: u64,
    pub element_kind: Option<Kind>,
    pub fields: Vec<FieldRecord>,
    pub methods: Vec<MethodRecord>,
    pub vtable: Vec<u64>,
    pub itable: Vec<u32>,
}

impl ClassRecord {
    pub fn read(channel: &dyn MemoryChannel, address: VirtAddr) -> Result<Self> {
        let b = channel.read_bytes(address, CLASS_RECORD_SIZE)?;
        let kind = ClassKind::from_code(u32_at(&b, 4))
            .ok_or_else(|| corrupt("invalid class kind", address))?;
        let element_kind = match kind {
            ClassKind::Array => Some(kind_at(&b, 40, address)?),
            _ => None,
        };

        let fields = read_records(
            channel,
            VirtAddr(word_at(&b, 56)),
            bounded(word_at(&b, 48), address)?,
            FIELD_RECORD_SIZE,
            |f, at| {
                Ok(FieldRecord {
                    name: read_string(channel, VirtAddr(word_at(f, 0)))?,
                    type_name: read_string(channel, VirtAddr(word_at(f, 8)))?,
                    kind: kind_at(f, 16, at)?,
                    offset: u32_at(f, 20),
                })
            },
        )?;
        let methods = read_records(
            channel,
            VirtAddr(word_at(&b, 72)),
            bounded(word_at(&b, 64), address)?,
            METHOD_RECORD_SIZE,
            |m, _| {
                Ok(MethodRecord {
                    id: word_at(m, 0),
                    name: read_string(channel, VirtAddr(word_at(m, 8)))?,
                    signature: read_string(channel, VirtAddr(word_at(m, 16)))?,
                })
            },
        )?;
        let vtable = read_records(
            channel,
            VirtAddr(word_at(&b, 88)),
            bounded(word_at(&b, 80), address)?,
            8,
            |w, _| Ok(word_at(w, 0)),
        )?;
        let itable = read_records(
            channel,
            VirtAddr(word_at(&b, 104)),
            bounded(word_at(&b, 96), address)?,
            8,
            |w, _| Ok(word_at(w, 0) as u32),
        )?;

        Ok(ClassRecord {
            address,
            id: u32_at(&b, 0),
            kind,
            name: read_string(channel, VirtAddr(word_at(&b, 8)))?,
            super_class: VirtAddr(word_at(&b, 16)),
            hub: VirtAddr(word_at(&b, 24)),
            instance_size: word_at(&b, 32),
            element_kind,
            fields,
            methods,
            vtable,
            itable,
        })
    }
}

fn bounded(count: u64, addr: VirtAddr) -> Result<u64> {
    if count > MAX_TABLE_ENTRIES {
        return Err(corrupt("oversized table", addr));
    }
    Ok(count)
}

// ── Code cache ──────────────────────────────────────────────────────

pub const CODE_REGION_RECORD_SIZE: usize = 48;
pub const COMPILATION_RECORD_SIZE: usize = 96;
pub const DEBUG_ENTRY_SIZE: usize = 8;
pub const CALL_SITE_SIZE: usize = 16;
pub const FRAME_VALUE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRegionKind {
    Boot,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegionRecord {
    pub start: VirtAddr,
    pub size: u64,
    pub name: String,
    pub kind: CodeRegionKind,
    pub compilations: Vec<VirtAddr>,
}

impl CodeRegionRecord {
    pub fn read_all(channel: &dyn MemoryChannel, table: VirtAddr) -> Result<Vec<Self>> {
        let (count, base) = read_table(channel, table)?;
        read_records(channel, base, count, CODE_REGION_RECORD_SIZE, |r, at| {
            let kind = match u32_at(r, 24) {
                0 => CodeRegionKind::Boot,
                1 => CodeRegionKind::Runtime,
                _ => return Err(corrupt("invalid code region kind", at)),
            };
            let compilations = read_pointers(
                channel,
                VirtAddr(word_at(r, 40)),
                bounded(word_at(r, 32), at)?,
            )?;
            Ok(CodeRegionRecord {
                start: VirtAddr(word_at(r, 0)),
                size: word_at(r, 8),
                name: read_string(channel, VirtAddr(word_at(r, 16)))?,
                kind,
                compilations,
            })
        })
    }
}

/// PC offset to bytecode position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEntry {
    pub pc_offset: u32,
    pub bci: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Direct,
    Indirect,
    Safepoint,
    DataPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub pc_offset: u32,
    pub kind: CallKind,
    pub target: VirtAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRole {
    Local,
    Stack,
    Lock,
}

/// Where a frame value lives when the frame is stopped at a debug position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    Register(u16),
    /// Byte offset from the frame's stack pointer.
    StackSlot(i64),
    Constant(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameValue {
    /// Index into the compilation's debug entries.
    pub debug_index: u32,
    pub role: ValueRole,
    pub index: u16,
    pub location: ValueLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerTier {
    Baseline,
    Optimizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRecord {
    pub address: VirtAddr,
    pub serial: u64,
    pub method_id: u64,
    pub code_start: VirtAddr,
    pub code_size: u64,
    pub entry_offset: u32,
    pub frame_size: u32,
    pub debug_entries: Vec<DebugEntry>,
    pub call_sites: Vec<CallSite>,
    pub frame_values: Vec<FrameValue>,
    pub tier: CompilerTier,
}

impl CompilationRecord {
    pub fn read(channel: &dyn MemoryChannel, address: VirtAddr) -> Result<Self> {
        let b = channel.read_bytes(address, COMPILATION_RECORD_SIZE)?;
        let debug_entries = read_records(
            channel,
            VirtAddr(word_at(&b, 48)),
            bounded(word_at(&b, 40), address)?,
            DEBUG_ENTRY_SIZE,
            |d, _| {
                Ok(DebugEntry {
                    pc_offset: u32_at(d, 0),
                    bci: u32_at(d, 4),
                })
            },
        )?;
        let call_sites = read_records(
            channel,
            VirtAddr(word_at(&b, 64)),
            bounded(word_at(&b, 56), address)?,
            CALL_SITE_SIZE,
            |c, at| {
                let kind = match u32_at(c, 4) {
                    0 => CallKind::Direct,
                    1 => CallKind::Indirect,
                    2 => CallKind::Safepoint,
                    3 => CallKind::DataPatch,
                    _ => return Err(corrupt("invalid call site kind", at)),
                };
                Ok(CallSite {
                    pc_offset: u32_at(c, 0),
                    kind,
                    target: VirtAddr(word_at(c, 8)),
                })
            },
        )?;
        let frame_values = read_records(
            channel,
            VirtAddr(word_at(&b, 80)),
            bounded(word_at(&b, 72), address)?,
            FRAME_VALUE_SIZE,
            |v, at| {
                let role = match v[4] {
                    0 => ValueRole::Local,
                    1 => ValueRole::Stack,
                    2 => ValueRole::Lock,
                    _ => return Err(corrupt("invalid frame value role", at)),
                };
                let payload = word_at(v, 8) as i64;
                let location = match v[5] {
                    0 => ValueLocation::Register(payload as u16),
                    1 => ValueLocation::StackSlot(payload),
                    2 => ValueLocation::Constant(payload),
                    _ => return Err(corrupt("invalid frame value location", at)),
                };
                Ok(FrameValue {
                    debug_index: u32_at(v, 0),
                    role,
                    index: u16::from_le_bytes([v[6], v[7]]),
                    location,
                })
            },
        )?;
        let tier = match u32_at(&b, 88) {
            0 => CompilerTier::Baseline,
            1 => CompilerTier::Optimizing,
            _ => return Err(corrupt("invalid compiler tier", address)),
        };
        Ok(CompilationRecord {
            address,
            serial: word_at(&b, 0),
            method_id: word_at(&b, 8),
            code_start: VirtAddr(word_at(&b, 16)),
            code_size: word_at(&b, 24),
            entry_offset: u32_at(&b, 32),
            frame_size: u32_at(&b, 36),
            debug_entries,
            call_sites,
            frame_values,
            tier,
        })
    }
}

// ── Threads ─────────────────────────────────────────────────────────

pub const THREAD_RECORD_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmThreadState {
    New,
    Running,
    InNative,
    Blocked,
    Waiting,
    Terminated,
}

impl VmThreadState {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => VmThreadState::New,
            1 => VmThreadState::Running,
            2 => VmThreadState::InNative,
            3 => VmThreadState::Blocked,
            4 => VmThreadState::Waiting,
            5 => VmThreadState::Terminated,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        match self {
            VmThreadState::New => 0,
            VmThreadState::Running => 1,
            VmThreadState::InNative => 2,
            VmThreadState::Blocked => 3,
            VmThreadState::Waiting => 4,
            VmThreadState::Terminated => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub address: VirtAddr,
    pub next: VirtAddr,
    pub handle: u64,
    pub name: String,
    pub state: VmThreadState,
    pub vm_id: u32,
    pub stack_base: VirtAddr,
    pub stack_size: u64,
    pub locals_start: VirtAddr,
    pub locals_size: u64,
}

impl ThreadRecord {
    pub fn read(channel: &dyn MemoryChannel, address: VirtAddr) -> Result<Self> {
        let b = channel.read_bytes(address, THREAD_RECORD_SIZE)?;
        let state = VmThreadState::from_code(u32_at(&b, 24))
            .ok_or_else(|| corrupt("invalid thread state", address))?;
        Ok(ThreadRecord {
            address,
            next: VirtAddr(word_at(&b, 0)),
            handle: word_at(&b, 8),
            name: read_string(channel, VirtAddr(word_at(&b, 16)))?,
            state,
            vm_id: u32_at(&b, 28),
            stack_base: VirtAddr(word_at(&b, 32)),
            stack_size: word_at(&b, 40),
            locals_start: VirtAddr(word_at(&b, 48)),
            locals_size: word_at(&b, 56),
        })
    }

    /// Walk the linked thread list whose head pointer is stored at `head_slot`.
    pub fn read_list(channel: &dyn MemoryChannel, head_slot: VirtAddr) -> Result<Vec<Self>> {
        let mut threads = Vec::new();
        let mut next = VirtAddr(channel.read_word(head_slot)?);
        while !next.is_null() {
            if threads.len() as u64 >= MAX_TABLE_ENTRIES {
                return Err(corrupt("cyclic thread list", head_slot));
            }
            let record = ThreadRecord::read(channel, next)?;
            next = record.next;
            threads.push(record);
        }
        Ok(threads)
    }
}

// ── Heap and GC state ───────────────────────────────────────────────

pub const HEAP_REGION_RECORD_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapRegionKind {
    Boot,
    Immortal,
    FromSpace,
    ToSpace,
    MarkSweep,
}

impl HeapRegionKind {
    pub fn code(self) -> u32 {
        match self {
            HeapRegionKind::Boot => 0,
            HeapRegionKind::Immortal => 1,
            HeapRegionKind::FromSpace => 2,
            HeapRegionKind::ToSpace => 3,
            HeapRegionKind::MarkSweep => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapRegionRecord {
    pub start: VirtAddr,
    pub size: u64,
    /// Allocation mark: `[start, top)` holds objects.
    pub top: VirtAddr,
    pub name: String,
    pub kind: HeapRegionKind,
}

impl HeapRegionRecord {
    pub fn read_all(channel: &dyn MemoryChannel, table: VirtAddr) -> Result<Vec<Self>> {
        let (count, base) = read_table(channel, table)?;
        read_records(channel, base, count, HEAP_REGION_RECORD_SIZE, |r, at| {
            let kind = match u32_at(r, 32) {
                0 => HeapRegionKind::Boot,
                1 => HeapRegionKind::Immortal,
                2 => HeapRegionKind::FromSpace,
                3 => HeapRegionKind::ToSpace,
                4 => HeapRegionKind::MarkSweep,
                _ => return Err(corrupt("invalid heap region kind", at)),
            };
            Ok(HeapRegionRecord {
                start: VirtAddr(word_at(r, 0)),
                size: word_at(r, 8),
                top: VirtAddr(word_at(r, 16)),
                name: read_string(channel, VirtAddr(word_at(r, 24)))?,
                kind,
            })
        })
    }
}

/// Heap phase as published by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapPhase {
    #[default]
    Mutating,
    Analyzing,
    Reclaiming,
}

impl HeapPhase {
    pub fn code(self) -> u64 {
        match self {
            HeapPhase::Mutating => 0,
            HeapPhase::Analyzing => 1,
            HeapPhase::Reclaiming => 2,
        }
    }

    pub fn is_collecting(self) -> bool {
        self != HeapPhase::Mutating
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcInfo {
    pub phase: HeapPhase,
    /// Number of completed collections.
    pub gc_count: u64,
}

impl GcInfo {
    pub fn read(channel: &dyn MemoryChannel, addr: VirtAddr) -> Result<Self> {
        let b = channel.read_bytes(addr, 16)?;
        let phase = match word_at(&b, 0) {
            0 => HeapPhase::Mutating,
            1 => HeapPhase::Analyzing,
            2 => HeapPhase::Reclaiming,
            _ => return Err(corrupt("invalid heap phase", addr)),
        };
        Ok(GcInfo {
            phase,
            gc_count: word_at(&b, 8),
        })
    }
}

// ── System triggers ─────────────────────────────────────────────────

pub const TRIGGER_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRecord {
    pub kind_code: u32,
    pub address: VirtAddr,
}

impl TriggerRecord {
    pub fn read_all(channel: &dyn MemoryChannel, table: VirtAddr) -> Result<Vec<Self>> {
        if table.is_null() {
            return Ok(Vec::new());
        }
        let (count, base) = read_table(channel, table)?;
        read_records(channel, base, count, TRIGGER_RECORD_SIZE, |t, _| {
            Ok(TriggerRecord {
                kind_code: u32_at(t, 0),
                address: VirtAddr(word_at(t, 8)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMemory;

    #[test]
    fn kind_codes_are_stable() {
        for code in 0..=10 {
            let kind = Kind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(Kind::from_code(11), None);
        assert_eq!(Kind::Char.size(), 2);
        assert_eq!(Kind::Reference.size(), 8);
    }

    #[test]
    fn boot_header_rejects_bad_magic() {
        let mut mem = SimMemory::new();
        mem.map(VirtAddr(0x10000), 0x100);
        mem.poke_word(VirtAddr(0x10000), 0xdead_beef);
        let err = BootHeader::read(&mem, VirtAddr(0x10000)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn boot_header_unmapped_is_fatal() {
        let mem = SimMemory::new();
        let err = BootHeader::read(&mem, VirtAddr(0x10000)).unwrap_err();
        assert!(matches!(err, Error::CorruptBootImage(_)));
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut mem = SimMemory::new();
        mem.map(VirtAddr(0x2000), 0x100);
        mem.poke_word(VirtAddr(0x2000), 3);
        mem.poke(VirtAddr(0x2008), b"Foo");
        assert_eq!(read_string(&mem, VirtAddr(0x2000)).unwrap(), "Foo");
        assert_eq!(read_string(&mem, VirtAddr::NULL).unwrap(), "");

        mem.poke_word(VirtAddr(0x2000), MAX_STRING_LEN + 1);
        assert!(read_string(&mem, VirtAddr(0x2000)).unwrap_err().is_fatal());
    }
}

//! ELF core files: writing them from a stopped target and reading them back
//! as a read-only channel.
//!
//! A core holds one `NT_PRSTATUS` note per thread (registers in
//! `user_regs_struct` order), one `PT_LOAD` segment per captured range, and
//! an `RTELE` note with the boot image address so a session can be reopened
//! on the file without configuration.

use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use tracing::{debug, warn};

use crate::channel::{
    read_only, u32_at, word_at, Backend, HardwareWatch, Interrupter, MemoryChannel, ProcessChannel,
    StopWaiter,
};
use crate::error::{Error, Result};
use crate::registers::{RegisterSet, REGISTER_COUNT};
use crate::types::{AddressRange, ThreadId, VirtAddr};

// ── ELF constants ──────────────────────────────────────────────────

const ELFMAG: &[u8] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_NONE: u8 = 0;
const ET_CORE: u16 = 4;
const EM_X86_64: u16 = 62;
const PT_NOTE: u32 = 4;
const PT_LOAD: u32 = 1;

const ELF64_EHDR_SIZE: u16 = 64;
const ELF64_PHDR_SIZE: u16 = 56;

const NT_PRSTATUS: u32 = 1;
/// Boot image address note, owner `RTELE`.
const NT_BOOT_IMAGE: u32 = 0x5254;
const BOOT_NOTE_NAME: &[u8] = b"RTELE";

/// Offset of `pr_pid` and `pr_reg` inside `elf_prstatus`.
const PRSTATUS_PID: usize = 32;
const PRSTATUS_REGS: usize = 112;
const PRSTATUS_SIZE: usize = 336;

/// Permissions flags for PT_LOAD segments.
pub const PF_R: u32 = 0x4;
pub const PF_W: u32 = 0x2;
pub const PF_X: u32 = 0x1;

/// Everything written into a core file.
pub struct CoreDumpInfo {
    pub signal: u32,
    pub threads: Vec<CoreThread>,
    pub segments: Vec<CoreSegment>,
    pub boot_image: Option<VirtAddr>,
}

pub struct CoreThread {
    pub id: ThreadId,
    pub registers: RegisterSet,
}

pub struct CoreSegment {
    pub start: VirtAddr,
    /// Permission flags (PF_R | PF_W | PF_X).
    pub flags: u32,
    pub data: Vec<u8>,
}

/// Read registers of `threads` and the contents of `ranges`.
///
/// Ranges that cannot be read are left out; threads without registers too.
pub fn capture(
    channel: &dyn MemoryChannel,
    threads: &[ThreadId],
    ranges: &[AddressRange],
    boot_image: Option<VirtAddr>,
) -> CoreDumpInfo {
    let threads = threads
        .iter()
        .filter_map(|&id| match channel.read_registers(id) {
            Ok(registers) => Some(CoreThread { id, registers }),
            Err(e) => {
                warn!(thread = %id, error = %e, "thread left out of core");
                None
            }
        })
        .collect();
    let segments = ranges
        .iter()
        .filter_map(|range| match channel.read_bytes(range.start, range.size as usize) {
            Ok(data) => Some(CoreSegment {
                start: range.start,
                flags: PF_R | PF_W,
                data,
            }),
            Err(e) => {
                warn!(%range, error = %e, "range left out of core");
                None
            }
        })
        .collect();
    CoreDumpInfo {
        signal: 0,
        threads,
        segments,
        boot_image,
    }
}

pub fn write(path: impl AsRef<Path>, info: &CoreDumpInfo) -> Result<()> {
    let bytes = generate(info)?;
    std::fs::write(path.as_ref(), &bytes)?;
    debug!(path = %path.as_ref().display(), bytes = bytes.len(), "core file written");
    Ok(())
}

/// Serialize an ELF64 header for a core dump.
pub fn serialize_elf_header(phnum: u16, phoff: u64) -> Vec<u8> {
    let mut hdr = vec![0u8; ELF64_EHDR_SIZE as usize];

    hdr[0..4].copy_from_slice(ELFMAG);
    hdr[4] = ELFCLASS64;
    hdr[5] = ELFDATA2LSB;
    hdr[6] = EV_CURRENT;
    hdr[7] = ELFOSABI_NONE;

    hdr[16..18].copy_from_slice(&ET_CORE.to_le_bytes());
    hdr[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
    // e_version
    hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
    hdr[32..40].copy_from_slice(&phoff.to_le_bytes());
    hdr[52..54].copy_from_slice(&ELF64_EHDR_SIZE.to_le_bytes());
    hdr[54..56].copy_from_slice(&ELF64_PHDR_SIZE.to_le_bytes());
    hdr[56..58].copy_from_slice(&phnum.to_le_bytes());
    hdr[58..60].copy_from_slice(&ELF64_PHDR_SIZE.to_le_bytes());

    hdr
}

pub fn serialize_phdr(
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
) -> Vec<u8> {
    let mut phdr = vec![0u8; ELF64_PHDR_SIZE as usize];

    phdr[0..4].copy_from_slice(&p_type.to_le_bytes());
    phdr[4..8].copy_from_slice(&p_flags.to_le_bytes());
    phdr[8..16].copy_from_slice(&p_offset.to_le_bytes());
    phdr[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
    // p_paddr = p_vaddr
    phdr[24..32].copy_from_slice(&p_vaddr.to_le_bytes());
    phdr[32..40].copy_from_slice(&p_filesz.to_le_bytes());
    phdr[40..48].copy_from_slice(&p_memsz.to_le_bytes());

    phdr
}

pub fn serialize_note(name: &[u8], note_type: u32, desc: &[u8]) -> Vec<u8> {
    // namesz counts the terminating NUL
    let namesz = name.len() + 1;
    let name_aligned = align4(namesz);
    let desc_aligned = align4(desc.len());

    let mut note = vec![0u8; 12 + name_aligned + desc_aligned];
    note[0..4].copy_from_slice(&(namesz as u32).to_le_bytes());
    note[4..8].copy_from_slice(&(desc.len() as u32).to_le_bytes());
    note[8..12].copy_from_slice(&note_type.to_le_bytes());
    note[12..12 + name.len()].copy_from_slice(name);
    let desc_off = 12 + name_aligned;
    note[desc_off..desc_off + desc.len()].copy_from_slice(desc);

    note
}

/// Build the NT_PRSTATUS note descriptor for one thread.
pub fn build_prstatus(signal: u32, thread: ThreadId, registers: &RegisterSet) -> Vec<u8> {
    let mut desc = vec![0u8; PRSTATUS_SIZE];

    // si_signo
    desc[0..4].copy_from_slice(&signal.to_le_bytes());
    // pr_cursig
    desc[12..14].copy_from_slice(&(signal as u16).to_le_bytes());
    desc[PRSTATUS_PID..PRSTATUS_PID + 4].copy_from_slice(&(thread.0 as u32).to_le_bytes());

    for (i, val) in registers.to_user_words().iter().enumerate().take(REGISTER_COUNT) {
        let off = PRSTATUS_REGS + i * 8;
        desc[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    desc
}

/// Serialize a complete ELF core dump.
pub fn generate(info: &CoreDumpInfo) -> Result<Vec<u8>> {
    let phnum = 1 + info.segments.len();
    if phnum > u16::MAX as usize {
        return Err(Error::InvalidRequest("too many segments for core dump".into()));
    }

    let mut notes_data = Vec::new();
    for thread in &info.threads {
        let desc = build_prstatus(info.signal, thread.id, &thread.registers);
        notes_data.extend_from_slice(&serialize_note(b"CORE", NT_PRSTATUS, &desc));
    }
    if let Some(boot) = info.boot_image {
        let note = serialize_note(BOOT_NOTE_NAME, NT_BOOT_IMAGE, &boot.0.to_le_bytes());
        notes_data.extend_from_slice(&note);
    }

    let ehdr_size = ELF64_EHDR_SIZE as u64;
    let notes_offset = ehdr_size + phnum as u64 * ELF64_PHDR_SIZE as u64;
    let notes_size = notes_data.len() as u64;

    // PT_LOAD data starts page aligned after the notes
    let mut data_offset = align_page(notes_offset + notes_size);

    let mut phdrs = vec![serialize_phdr(PT_NOTE, 0, notes_offset, 0, notes_size, 0)];
    let mut load_offsets = Vec::new();
    for segment in &info.segments {
        let size = segment.data.len() as u64;
        phdrs.push(serialize_phdr(
            PT_LOAD,
            segment.flags,
            data_offset,
            segment.start.0,
            size,
            size,
        ));
        load_offsets.push(data_offset);
        data_offset = align_page(data_offset + size);
    }

    let mut core = serialize_elf_header(phnum as u16, ehdr_size);
    for phdr in &phdrs {
        core.extend_from_slice(phdr);
    }
    core.resize(notes_offset as usize, 0);
    core.extend_from_slice(&notes_data);
    for (segment, offset) in info.segments.iter().zip(&load_offsets) {
        core.resize(*offset as usize, 0);
        core.extend_from_slice(&segment.data);
    }

    Ok(core)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn align_page(n: u64) -> u64 {
    (n + 4095) & !4095
}

// ── Reading ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LoadSegment {
    vaddr: u64,
    offset: u64,
    filesz: u64,
    memsz: u64,
}

/// A core file opened as a read-only process channel.
pub struct CoreFile {
    map: Mmap,
    segments: Vec<LoadSegment>,
    threads: Vec<(ThreadId, RegisterSet)>,
    boot_image: Option<VirtAddr>,
}

fn invalid(e: object::Error) -> Error {
    Error::Process(format!("invalid core file: {}", e))
}

impl CoreFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file) }?;
        let (segments, threads, boot_image) = Self::parse(&map)?;
        debug!(
            path = %path.display(),
            segments = segments.len(),
            threads = threads.len(),
            "core file opened"
        );
        Ok(CoreFile {
            map,
            segments,
            threads,
            boot_image,
        })
    }

    fn parse(
        data: &[u8],
    ) -> Result<(Vec<LoadSegment>, Vec<(ThreadId, RegisterSet)>, Option<VirtAddr>)> {
        let header = elf::FileHeader64::<Endianness>::parse(data).map_err(invalid)?;
        let endian = header.endian().map_err(invalid)?;
        if header.e_type(endian) != elf::ET_CORE {
            return Err(Error::Process("not a core file".into()));
        }
        let mut segments = Vec::new();
        let mut threads = Vec::new();
        let mut boot_image = None;
        for phdr in header.program_headers(endian, data).map_err(invalid)? {
            match phdr.p_type(endian) {
                elf::PT_LOAD => segments.push(LoadSegment {
                    vaddr: phdr.p_vaddr(endian),
                    offset: phdr.p_offset(endian),
                    filesz: phdr.p_filesz(endian),
                    memsz: phdr.p_memsz(endian),
                }),
                elf::PT_NOTE => {
                    let Some(mut notes) = phdr.notes(endian, data).map_err(invalid)? else {
                        continue;
                    };
                    while let Some(note) = notes.next().map_err(invalid)? {
                        let desc = note.desc();
                        match (note.name(), note.n_type(endian)) {
                            (b"CORE", elf::NT_PRSTATUS) => {
                                let id = ThreadId(u32_at(desc, PRSTATUS_PID) as u64);
                                let words: Vec<u64> = (0..REGISTER_COUNT)
                                    .map(|i| word_at(desc, PRSTATUS_REGS + i * 8))
                                    .collect();
                                threads.push((id, RegisterSet::from_user_words(&words)?));
                            }
                            (BOOT_NOTE_NAME, NT_BOOT_IMAGE) => {
                                boot_image = Some(VirtAddr(word_at(desc, 0)))
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        segments.sort_by_key(|s| s.vaddr);
        Ok((segments, threads, boot_image))
    }
}

impl MemoryChannel for CoreFile {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let unreadable = Error::UnreadableMemory { addr, len };
        let segment = self
            .segments
            .iter()
            .find(|s| addr.0 >= s.vaddr && addr.0 - s.vaddr < s.memsz)
            .ok_or(unreadable)?;
        let rel = addr.0 - segment.vaddr;
        if rel + len as u64 > segment.memsz {
            return Err(Error::UnreadableMemory { addr, len });
        }
        let mut out = vec![0u8; len];
        // bytes past p_filesz read as zero
        if rel < segment.filesz {
            let available = ((segment.filesz - rel) as usize).min(len);
            let start = (segment.offset + rel) as usize;
            let src = self
                .map
                .get(start..start + available)
                .ok_or(Error::UnreadableMemory { addr, len })?;
            out[..available].copy_from_slice(src);
        }
        Ok(out)
    }

    fn write_bytes(&self, _addr: VirtAddr, _data: &[u8]) -> Result<()> {
        Err(read_only("memory write"))
    }

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet> {
        self.threads
            .iter()
            .find(|(id, _)| *id == thread)
            .map(|(_, regs)| regs.clone())
            .ok_or_else(|| Error::Register(format!("no thread {} in core file", thread)))
    }

    fn backend(&self) -> Backend {
        Backend::CoreDump
    }

    fn mapped_ranges(&self) -> Vec<AddressRange> {
        self.segments
            .iter()
            .map(|s| AddressRange::new(VirtAddr(s.vaddr), s.memsz))
            .collect()
    }
}

impl ProcessChannel for CoreFile {
    fn as_memory(&self) -> &dyn MemoryChannel {
        self
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.threads.iter().map(|(id, _)| *id).collect())
    }

    fn boot_image_address(&self) -> Option<VirtAddr> {
        self.boot_image
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn resume(&mut self) -> Result<()> {
        Err(read_only("resume"))
    }

    fn single_step(&mut self, _thread: ThreadId) -> Result<()> {
        Err(read_only("single step"))
    }

    fn set_instruction_pointer(&mut self, _thread: ThreadId, _ip: VirtAddr) -> Result<()> {
        Err(read_only("register write"))
    }

    fn stop_waiter(&mut self) -> Result<Box<dyn StopWaiter>> {
        Err(read_only("execution"))
    }

    fn interrupter(&self) -> Result<Arc<dyn Interrupter>> {
        Err(read_only("pause"))
    }

    fn kill(&mut self) -> Result<()> {
        Err(read_only("terminate"))
    }

    fn max_watchpoints(&self) -> usize {
        0
    }

    fn activate_watchpoint(&mut self, _slot: usize, _watch: &HardwareWatch) -> Result<()> {
        Err(read_only("watchpoint"))
    }

    fn deactivate_watchpoint(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
}

//! Stack walking over compiled code.
//!
//! Compiled frames have a fixed size once the entry sequence has run, with
//! the return address stored right above the frame. The walker repeatedly
//! locates the compilation enclosing the IP, reads the return address at
//! `sp + frame_size`, and continues in the caller. The walk never fails: it
//! ends at a native frame, at a zero return address, or with a single
//! [`StackFrame::Truncated`] marker describing why it could not go on.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::channel::MemoryChannel;
use crate::classes::MethodKey;
use crate::code_cache::{CodeCacheAccess, Compilation};
use crate::layout::{ValueLocation, ValueRole};
use crate::registers::RegisterSet;
use crate::types::{AddressRange, VirtAddr};

#[derive(Debug, Clone)]
pub enum StackFrame {
    Compiled {
        ip: VirtAddr,
        sp: VirtAddr,
        /// Only known for the innermost frame; compiled code keeps no frame
        /// pointer chain to recover a caller's.
        fp: Option<VirtAddr>,
        compilation: Arc<Compilation>,
        bci: Option<u32>,
    },
    /// Code outside the code cache; the walk stops here.
    Native { ip: VirtAddr, sp: VirtAddr, fp: Option<VirtAddr> },
    Truncated { error: String, frames_walked: usize },
}

/// A local, operand stack slot, or lock of a compiled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    pub role: ValueRole,
    pub index: u16,
    /// `None` when the value lives in a register not known for this frame.
    pub value: Option<u64>,
}

impl StackFrame {
    pub fn ip(&self) -> Option<VirtAddr> {
        match self {
            StackFrame::Compiled { ip, .. } | StackFrame::Native { ip, .. } => Some(*ip),
            StackFrame::Truncated { .. } => None,
        }
    }

    pub fn sp(&self) -> Option<VirtAddr> {
        match self {
            StackFrame::Compiled { sp, .. } | StackFrame::Native { sp, .. } => Some(*sp),
            StackFrame::Truncated { .. } => None,
        }
    }

    pub fn fp(&self) -> Option<VirtAddr> {
        match self {
            StackFrame::Compiled { fp, .. } | StackFrame::Native { fp, .. } => *fp,
            StackFrame::Truncated { .. } => None,
        }
    }

    pub fn compilation(&self) -> Option<&Arc<Compilation>> {
        match self {
            StackFrame::Compiled { compilation, .. } => Some(compilation),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&MethodKey> {
        self.compilation().and_then(|c| c.method.as_ref())
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, StackFrame::Truncated { .. })
    }

    /// Frames are recreated every stop; two frames are the same if they
    /// execute at the same IP with the same SP.
    pub fn is_same_frame(&self, other: &StackFrame) -> bool {
        match (self.ip().zip(self.sp()), other.ip().zip(other.sp())) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Values described by the compilation's debug info at this frame's IP.
    ///
    /// `registers` are only meaningful for the top frame; for caller frames
    /// register-held values are reported as unknown.
    pub fn slots(
        &self,
        channel: &dyn MemoryChannel,
        registers: Option<&RegisterSet>,
    ) -> Vec<FrameSlot> {
        let StackFrame::Compiled { ip, sp, compilation, .. } = self else {
            return Vec::new();
        };
        compilation
            .frame_values_at(*ip)
            .into_iter()
            .map(|v| {
                let value = match v.location {
                    ValueLocation::Register(id) => {
                        registers.and_then(|r| r.get_by_dwarf_id(id as i32).ok())
                    }
                    ValueLocation::StackSlot(offset) => {
                        channel.read_word(VirtAddr(sp.0.wrapping_add(offset as u64))).ok()
                    }
                    ValueLocation::Constant(c) => Some(c as u64),
                };
                FrameSlot {
                    role: v.role,
                    index: v.index,
                    value,
                }
            })
            .collect()
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackFrame::Compiled { ip, sp, compilation, bci, .. } => {
                match &compilation.method {
                    Some(key) => write!(f, "{}", key)?,
                    None => write!(f, "method#{}", compilation.method_id)?,
                }
                if let Some(bci) = bci {
                    write!(f, " @{}", bci)?;
                }
                write!(f, " ip={} sp={}", ip, sp)
            }
            StackFrame::Native { ip, sp, .. } => write!(f, "<native> ip={} sp={}", ip, sp),
            StackFrame::Truncated { error, frames_walked } => {
                write!(f, "<truncated after {} frames: {}>", frames_walked, error)
            }
        }
    }
}

pub struct StackWalker<'a> {
    channel: &'a dyn MemoryChannel,
    code_cache: &'a CodeCacheAccess,
    stack: AddressRange,
    max_depth: usize,
}

impl<'a> StackWalker<'a> {
    pub fn new(
        channel: &'a dyn MemoryChannel,
        code_cache: &'a CodeCacheAccess,
        stack: AddressRange,
        max_depth: usize,
    ) -> Self {
        StackWalker {
            channel,
            code_cache,
            stack,
            max_depth,
        }
    }

    /// Frames from innermost to outermost.
    pub fn walk(&self, registers: &RegisterSet) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        let (mut ip, mut sp) = (registers.ip(), registers.sp());
        let mut fp = Some(registers.fp());

        if ip.is_null() {
            frames.push(truncated("null instruction pointer", 0));
            return frames;
        }

        loop {
            if frames.len() >= self.max_depth {
                let walked = frames.len();
                frames.push(truncated(&format!("depth limit {} reached", self.max_depth), walked));
                break;
            }

            // A caller's IP is a return address, which may be the first byte
            // after its compilation.
            let lookup = if frames.is_empty() { ip } else { ip - 1 };
            let Some(compilation) = self.code_cache.find_compilation(lookup) else {
                frames.push(StackFrame::Native { ip, sp, fp });
                break;
            };

            let ra_slot = sp + compilation.effective_frame_size(lookup);
            frames.push(StackFrame::Compiled {
                ip,
                sp,
                fp,
                bci: compilation.bci_at(lookup),
                compilation,
            });
            let walked = frames.len();

            if !self.stack.contains(ra_slot) {
                let error = format!("return address slot {} outside stack", ra_slot);
                frames.push(truncated(&error, walked));
                break;
            }
            let return_address = match self.channel.read_word(ra_slot) {
                Ok(word) => VirtAddr(word),
                Err(e) => {
                    frames.push(truncated(&e.to_string(), walked));
                    break;
                }
            };
            if return_address.is_null() {
                break;
            }

            let caller_sp = ra_slot + 8;
            if caller_sp <= sp || caller_sp > self.stack.end() {
                let error = format!("invalid caller stack pointer {}", caller_sp);
                frames.push(truncated(&error, walked));
                break;
            }
            trace!(%ip, %sp, %return_address, "unwound frame");
            ip = return_address;
            sp = caller_sp;
            fp = None;
        }
        frames
    }
}

fn truncated(error: &str, frames_walked: usize) -> StackFrame {
    StackFrame::Truncated {
        error: error.to_string(),
        frames_walked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassAccess;
    use crate::layout::{BootHeader, CodeRegionKind};
    use crate::testing::{ClassSpec, CompilationSpec, ImageBuilder, SimMemory};

    const CODE: u64 = 0x4000_0000;
    const STACK: u64 = 0x7000_0000;
    const STACK_SIZE: u64 = 0x1000;

    struct Fixture {
        mem: SimMemory,
        cache: CodeCacheAccess,
    }

    /// `caller` at CODE (frame 0x10) calls `callee` at CODE + 0x100 (frame 0x20).
    fn fixture() -> Fixture {
        let mut image = ImageBuilder::new();
        image.add_class(
            ClassSpec::tuple("Foo")
                .method(1, "caller", "()V")
                .method(2, "callee", "()V"),
        );
        image.add_code_region(CODE, 0x1000, "code", CodeRegionKind::Runtime);
        image.add_compilation(
            0,
            CompilationSpec::new(1, 1, CODE, 0x40)
                .entry(4)
                .frame(0x10)
                .debug(0, 0)
                .debug(0x20, 3),
        );
        image.add_compilation(
            0,
            CompilationSpec::new(2, 2, CODE + 0x100, 0x40)
                .entry(4)
                .frame(0x20)
                .debug(0, 0),
        );
        let mut mem = image.memory();
        mem.map(VirtAddr(STACK), STACK_SIZE);

        let mut classes = ClassAccess::new();
        classes.update(&mem, image.class_registry()).unwrap();
        let header = BootHeader::read(&mem, image.boot_address()).unwrap();
        let mut cache = CodeCacheAccess::new();
        cache.update(&mem, &classes, header.code_cache).unwrap();
        Fixture { mem, cache }
    }

    fn regs(ip: u64, sp: u64) -> RegisterSet {
        let mut regs = RegisterSet::new();
        regs.set_ip(VirtAddr(ip));
        regs.set_sp(VirtAddr(sp));
        regs
    }

    fn walker(f: &Fixture, max_depth: usize) -> StackWalker<'_> {
        let stack = AddressRange::new(VirtAddr(STACK), STACK_SIZE);
        StackWalker::new(&f.mem, &f.cache, stack, max_depth)
    }

    #[test]
    fn walks_compiled_frames_to_native_boundary() {
        let mut f = fixture();
        let sp = STACK + 0x800;
        // callee frame: return address into caller just after its call at 0x21
        f.mem.poke_word(VirtAddr(sp + 0x20), CODE + 0x25);
        // caller frame: returns into native code
        f.mem.poke_word(VirtAddr(sp + 0x28 + 0x10), 0x5555_0000);

        let frames = walker(&f, 16).walk(&regs(CODE + 0x110, sp));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].method().unwrap().method_name, "callee");
        match &frames[1] {
            StackFrame::Compiled { sp: caller_sp, bci, .. } => {
                assert_eq!(*caller_sp, VirtAddr(sp + 0x28));
                assert_eq!(*bci, Some(3));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(frames[2], StackFrame::Native { ip, .. } if ip == VirtAddr(0x5555_0000)));
    }

    #[test]
    fn only_innermost_frame_has_register_fp() {
        let mut f = fixture();
        let sp = STACK + 0x800;
        f.mem.poke_word(VirtAddr(sp + 0x20), CODE + 0x25);
        f.mem.poke_word(VirtAddr(sp + 0x28 + 0x10), 0x5555_0000);
        let mut registers = regs(CODE + 0x110, sp);
        registers.set_fp(VirtAddr(STACK + 0x900));

        let frames = walker(&f, 16).walk(&registers);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].fp(), Some(VirtAddr(STACK + 0x900)));
        assert_eq!(frames[1].fp(), None);
        assert_eq!(frames[2].fp(), None);
    }

    #[test]
    fn zero_return_address_ends_walk() {
        let f = fixture();
        let frames = walker(&f, 16).walk(&regs(CODE + 0x110, STACK + 0x800));
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_truncated());
    }

    #[test]
    fn entry_sequence_has_no_frame() {
        let mut f = fixture();
        let sp = STACK + 0x800;
        f.mem.poke_word(VirtAddr(sp), CODE + 0x25);
        let frames = walker(&f, 16).walk(&regs(CODE + 0x100, sp));
        assert_eq!(frames[1].sp(), Some(VirtAddr(sp + 8)));
    }

    #[test]
    fn unreadable_stack_truncates() {
        let f = fixture();
        let frames = walker(&f, 16).walk(&regs(CODE + 0x110, STACK + STACK_SIZE - 8));
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            StackFrame::Truncated { frames_walked, .. } => assert_eq!(*frames_walked, 1),
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn recursion_hits_depth_limit() {
        let mut f = fixture();
        // caller returning into itself forever
        for i in 0..64u64 {
            f.mem.poke_word(VirtAddr(STACK + i * 0x18 + 0x10), CODE + 0x25);
        }
        let frames = walker(&f, 4).walk(&regs(CODE + 0x20, STACK));
        assert_eq!(frames.len(), 5);
        assert!(frames[4].is_truncated());
        assert_eq!(frames.iter().filter(|fr| fr.is_truncated()).count(), 1);
    }

    #[test]
    fn null_ip_is_truncated() {
        let f = fixture();
        let frames = walker(&f, 16).walk(&regs(0, STACK));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_truncated());
    }

    #[test]
    fn frame_sameness_uses_ip_and_sp() {
        let f = fixture();
        let a = walker(&f, 16).walk(&regs(CODE + 0x110, STACK + 0x800));
        let b = walker(&f, 16).walk(&regs(CODE + 0x110, STACK + 0x800));
        let c = walker(&f, 16).walk(&regs(CODE + 0x110, STACK + 0x700));
        assert!(a[0].is_same_frame(&b[0]));
        assert!(!a[0].is_same_frame(&c[0]));
    }
}

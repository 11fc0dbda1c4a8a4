//! x86_64 register sets.
//!
//! Uses a table-driven design: a `RegisterSet` is a flat array of values
//! indexed by position in [`REGISTERS`], independent of the backend that
//! produced it. Backends convert from their native layout (ptrace's
//! `user_regs_struct`, core file `NT_PRSTATUS`, GDB `g` packets).

use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// Register type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    GeneralPurpose,
    InstructionPointer,
    Flags,
    Segment,
}

/// Metadata for a single register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub dwarf_id: i32,
    pub reg_type: RegisterType,
}

pub const REGISTER_COUNT: usize = 27;

/// x86_64 register table.
///
/// DWARF register numbers follow the System V AMD64 ABI.
pub const REGISTERS: [RegisterInfo; REGISTER_COUNT] = [
    RegisterInfo { name: "rax",    dwarf_id: 0,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rdx",    dwarf_id: 1,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rcx",    dwarf_id: 2,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rbx",    dwarf_id: 3,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rsi",    dwarf_id: 4,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rdi",    dwarf_id: 5,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rbp",    dwarf_id: 6,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rsp",    dwarf_id: 7,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r8",     dwarf_id: 8,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r9",     dwarf_id: 9,  reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r10",    dwarf_id: 10, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r11",    dwarf_id: 11, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r12",    dwarf_id: 12, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r13",    dwarf_id: 13, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r14",    dwarf_id: 14, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "r15",    dwarf_id: 15, reg_type: RegisterType::GeneralPurpose },
    RegisterInfo { name: "rip",    dwarf_id: 16, reg_type: RegisterType::InstructionPointer },
    RegisterInfo { name: "rflags", dwarf_id: 49, reg_type: RegisterType::Flags },
    RegisterInfo { name: "es",     dwarf_id: 50, reg_type: RegisterType::Segment },
    RegisterInfo { name: "cs",     dwarf_id: 51, reg_type: RegisterType::Segment },
    RegisterInfo { name: "ss",     dwarf_id: 52, reg_type: RegisterType::Segment },
    RegisterInfo { name: "ds",     dwarf_id: 53, reg_type: RegisterType::Segment },
    RegisterInfo { name: "fs",     dwarf_id: 54, reg_type: RegisterType::Segment },
    RegisterInfo { name: "gs",     dwarf_id: 55, reg_type: RegisterType::Segment },
    RegisterInfo { name: "fs_base", dwarf_id: 58, reg_type: RegisterType::Segment },
    RegisterInfo { name: "gs_base", dwarf_id: 59, reg_type: RegisterType::Segment },
    RegisterInfo { name: "orig_rax", dwarf_id: -1, reg_type: RegisterType::GeneralPurpose },
];

/// Field order of the kernel's `user_regs_struct`, also used by the
/// `NT_PRSTATUS` note of ELF core files.
pub const USER_REGS_ORDER: [&str; REGISTER_COUNT] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8",
    "rax", "rcx", "rdx", "rsi", "rdi", "orig_rax", "rip", "cs", "rflags",
    "rsp", "ss", "fs_base", "gs_base", "ds", "es", "fs", "gs",
];

const RIP: usize = 16;
const RSP: usize = 7;
const RBP: usize = 6;

fn index_of(name: &str) -> Option<usize> {
    let name = if name == "eflags" { "rflags" } else { name };
    REGISTERS.iter().position(|r| r.name == name)
}

/// Snapshot of a thread's general-purpose registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    values: [u64; REGISTER_COUNT],
}

impl Default for RegisterSet {
    fn default() -> Self {
        RegisterSet {
            values: [0; REGISTER_COUNT],
        }
    }
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a register value by name.
    pub fn get(&self, name: &str) -> Result<u64> {
        index_of(name)
            .map(|i| self.values[i])
            .ok_or_else(|| Error::Register(format!("unknown register: {}", name)))
    }

    /// Set a register value by name.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let i = index_of(name)
            .ok_or_else(|| Error::Register(format!("unknown register: {}", name)))?;
        self.values[i] = value;
        Ok(())
    }

    pub fn ip(&self) -> VirtAddr {
        VirtAddr(self.values[RIP])
    }

    pub fn set_ip(&mut self, addr: VirtAddr) {
        self.values[RIP] = addr.0;
    }

    pub fn sp(&self) -> VirtAddr {
        VirtAddr(self.values[RSP])
    }

    pub fn set_sp(&mut self, addr: VirtAddr) {
        self.values[RSP] = addr.0;
    }

    pub fn fp(&self) -> VirtAddr {
        VirtAddr(self.values[RBP])
    }

    pub fn set_fp(&mut self, addr: VirtAddr) {
        self.values[RBP] = addr.0;
    }

    /// Get a register value by DWARF register number.
    pub fn get_by_dwarf_id(&self, dwarf_id: i32) -> Result<u64> {
        let i = REGISTERS
            .iter()
            .position(|r| r.dwarf_id == dwarf_id && dwarf_id >= 0)
            .ok_or_else(|| Error::Register(format!("unknown DWARF reg: {}", dwarf_id)))?;
        Ok(self.values[i])
    }

    /// Iterate over all register name-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        REGISTERS
            .iter()
            .zip(self.values.iter())
            .map(|(info, &v)| (info.name, v))
    }

    /// Build from words laid out in [`USER_REGS_ORDER`].
    pub fn from_user_words(words: &[u64]) -> Result<Self> {
        if words.len() < REGISTER_COUNT {
            return Err(Error::Register(format!(
                "register block has {} words, expected {}",
                words.len(),
                REGISTER_COUNT
            )));
        }
        let mut set = RegisterSet::new();
        for (name, &value) in USER_REGS_ORDER.iter().zip(words) {
            set.set(name, value)?;
        }
        Ok(set)
    }

    /// Words in [`USER_REGS_ORDER`].
    pub fn to_user_words(&self) -> Vec<u64> {
        USER_REGS_ORDER
            .iter()
            .map(|name| index_of(name).map(|i| self.values[i]).unwrap_or(0))
            .collect()
    }
}

#[cfg(target_os = "linux")]
impl From<&libc::user_regs_struct> for RegisterSet {
    fn from(regs: &libc::user_regs_struct) -> Self {
        let words = [
            regs.r15, regs.r14, regs.r13, regs.r12, regs.rbp, regs.rbx, regs.r11,
            regs.r10, regs.r9, regs.r8, regs.rax, regs.rcx, regs.rdx, regs.rsi,
            regs.rdi, regs.orig_rax, regs.rip, regs.cs, regs.eflags, regs.rsp,
            regs.ss, regs.fs_base, regs.gs_base, regs.ds, regs.es, regs.fs, regs.gs,
        ];
        let mut set = RegisterSet::new();
        for (name, value) in USER_REGS_ORDER.iter().zip(words) {
            if let Some(i) = index_of(name) {
                set.values[i] = value;
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_user_regs() {
        for name in USER_REGS_ORDER {
            assert!(index_of(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn named_access() {
        let mut regs = RegisterSet::new();
        regs.set("rip", 0x401000).unwrap();
        regs.set("eflags", 0x246).unwrap();
        assert_eq!(regs.ip(), VirtAddr(0x401000));
        assert_eq!(regs.get("rflags").unwrap(), 0x246);
        assert_eq!(regs.get_by_dwarf_id(16).unwrap(), 0x401000);
        assert!(regs.get("xmm0").is_err());
        assert!(regs.get_by_dwarf_id(-1).is_err());
    }

    #[test]
    fn user_words_order() {
        let words: Vec<u64> = (0..REGISTER_COUNT as u64).collect();
        let regs = RegisterSet::from_user_words(&words).unwrap();
        assert_eq!(regs.get("r15").unwrap(), 0);
        assert_eq!(regs.ip().addr(), 16);
        assert_eq!(regs.sp().addr(), 19);
        assert_eq!(regs.to_user_words(), words);
        assert!(RegisterSet::from_user_words(&words[..3]).is_err());
    }
}

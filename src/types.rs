use std::fmt;

/// Address in the inspected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const NULL: VirtAddr = VirtAddr(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Distance from `base`, or `None` if this address lies below it.
    pub fn offset_from(self, base: VirtAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    pub fn is_aligned(self, align: u64) -> bool {
        align != 0 && self.0 % align == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}

/// Contiguous address range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: VirtAddr,
    pub size: u64,
}

impl AddressRange {
    pub fn new(start: VirtAddr, size: u64) -> Self {
        AddressRange { start, size }
    }

    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr.0 < self.start.0.saturating_add(self.size)
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.size > 0
            && other.size > 0
            && self.start.0 < other.start.0.saturating_add(other.size)
            && other.start.0 < self.start.0.saturating_add(self.size)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// OS-level identifier of a thread in the inspected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution state of the inspected process as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process attached yet.
    None,
    Stopped,
    Running,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::None => "none",
            ProcessState::Stopped => "stopped",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_display() {
        let addr = VirtAddr(0x400000);
        assert_eq!(format!("{}", addr), "0x400000");
    }

    #[test]
    fn virt_addr_arithmetic() {
        let addr = VirtAddr(0x1000);
        assert_eq!((addr + 0x10).addr(), 0x1010);
        assert_eq!((addr - 0x10).addr(), 0x0FF0);
        assert_eq!(VirtAddr(0x1010).offset_from(addr), Some(0x10));
        assert_eq!(VirtAddr(0x0ff0).offset_from(addr), None);
    }

    #[test]
    fn range_overlap() {
        let a = AddressRange::new(VirtAddr(0x1000), 0x10);
        assert!(a.contains(VirtAddr(0x100f)));
        assert!(!a.contains(VirtAddr(0x1010)));
        assert!(a.overlaps(&AddressRange::new(VirtAddr(0x1008), 8)));
        assert!(!a.overlaps(&AddressRange::new(VirtAddr(0x1010), 8)));
        assert!(!a.overlaps(&AddressRange::new(VirtAddr(0x1008), 0)));
    }
}

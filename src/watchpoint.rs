//! Hardware watchpoints.
//!
//! x86_64 offers four debug-register slots (DR0–DR3, controlled by DR7),
//! each covering 1, 2, 4 or 8 aligned bytes. A watchpoint covers an
//! arbitrary range, so it is split into aligned pieces and may use several
//! slots. Remote stubs may advertise a different slot count.
//!
//! A watchpoint either watches a fixed region or a field of a heap object.
//! Object watchpoints follow their object when the collector moves it and
//! fall back to a fixed region over the last location once it dies.
//!
//! Like breakpoints, slots are only programmed while the target runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{AccessKind, HardwareWatch, ProcessChannel};
use crate::error::{Error, Result};
use crate::reference::{ObjectStatus, RemoteReference};
use crate::types::{AddressRange, ThreadId, VirtAddr};

/// What kind of access to trap on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointType {
    /// Trap on writes only (DR7 condition = 0b01).
    Write,
    /// Trap on reads or writes (DR7 condition = 0b11).
    ReadWrite,
    /// Trap on execution (DR7 condition = 0b00).
    Execute,
}

impl WatchpointType {
    /// DR7 condition field encoding.
    fn dr7_condition(self) -> u64 {
        match self {
            WatchpointType::Write => 0b01,
            WatchpointType::ReadWrite => 0b11,
            WatchpointType::Execute => 0b00,
        }
    }
}

impl fmt::Display for WatchpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchpointType::Write => write!(f, "write"),
            WatchpointType::ReadWrite => write!(f, "rw"),
            WatchpointType::Execute => write!(f, "execute"),
        }
    }
}

/// Size of one hardware slot's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointSize {
    /// 1 byte (DR7 length = 0b00).
    Byte1,
    /// 2 bytes (DR7 length = 0b01).
    Byte2,
    /// 4 bytes (DR7 length = 0b11).
    Byte4,
    /// 8 bytes (DR7 length = 0b10).
    Byte8,
}

impl WatchpointSize {
    /// DR7 length field encoding.
    fn dr7_length(self) -> u64 {
        match self {
            WatchpointSize::Byte1 => 0b00,
            WatchpointSize::Byte2 => 0b01,
            WatchpointSize::Byte4 => 0b11,
            WatchpointSize::Byte8 => 0b10,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            WatchpointSize::Byte1 => 1,
            WatchpointSize::Byte2 => 2,
            WatchpointSize::Byte4 => 4,
            WatchpointSize::Byte8 => 8,
        }
    }

    pub fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(WatchpointSize::Byte1),
            2 => Some(WatchpointSize::Byte2),
            4 => Some(WatchpointSize::Byte4),
            8 => Some(WatchpointSize::Byte8),
            _ => None,
        }
    }
}

impl fmt::Display for WatchpointSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// DR7 with `slot` enabled for `kind` accesses of `size` bytes.
pub fn dr7_set(dr7: u64, slot: usize, kind: WatchpointType, size: WatchpointSize) -> u64 {
    let mut dr7 = dr7_clear(dr7, slot);
    // Local enable bit
    dr7 |= 1u64 << (slot * 2);
    dr7 |= kind.dr7_condition() << (slot * 4 + 16);
    dr7 |= size.dr7_length() << (slot * 4 + 18);
    dr7
}

/// DR7 with the enable, condition and length bits of `slot` cleared.
pub fn dr7_clear(dr7: u64, slot: usize) -> u64 {
    let enable_mask = 0b11u64 << (slot * 2);
    let config_mask = 0b1111u64 << (slot * 4 + 16);
    dr7 & !(enable_mask | config_mask)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchpointId(pub u32);

impl fmt::Display for WatchpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which accesses stop the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchpointSettings {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// Also stop for accesses made while the collector runs.
    pub enabled_during_gc: bool,
}

impl Default for WatchpointSettings {
    fn default() -> Self {
        WatchpointSettings {
            read: false,
            write: true,
            exec: false,
            enabled_during_gc: false,
        }
    }
}

impl WatchpointSettings {
    /// Parse a mode such as `w`, `rw`, `x` or `rwx`.
    pub fn parse(mode: &str) -> Result<Self> {
        let mut settings = WatchpointSettings {
            read: false,
            write: false,
            exec: false,
            enabled_during_gc: false,
        };
        for c in mode.chars() {
            match c {
                'r' => settings.read = true,
                'w' => settings.write = true,
                'x' => settings.exec = true,
                'g' => settings.enabled_during_gc = true,
                _ => return Err(Error::InvalidRequest(format!("invalid watch mode '{}'", mode))),
            }
        }
        Ok(settings)
    }

    /// Debug register condition covering every requested access.
    pub fn hardware_type(&self) -> WatchpointType {
        if self.read {
            WatchpointType::ReadWrite
        } else if self.write {
            WatchpointType::Write
        } else {
            WatchpointType::Execute
        }
    }

    pub fn accepts(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            AccessKind::Execute => self.exec,
            AccessKind::Unknown => true,
        }
    }

    fn is_empty(&self) -> bool {
        !(self.read || self.write || self.exec)
    }
}

impl fmt::Display for WatchpointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (on, c) in [(self.read, 'r'), (self.write, 'w'), (self.exec, 'x')] {
            if on {
                write!(f, "{}", c)?;
            }
        }
        if self.enabled_during_gc {
            f.write_str(" +gc")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum WatchTarget {
    Region,
    Object {
        reference: Arc<RemoteReference>,
        offset: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub id: WatchpointId,
    pub range: AddressRange,
    pub settings: WatchpointSettings,
    pub target: WatchTarget,
    pub description: String,
}

impl Watchpoint {
    /// Hardware pieces needed to cover the range.
    pub fn pieces(&self) -> Vec<HardwareWatch> {
        let kind = self.settings.hardware_type();
        if kind == WatchpointType::Execute {
            return vec![HardwareWatch {
                address: self.range.start,
                size: WatchpointSize::Byte1,
                kind,
            }];
        }
        chunks(self.range)
            .into_iter()
            .map(|(address, size)| HardwareWatch { address, size, kind })
            .collect()
    }
}

impl fmt::Display for Watchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}] {}", self.id, self.range, self.settings, self.description)
    }
}

/// Split a range into naturally aligned pieces of at most 8 bytes.
pub fn chunks(range: AddressRange) -> Vec<(VirtAddr, WatchpointSize)> {
    let mut out = Vec::new();
    let mut addr = range.start;
    let end = range.end();
    while addr < end {
        let remaining = end.0 - addr.0;
        let size = [WatchpointSize::Byte8, WatchpointSize::Byte4, WatchpointSize::Byte2]
            .into_iter()
            .find(|s| {
                let n = s.bytes() as u64;
                addr.0 % n == 0 && n <= remaining
            })
            .unwrap_or(WatchpointSize::Byte1);
        out.push((addr, size));
        addr = addr + size.bytes() as u64;
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchpointHit {
    pub watchpoint: WatchpointId,
    pub thread: ThreadId,
    pub address: VirtAddr,
    pub access: AccessKind,
}

#[derive(Debug)]
pub struct WatchpointManager {
    watchpoints: BTreeMap<WatchpointId, Watchpoint>,
    next_id: u32,
    max_slots: usize,
    /// Slots programmed by the last install.
    active: Vec<usize>,
}

impl WatchpointManager {
    pub fn new(max_slots: usize) -> Self {
        WatchpointManager {
            watchpoints: BTreeMap::new(),
            next_id: 1,
            max_slots,
            active: Vec::new(),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn slots_in_use(&self) -> usize {
        self.watchpoints.values().map(|w| w.pieces().len()).sum()
    }

    pub fn set_region(
        &mut self,
        range: AddressRange,
        settings: WatchpointSettings,
        description: &str,
    ) -> Result<WatchpointId> {
        self.add(range, settings, WatchTarget::Region, description.to_string())
    }

    /// Watch `size` bytes at `offset` into an object; follows the object across relocation.
    pub fn set_object(
        &mut self,
        reference: Arc<RemoteReference>,
        offset: u64,
        size: u64,
        settings: WatchpointSettings,
    ) -> Result<WatchpointId> {
        if !reference.status().is_live() {
            return Err(Error::InvalidRequest(format!("object {} is dead", reference.id())));
        }
        let start = reference.origin().0.checked_add(offset).ok_or_else(|| {
            Error::InvalidRequest(format!("offset {:#x} past the end of the address space", offset))
        })?;
        let range = AddressRange::new(VirtAddr(start), size);
        let description = format!("object {}+{}", reference.id(), offset);
        self.add(range, settings, WatchTarget::Object { reference, offset }, description)
    }

    fn add(
        &mut self,
        range: AddressRange,
        settings: WatchpointSettings,
        target: WatchTarget,
        description: String,
    ) -> Result<WatchpointId> {
        if range.size == 0 {
            return Err(Error::InvalidRequest("empty watchpoint range".into()));
        }
        if range.start.0.checked_add(range.size).is_none() {
            return Err(Error::InvalidRequest(format!("watchpoint range {} wraps around", range)));
        }
        if settings.is_empty() {
            return Err(Error::InvalidRequest("watchpoint watches no access".into()));
        }
        // Each piece covers at most 8 bytes; reject before splitting a range
        // that could never fit.
        let free = self.max_slots.saturating_sub(self.slots_in_use()) as u64;
        if settings.hardware_type() != WatchpointType::Execute
            && range.size.div_ceil(WatchpointSize::Byte8.bytes() as u64) > free
        {
            return Err(Error::TooManyWatchpoints {
                limit: self.max_slots,
            });
        }
        if let Some(existing) = self.watchpoints.values().find(|w| w.range.overlaps(&range)) {
            return Err(Error::DuplicateWatchpoint {
                existing: existing.id.0,
                addr: existing.range.start,
            });
        }
        let id = WatchpointId(self.next_id);
        let watchpoint = Watchpoint {
            id,
            range,
            settings,
            target,
            description,
        };
        if self.slots_in_use() + watchpoint.pieces().len() > self.max_slots {
            return Err(Error::TooManyWatchpoints {
                limit: self.max_slots,
            });
        }
        self.next_id += 1;
        debug!(%id, %range, "watchpoint set");
        self.watchpoints.insert(id, watchpoint);
        Ok(id)
    }

    pub fn remove(&mut self, id: WatchpointId) -> Result<()> {
        self.watchpoints
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidRequest(format!("no watchpoint with id {}", id)))
    }

    pub fn find(&self, id: WatchpointId) -> Option<&Watchpoint> {
        self.watchpoints.get(&id)
    }

    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    pub fn len(&self) -> usize {
        self.watchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchpoints.is_empty()
    }

    /// Program every watchpoint into consecutive slots.
    pub fn install(&mut self, channel: &mut dyn ProcessChannel) -> Result<()> {
        let pieces: Vec<HardwareWatch> =
            self.watchpoints.values().flat_map(|w| w.pieces()).collect();
        let limit = self.max_slots.min(channel.max_watchpoints());
        if pieces.len() > limit {
            return Err(Error::TooManyWatchpoints { limit });
        }
        for (slot, watch) in pieces.iter().enumerate() {
            if let Err(e) = channel.activate_watchpoint(slot, watch) {
                let _ = self.uninstall(channel);
                return Err(e);
            }
            self.active.push(slot);
        }
        Ok(())
    }

    pub fn uninstall(&mut self, channel: &mut dyn ProcessChannel) -> Result<()> {
        let mut result = Ok(());
        for slot in self.active.drain(..) {
            if let Err(e) = channel.deactivate_watchpoint(slot) {
                warn!(slot, error = %e, "failed to clear watchpoint slot");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Move object watchpoints to their object's current location; a dead
    /// object's watchpoint becomes a fixed region watchpoint.
    ///
    /// Returns pairs of (moved, other) watchpoints whose ranges now overlap.
    /// Both are kept; a hit is attributed to the lower id.
    pub fn reanchor(&mut self) -> Vec<(WatchpointId, WatchpointId)> {
        let mut moved = Vec::new();
        for w in self.watchpoints.values_mut() {
            let WatchTarget::Object { reference, offset } = &w.target else {
                continue;
            };
            if reference.status() == ObjectStatus::Dead {
                debug!(id = %w.id, range = %w.range, "watched object died; keeping region");
                w.description = format!("{} (dead)", w.description);
                w.target = WatchTarget::Region;
                continue;
            }
            let start = reference.origin() + *offset;
            if start != w.range.start {
                debug!(id = %w.id, from = %w.range.start, to = %start, "watchpoint relocated");
                w.range = AddressRange::new(start, w.range.size);
                moved.push(w.id);
            }
        }

        let mut collisions: Vec<(WatchpointId, WatchpointId)> = Vec::new();
        for id in moved {
            let Some(range) = self.watchpoints.get(&id).map(|w| w.range) else {
                continue;
            };
            for other in self.watchpoints.values() {
                if other.id == id
                    || !other.range.overlaps(&range)
                    || collisions.contains(&(other.id, id))
                {
                    continue;
                }
                warn!(%id, other = %other.id, %range, "relocated watchpoint overlaps another");
                collisions.push((id, other.id));
            }
        }
        collisions
    }

    /// Watchpoint that should stop the target for a trap at `address`.
    pub fn evaluate_hit(
        &self,
        address: VirtAddr,
        access: AccessKind,
        in_gc: bool,
    ) -> Option<WatchpointId> {
        let Some(w) = self.watchpoints.values().find(|w| w.range.contains(address)) else {
            warn!(%address, "watchpoint trap outside any watchpoint");
            return None;
        };
        if in_gc && !w.settings.enabled_during_gc {
            debug!(id = %w.id, "watchpoint hit during GC ignored");
            return None;
        }
        if !w.settings.accepts(access) {
            debug!(id = %w.id, ?access, "watchpoint access kind not watched");
            return None;
        }
        Some(w.id)
    }
}

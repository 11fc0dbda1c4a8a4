//! Breakpoint management.
//!
//! Two layers, as with any software breakpoint implementation: a [`Site`]
//! is a physical INT3 byte patched into target memory, and breakpoints are
//! the logical, user-facing objects.
//!
//! Logical breakpoints come in two kinds. A machine breakpoint is tied to one
//! address inside one compilation. A bytecode breakpoint names a method (and
//! optionally a bytecode position) and owns one machine breakpoint per
//! compilation of that method, including compilations made after it was
//! created. It is pending while no compilation exists.
//!
//! Sites exist only while the target runs: [`BreakpointManager::install`]
//! patches every enabled address right before resuming and
//! [`BreakpointManager::uninstall`] restores the original bytes at the next
//! halt, so memory seen by clients is never patched.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{debug, warn};

use crate::channel::MemoryChannel;
use crate::classes::{ClassAccess, MethodKey, Resolution};
use crate::code_cache::{CodeCacheAccess, CodeCacheDelta, Compilation};
use crate::error::{Error, Result};
use crate::expr_eval::{Condition, EvalContext};
use crate::registers::RegisterSet;
use crate::types::{ThreadId, VirtAddr};

pub const INT3: u8 = 0xCC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a breakpoint should stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Address(VirtAddr),
    /// Method entry, or the first code for bytecode position `bci`.
    Method { key: MethodKey, bci: Option<u32> },
}

impl BreakpointLocation {
    /// Parse `0x<address>` or `<class>.<method>[(sig)][@bci]`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(|a| BreakpointLocation::Address(VirtAddr(a)))
                .map_err(|_| Error::Breakpoint(format!("invalid address '{}'", text)));
        }
        let (method, bci) = match text.rsplit_once('@') {
            Some((method, bci)) => {
                let bci = bci
                    .trim()
                    .parse()
                    .map_err(|_| Error::Breakpoint(format!("invalid bytecode index '{}'", bci)))?;
                (method, Some(bci))
            }
            None => (text, None),
        };
        let key = MethodKey::parse(method).map_err(Error::Breakpoint)?;
        Ok(BreakpointLocation::Method { key, bci })
    }
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointLocation::Address(addr) => write!(f, "{}", addr),
            BreakpointLocation::Method { key, bci: None } => write!(f, "{}", key),
            BreakpointLocation::Method { key, bci: Some(bci) } => write!(f, "{}@{}", key, bci),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MachineBreakpoint {
    pub id: BreakpointId,
    pub address: VirtAddr,
    /// Serial of the compilation containing `address`.
    pub compilation: u64,
    /// Bytecode breakpoint this one was resolved from.
    pub owner: Option<BreakpointId>,
    pub enabled: bool,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone)]
pub struct BytecodeBreakpoint {
    pub id: BreakpointId,
    pub key: MethodKey,
    pub bci: Option<u32>,
    pub enabled: bool,
    pub condition: Option<Condition>,
    /// Compilation serial to the machine breakpoint resolved in it.
    resolved: BTreeMap<u64, BreakpointId>,
    /// Compilations already considered, so each is resolved at most once.
    seen: HashSet<u64>,
}

impl BytecodeBreakpoint {
    pub fn is_pending(&self) -> bool {
        self.resolved.is_empty()
    }

    pub fn machine_breakpoints(&self) -> impl Iterator<Item = BreakpointId> + '_ {
        self.resolved.values().copied()
    }
}

/// Lifecycle state shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    Active,
    Disabled,
    /// Bytecode breakpoint without any compiled code yet.
    Pending,
    /// Bytecode breakpoint with this many machine breakpoints.
    Resolved(usize),
}

impl fmt::Display for BreakpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointState::Active => f.write_str("active"),
            BreakpointState::Disabled => f.write_str("disabled"),
            BreakpointState::Pending => f.write_str("pending"),
            BreakpointState::Resolved(n) => write!(f, "resolved ({})", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSummary {
    pub id: BreakpointId,
    pub location: String,
    pub state: BreakpointState,
    pub condition: Option<String>,
    pub owner: Option<BreakpointId>,
}

/// Breakpoint set changes reported in the next published state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointChange {
    Resolved {
        bytecode: BreakpointId,
        machine: BreakpointId,
        address: VirtAddr,
    },
    Removed {
        machine: BreakpointId,
        address: VirtAddr,
        reason: String,
    },
    /// A bytecode breakpoint was deleted, resolved or not.
    Withdrawn {
        bytecode: BreakpointId,
        location: BreakpointLocation,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    pub breakpoint: BreakpointId,
    pub bytecode: Option<BreakpointId>,
    pub thread: ThreadId,
    pub address: VirtAddr,
}

/// Outcome of evaluating the breakpoints at a trap address.
#[derive(Debug, Default)]
pub struct HitEvaluation {
    pub hits: Vec<BreakpointHit>,
    /// A transient breakpoint (step-over, run-to) was reached.
    pub transient: bool,
}

impl HitEvaluation {
    pub fn should_stop(&self) -> bool {
        self.transient || !self.hits.is_empty()
    }
}

/// Registers and memory of the thread that hit a breakpoint.
pub struct HitContext<'a> {
    pub channel: &'a dyn MemoryChannel,
    pub registers: &'a RegisterSet,
}

impl EvalContext for HitContext<'_> {
    fn register(&self, name: &str) -> Result<u64> {
        self.registers.get(name)
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        self.channel.read_word(VirtAddr(addr))
    }
}

/// A physical breakpoint site: a single INT3 byte patched into memory.
#[derive(Debug)]
struct Site {
    address: VirtAddr,
    saved_byte: u8,
}

impl Site {
    fn enable(channel: &dyn MemoryChannel, address: VirtAddr) -> Result<Self> {
        let saved = channel.read_bytes(address, 1)?;
        channel.write_bytes(address, &[INT3])?;
        Ok(Site {
            address,
            saved_byte: saved[0],
        })
    }

    fn disable(&self, channel: &dyn MemoryChannel) -> Result<()> {
        channel.write_bytes(self.address, &[self.saved_byte])
    }
}

#[derive(Debug)]
pub struct BreakpointManager {
    machine: BTreeMap<BreakpointId, MachineBreakpoint>,
    bytecode: BTreeMap<BreakpointId, BytecodeBreakpoint>,
    transients: Vec<VirtAddr>,
    installed: Vec<Site>,
    changes: Vec<BreakpointChange>,
    next_id: u32,
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            machine: BTreeMap::new(),
            bytecode: BTreeMap::new(),
            transients: Vec::new(),
            installed: Vec::new(),
            changes: Vec::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn make_breakpoint(
        &mut self,
        location: BreakpointLocation,
        condition: Option<Condition>,
        code_cache: &CodeCacheAccess,
        classes: &ClassAccess,
    ) -> Result<BreakpointId> {
        match location {
            BreakpointLocation::Address(address) => {
                let compilation = code_cache.find_compilation(address).ok_or_else(|| {
                    Error::InvalidAddress {
                        addr: address,
                        reason: "not inside a compiled method".into(),
                    }
                })?;
                if self.machine.values().any(|m| m.address == address && m.owner.is_none()) {
                    return Err(Error::Breakpoint(format!("breakpoint already set at {}", address)));
                }
                let id = self.allocate_id();
                self.machine.insert(
                    id,
                    MachineBreakpoint {
                        id,
                        address,
                        compilation: compilation.serial,
                        owner: None,
                        enabled: true,
                        condition,
                    },
                );
                debug!(%id, %address, "machine breakpoint created");
                Ok(id)
            }
            BreakpointLocation::Method { key, bci } => {
                if self.bytecode.values().any(|b| b.key == key && b.bci == bci) {
                    return Err(Error::Breakpoint(format!("breakpoint already set at {}", key)));
                }
                let id = self.allocate_id();
                self.bytecode.insert(
                    id,
                    BytecodeBreakpoint {
                        id,
                        key,
                        bci,
                        enabled: true,
                        condition,
                        resolved: BTreeMap::new(),
                        seen: HashSet::new(),
                    },
                );
                self.resolve(id, code_cache, classes);
                let pending = self.bytecode.get(&id).map_or(true, BytecodeBreakpoint::is_pending);
                debug!(%id, pending, "bytecode breakpoint created");
                Ok(id)
            }
        }
    }

    /// Resolve a bytecode breakpoint in every compilation of its method not considered yet.
    fn resolve(&mut self, id: BreakpointId, code_cache: &CodeCacheAccess, classes: &ClassAccess) {
        let Some(bp) = self.bytecode.get(&id) else {
            return;
        };
        let method_ids = match classes.resolve_method(&bp.key) {
            Resolution::Resolved(ids) => ids,
            Resolution::Unresolved(_) => return,
        };
        let candidates: Vec<_> = method_ids
            .iter()
            .flat_map(|&m| code_cache.compilations_for(m))
            .filter(|c| !bp.seen.contains(&c.serial))
            .collect();
        for compilation in candidates {
            self.resolve_in(id, &compilation);
        }
    }

    fn resolve_in(&mut self, id: BreakpointId, compilation: &Compilation) {
        let Some(bp) = self.bytecode.get_mut(&id) else {
            return;
        };
        bp.seen.insert(compilation.serial);
        let address = match bp.bci {
            Some(bci) => match compilation.pc_for_bci(bci) {
                Some(address) => address,
                None => {
                    warn!(breakpoint = %id, bci, %compilation, "no code for bytecode index");
                    return;
                }
            },
            None => compilation.entry_point(),
        };
        let (enabled, condition) = (bp.enabled, bp.condition.clone());
        let machine = self.allocate_id();
        if let Some(bp) = self.bytecode.get_mut(&id) {
            bp.resolved.insert(compilation.serial, machine);
        }
        self.machine.insert(
            machine,
            MachineBreakpoint {
                id: machine,
                address,
                compilation: compilation.serial,
                owner: Some(id),
                enabled,
                condition,
            },
        );
        debug!(bytecode = %id, %machine, %address, "breakpoint resolved");
        self.changes.push(BreakpointChange::Resolved {
            bytecode: id,
            machine,
            address,
        });
    }

    /// Follow code cache changes: drop breakpoints in evicted code and
    /// resolve bytecode breakpoints in new compilations.
    pub fn update(
        &mut self,
        delta: &CodeCacheDelta,
        code_cache: &CodeCacheAccess,
        classes: &ClassAccess,
    ) {
        if !delta.evicted.is_empty() {
            let evicted: HashSet<u64> = delta.evicted.iter().map(|c| c.serial).collect();
            let doomed: Vec<BreakpointId> = self
                .machine
                .values()
                .filter(|m| evicted.contains(&m.compilation))
                .map(|m| m.id)
                .collect();
            for id in doomed {
                self.drop_machine(id, "compilation evicted");
            }
        }
        let ids: Vec<BreakpointId> = self.bytecode.keys().copied().collect();
        for id in ids {
            self.resolve(id, code_cache, classes);
        }
    }

    fn drop_machine(&mut self, id: BreakpointId, reason: &str) {
        let Some(machine) = self.machine.remove(&id) else {
            return;
        };
        if let Some(owner) = machine.owner.and_then(|o| self.bytecode.get_mut(&o)) {
            owner.resolved.remove(&machine.compilation);
        }
        debug!(%id, address = %machine.address, reason, "machine breakpoint removed");
        self.changes.push(BreakpointChange::Removed {
            machine: id,
            address: machine.address,
            reason: reason.to_string(),
        });
    }

    pub fn remove(&mut self, id: BreakpointId) -> Result<()> {
        if self.machine.contains_key(&id) {
            self.drop_machine(id, "removed");
            return Ok(());
        }
        let bp = self
            .bytecode
            .remove(&id)
            .ok_or_else(|| Error::Breakpoint(format!("no breakpoint {}", id)))?;
        for machine in bp.resolved.values() {
            self.drop_machine(*machine, "removed");
        }
        debug!(%id, method = %bp.key, pending = bp.is_pending(), "bytecode breakpoint removed");
        self.changes.push(BreakpointChange::Withdrawn {
            bytecode: id,
            location: BreakpointLocation::Method {
                key: bp.key,
                bci: bp.bci,
            },
        });
        Ok(())
    }

    pub fn set_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()> {
        self.update_logical(id, |m| m.enabled = enabled, |b| b.enabled = enabled)
    }

    pub fn set_condition(&mut self, id: BreakpointId, condition: Option<Condition>) -> Result<()> {
        let for_bytecode = condition.clone();
        self.update_logical(
            id,
            move |m| m.condition = condition.clone(),
            move |b| b.condition = for_bytecode.clone(),
        )
    }

    /// Apply a change to a breakpoint; a bytecode breakpoint passes it on
    /// to its machine breakpoints.
    fn update_logical(
        &mut self,
        id: BreakpointId,
        machine: impl Fn(&mut MachineBreakpoint),
        bytecode: impl Fn(&mut BytecodeBreakpoint),
    ) -> Result<()> {
        if let Some(m) = self.machine.get_mut(&id) {
            machine(m);
            return Ok(());
        }
        let bp = self
            .bytecode
            .get_mut(&id)
            .ok_or_else(|| Error::Breakpoint(format!("no breakpoint {}", id)))?;
        bytecode(bp);
        let children: Vec<BreakpointId> = bp.resolved.values().copied().collect();
        for child in children {
            if let Some(m) = self.machine.get_mut(&child) {
                machine(m);
            }
        }
        Ok(())
    }

    pub fn add_transient(&mut self, address: VirtAddr) {
        if !self.transients.contains(&address) {
            self.transients.push(address);
        }
    }

    pub fn clear_transients(&mut self) {
        self.transients.clear();
    }

    pub fn has_transients(&self) -> bool {
        !self.transients.is_empty()
    }

    /// Enabled breakpoint or transient at `address`.
    pub fn is_breakpoint_at(&self, address: VirtAddr) -> bool {
        self.transients.contains(&address)
            || self.machine.values().any(|m| m.enabled && m.address == address)
    }

    /// Patch INT3 at every enabled breakpoint, transient, and `extra` address.
    pub fn install(&mut self, channel: &dyn MemoryChannel, extra: &[VirtAddr]) -> Result<()> {
        if !self.installed.is_empty() {
            return Ok(());
        }
        let mut addresses: Vec<VirtAddr> = self
            .machine
            .values()
            .filter(|m| m.enabled)
            .map(|m| m.address)
            .chain(self.transients.iter().copied())
            .chain(extra.iter().copied())
            .collect();
        addresses.sort();
        addresses.dedup();
        for address in addresses {
            match Site::enable(channel, address) {
                Ok(site) => self.installed.push(site),
                Err(e) => {
                    let _ = self.uninstall(channel);
                    return Err(e);
                }
            }
        }
        debug!(sites = self.installed.len(), "breakpoints installed");
        Ok(())
    }

    /// Restore original bytes. Every site is attempted; the first failure is returned.
    pub fn uninstall(&mut self, channel: &dyn MemoryChannel) -> Result<()> {
        let mut result = Ok(());
        for site in self.installed.drain(..).rev() {
            if let Err(e) = site.disable(channel) {
                warn!(address = %site.address, error = %e, "failed to restore breakpoint byte");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn is_installed(&self) -> bool {
        !self.installed.is_empty()
    }

    /// Decide which breakpoints at `address` fire for `thread`.
    ///
    /// A condition that cannot be evaluated counts as true, so the user
    /// gets to see the stop.
    pub fn evaluate(
        &self,
        thread: ThreadId,
        address: VirtAddr,
        ctx: &dyn EvalContext,
    ) -> HitEvaluation {
        let mut evaluation = HitEvaluation {
            hits: Vec::new(),
            transient: self.transients.contains(&address),
        };
        for m in self.machine.values().filter(|m| m.enabled && m.address == address) {
            let fires = match &m.condition {
                None => true,
                Some(condition) => condition.is_true(ctx).unwrap_or_else(|e| {
                    warn!(breakpoint = %m.id, %condition, error = %e, "condition failed; stopping");
                    true
                }),
            };
            if fires {
                evaluation.hits.push(BreakpointHit {
                    breakpoint: m.id,
                    bytecode: m.owner,
                    thread,
                    address,
                });
            }
        }
        evaluation
    }

    pub fn take_changes(&mut self) -> Vec<BreakpointChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn machine(&self, id: BreakpointId) -> Option<&MachineBreakpoint> {
        self.machine.get(&id)
    }

    pub fn bytecode(&self, id: BreakpointId) -> Option<&BytecodeBreakpoint> {
        self.bytecode.get(&id)
    }

    pub fn summaries(&self) -> Vec<BreakpointSummary> {
        let mut out: Vec<BreakpointSummary> = self
            .bytecode
            .values()
            .map(|b| BreakpointSummary {
                id: b.id,
                location: BreakpointLocation::Method {
                    key: b.key.clone(),
                    bci: b.bci,
                }
                .to_string(),
                state: if !b.enabled {
                    BreakpointState::Disabled
                } else if b.is_pending() {
                    BreakpointState::Pending
                } else {
                    BreakpointState::Resolved(b.resolved.len())
                },
                condition: b.condition.as_ref().map(|c| c.source().to_string()),
                owner: None,
            })
            .chain(self.machine.values().map(|m| BreakpointSummary {
                id: m.id,
                location: m.address.to_string(),
                state: if m.enabled {
                    BreakpointState::Active
                } else {
                    BreakpointState::Disabled
                },
                condition: m.condition.as_ref().map(|c| c.source().to_string()),
                owner: m.owner,
            }))
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BootHeader, CodeRegionKind};
    use crate::testing::{ClassSpec, CompilationSpec, ImageBuilder};

    const CODE: u64 = 0x4000_0000;

    struct Fixture {
        image: ImageBuilder,
        classes: ClassAccess,
        cache: CodeCacheAccess,
        table: VirtAddr,
    }

    impl Fixture {
        fn new() -> Self {
            let mut image = ImageBuilder::new();
            image.add_code_region(CODE, 0x1000, "code", CodeRegionKind::Runtime);
            let header = BootHeader::read(&image.memory(), image.boot_address()).unwrap();
            let mut f = Fixture {
                image,
                classes: ClassAccess::new(),
                cache: CodeCacheAccess::new(),
                table: header.code_cache,
            };
            f.refresh_classes();
            f
        }

        fn refresh_classes(&mut self) {
            self.classes
                .update(&self.image.memory(), self.image.class_registry())
                .unwrap();
        }

        fn refresh(&mut self, bps: &mut BreakpointManager) {
            self.refresh_classes();
            let delta = self.cache.update(&self.image.memory(), &self.classes, self.table).unwrap();
            bps.update(&delta, &self.cache, &self.classes);
        }

        fn make(&self, bps: &mut BreakpointManager, text: &str) -> Result<BreakpointId> {
            bps.make_breakpoint(BreakpointLocation::parse(text)?, None, &self.cache, &self.classes)
        }
    }

    #[test]
    fn location_parsing() {
        assert_eq!(
            BreakpointLocation::parse("0x4000").unwrap(),
            BreakpointLocation::Address(VirtAddr(0x4000))
        );
        match BreakpointLocation::parse("a.Foo.bar(I)V@12").unwrap() {
            BreakpointLocation::Method { key, bci } => {
                assert_eq!(key.class_name, "a.Foo");
                assert_eq!(key.signature.as_deref(), Some("(I)V"));
                assert_eq!(bci, Some(12));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(BreakpointLocation::parse("Foo").is_err());
        assert!(BreakpointLocation::parse("Foo.bar@x").is_err());
        assert!(BreakpointLocation::parse("0xzz").is_err());
    }

    #[test]
    fn address_must_be_in_compiled_code() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40));
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);

        let id = f.make(&mut bps, "0x40000010").unwrap();
        assert_eq!(bps.machine(id).unwrap().compilation, 1);
        assert!(matches!(f.make(&mut bps, "0x40000010"), Err(Error::Breakpoint(_))));
        assert!(matches!(
            f.make(&mut bps, "0x40000800"),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn pending_breakpoint_resolves_once_per_compilation() {
        let mut f = Fixture::new();
        let mut bps = BreakpointManager::new();
        let id = f.make(&mut bps, "Foo.bar()V").unwrap();
        assert!(bps.bytecode(id).unwrap().is_pending());
        assert_eq!(bps.summaries()[0].state, BreakpointState::Pending);

        // class loads and gets compiled
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40).entry(8));
        f.refresh(&mut bps);
        let bp = bps.bytecode(id).unwrap();
        assert!(!bp.is_pending());
        let machine: Vec<_> = bp.machine_breakpoints().collect();
        assert_eq!(machine.len(), 1);
        assert_eq!(bps.machine(machine[0]).unwrap().address, VirtAddr(CODE + 8));
        let changes = bps.take_changes();
        assert!(matches!(
            changes[..],
            [BreakpointChange::Resolved { bytecode, .. }] if bytecode == id
        ));

        // refreshing again resolves nothing new
        f.refresh(&mut bps);
        assert!(bps.take_changes().is_empty());

        // recompilation adds a second machine breakpoint
        f.image.add_compilation(0, CompilationSpec::new(2, 1, CODE + 0x100, 0x40));
        f.refresh(&mut bps);
        assert_eq!(bps.bytecode(id).unwrap().machine_breakpoints().count(), 2);
    }

    #[test]
    fn eviction_keeps_owner_pending() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        let record = f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40));
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);
        let id = f.make(&mut bps, "Foo.bar").unwrap();
        let machine = bps.bytecode(id).unwrap().machine_breakpoints().next().unwrap();
        bps.take_changes();

        f.image.evict(record);
        f.refresh(&mut bps);
        assert!(bps.machine(machine).is_none());
        assert!(bps.bytecode(id).unwrap().is_pending());
        assert!(matches!(
            &bps.take_changes()[..],
            [BreakpointChange::Removed { machine: m, .. }] if *m == machine
        ));
    }

    #[test]
    fn bytecode_index_maps_to_pc() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        let compilation = CompilationSpec::new(1, 1, CODE, 0x40).debug(0, 0).debug(0x12, 4);
        f.image.add_compilation(0, compilation);
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);
        let id = f.make(&mut bps, "Foo.bar@4").unwrap();
        let machine = bps.bytecode(id).unwrap().machine_breakpoints().next().unwrap();
        assert_eq!(bps.machine(machine).unwrap().address, VirtAddr(CODE + 0x12));

        let missing = f.make(&mut bps, "Foo.bar@9").unwrap();
        assert!(bps.bytecode(missing).unwrap().is_pending());
    }

    #[test]
    fn install_patches_and_restores() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40));
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);
        let id = f.make(&mut bps, "0x40000004").unwrap();
        bps.add_transient(VirtAddr(CODE + 8));
        let mem = f.image.memory();

        bps.install(&mem, &[VirtAddr(CODE + 0x10)]).unwrap();
        assert_eq!(mem.peek(VirtAddr(CODE + 4), 1), [INT3]);
        assert_eq!(mem.peek(VirtAddr(CODE + 8), 1), [INT3]);
        assert_eq!(mem.peek(VirtAddr(CODE + 0x10), 1), [INT3]);
        bps.uninstall(&mem).unwrap();
        assert_eq!(mem.peek(VirtAddr(CODE + 4), 1), [0x90]);
        assert_eq!(mem.peek(VirtAddr(CODE + 0x10), 1), [0x90]);

        bps.set_enabled(id, false).unwrap();
        bps.clear_transients();
        bps.install(&mem, &[]).unwrap();
        assert_eq!(mem.peek(VirtAddr(CODE + 4), 1), [0x90]);
        assert!(!bps.is_installed());
    }

    #[test]
    fn conditions_filter_hits() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40));
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);
        let id = f.make(&mut bps, "Foo.bar").unwrap();
        bps.set_condition(id, Some(Condition::parse("rax == 7").unwrap())).unwrap();

        let mem = f.image.memory();
        let mut regs = RegisterSet::new();
        let ctx = HitContext { channel: &mem, registers: &regs };
        assert!(!bps.evaluate(ThreadId(1), VirtAddr(CODE), &ctx).should_stop());

        regs.set("rax", 7).unwrap();
        let ctx = HitContext { channel: &mem, registers: &regs };
        let eval = bps.evaluate(ThreadId(1), VirtAddr(CODE), &ctx);
        assert_eq!(eval.hits.len(), 1);
        assert_eq!(eval.hits[0].bytecode, Some(id));
    }

    #[test]
    fn removing_bytecode_breakpoint_removes_children() {
        let mut f = Fixture::new();
        f.image.add_class(ClassSpec::tuple("Foo").method(1, "bar", "()V"));
        f.image.add_compilation(0, CompilationSpec::new(1, 1, CODE, 0x40));
        let mut bps = BreakpointManager::new();
        f.refresh(&mut bps);
        let id = f.make(&mut bps, "Foo.bar").unwrap();
        let machine = bps.bytecode(id).unwrap().machine_breakpoints().next().unwrap();
        bps.take_changes();
        bps.remove(id).unwrap();
        assert!(bps.summaries().is_empty());
        assert!(!bps.is_breakpoint_at(VirtAddr(CODE)));
        assert!(matches!(
            &bps.take_changes()[..],
            [
                BreakpointChange::Removed { machine: m, .. },
                BreakpointChange::Withdrawn { bytecode, .. },
            ] if *m == machine && *bytecode == id

        ));
        assert!(bps.remove(id).is_err());
    }

    #[test]
    fn removing_pending_breakpoint_is_reported() {
        let mut f = Fixture::new();
        let mut bps = BreakpointManager::new();
        let id = f.make(&mut bps, "Foo.bar()V@3").unwrap();
        assert!(bps.bytecode(id).unwrap().is_pending());
        bps.take_changes();

        bps.remove(id).unwrap();
        match &bps.take_changes()[..] {
            [BreakpointChange::Withdrawn { bytecode, location }] => {
                assert_eq!(*bytecode, id);
                assert_eq!(location.to_string(), "Foo.bar()V@3");
            }
            other => panic!("unexpected changes {:?}", other),
        }
        assert!(bps.summaries().is_empty());
    }
}

//! Canonical references to objects in the target heap.
//!
//! The [`ReferenceManager`] guarantees that, within one refresh epoch, every
//! live object is denoted by exactly one [`RemoteReference`] (compare with
//! [`Arc::ptr_eq`]). When the collector moves an object the same reference
//! is re-pointed at the new origin, so identity survives relocation.
//!
//! Heap-scheme specifics come exclusively from the injected
//! [`HeapScheme`](crate::heap_scheme::HeapScheme).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::channel::MemoryChannel;
use crate::classes::ClassAccess;
use crate::error::Result;
use crate::heap_scheme::HeapScheme;
use crate::layout::{ClassKind, GcInfo, HeapPhase, HUB_OFFSET};
use crate::types::VirtAddr;

/// Stable logical identity of a reference, unchanged by relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(pub u64);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    Live,
    /// In space being evacuated; not yet known to survive.
    Unknown,
    /// Copied by an in-progress collection; `forwarded_origin` holds the copy.
    Forwarded,
    Dead,
}

impl ObjectStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObjectStatus::Live,
            1 => ObjectStatus::Unknown,
            2 => ObjectStatus::Forwarded,
            _ => ObjectStatus::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ObjectStatus::Live => 0,
            ObjectStatus::Unknown => 1,
            ObjectStatus::Forwarded => 2,
            ObjectStatus::Dead => 3,
        }
    }

    pub fn is_live(self) -> bool {
        !matches!(self, ObjectStatus::Dead)
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectStatus::Live => "live",
            ObjectStatus::Unknown => "unknown",
            ObjectStatus::Forwarded => "forwarded",
            ObjectStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Tuple,
    Array,
    Hub,
    Unknown,
}

impl From<ClassKind> for ObjectKind {
    fn from(kind: ClassKind) -> Self {
        match kind {
            ClassKind::Tuple => ObjectKind::Tuple,
            ClassKind::Array => ObjectKind::Array,
            ClassKind::Hub => ObjectKind::Hub,
            ClassKind::Interface => ObjectKind::Unknown,
        }
    }
}

/// Handle to one object in the target heap.
///
/// Mutable state is atomic so clients may read it through a shared `Arc`
/// while only the refresh path writes it.
#[derive(Debug)]
pub struct RemoteReference {
    id: RefId,
    kind: ObjectKind,
    origin: AtomicU64,
    forwarded: AtomicU64,
    status: AtomicU8,
    version: AtomicU64,
}

impl RemoteReference {
    fn new(id: RefId, origin: VirtAddr, kind: ObjectKind, status: ObjectStatus) -> Self {
        RemoteReference {
            id,
            kind,
            origin: AtomicU64::new(origin.0),
            forwarded: AtomicU64::new(0),
            status: AtomicU8::new(status.as_u8()),
            version: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> RefId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn origin(&self) -> VirtAddr {
        VirtAddr(self.origin.load(Ordering::Acquire))
    }

    pub fn status(&self) -> ObjectStatus {
        ObjectStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Bumped every time the origin changes.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Location of the copy while the status is `Forwarded`.
    pub fn forwarded_origin(&self) -> Option<VirtAddr> {
        match self.forwarded.load(Ordering::Acquire) {
            0 => None,
            addr => Some(VirtAddr(addr)),
        }
    }

    fn set_status(&self, status: ObjectStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn mark_forwarded(&self, copy: VirtAddr) {
        self.forwarded.store(copy.0, Ordering::Release);
        self.set_status(ObjectStatus::Forwarded);
    }

    fn relocate(&self, origin: VirtAddr) {
        self.origin.store(origin.0, Ordering::Release);
        self.forwarded.store(0, Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel);
        self.set_status(ObjectStatus::Live);
    }
}

impl fmt::Display for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} {}]", self.id, self.origin(), self.status())
    }
}

/// What one `update_after_gc` pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub relocated: usize,
    pub forwarded: usize,
    pub died: usize,
    pub pruned: usize,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        *self == UpdateSummary::default()
    }
}

/// Reference counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub live: usize,
    pub unknown: usize,
    pub forwarded: usize,
}

/// Single source of truth mapping origins to canonical references.
#[derive(Debug, Default)]
pub struct ReferenceManager {
    by_origin: HashMap<VirtAddr, Arc<RemoteReference>>,
    /// Copy origin to reference, for references currently `Forwarded`.
    by_copy: HashMap<VirtAddr, Arc<RemoteReference>>,
    next_id: u64,
    last_update: Option<(u64, HeapPhase)>,
}

impl ReferenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical reference for the object at `origin`.
    ///
    /// Returns `None` when `origin` cannot hold a live object: outside live
    /// memory, unreadable, or no valid hub in its header.
    pub fn make_reference(
        &mut self,
        channel: &dyn MemoryChannel,
        scheme: &dyn HeapScheme,
        classes: &ClassAccess,
        origin: VirtAddr,
    ) -> Result<Option<Arc<RemoteReference>>> {
        if origin.is_null() {
            return Ok(None);
        }
        if let Some(existing) = self.lookup(origin) {
            return Ok(Some(existing));
        }
        if let Some(copy) = scheme.get_forwarded_origin(channel, origin)? {
            // The copy and the original are the same logical object.
            if let Some(existing) = self.lookup(copy) {
                return Ok(Some(existing));
            }
            let reference = self.create(channel, scheme, classes, origin, copy)?;
            if let Some(reference) = &reference {
                reference.mark_forwarded(copy);
                self.by_copy.insert(copy, reference.clone());
            }
            return Ok(reference);
        }
        self.create(channel, scheme, classes, origin, origin)
    }

    fn lookup(&self, origin: VirtAddr) -> Option<Arc<RemoteReference>> {
        self.by_origin
            .get(&origin)
            .or_else(|| self.by_copy.get(&origin))
            .filter(|r| r.status().is_live())
            .cloned()
    }

    /// Create a reference at `origin` whose header is read at `header`.
    fn create(
        &mut self,
        channel: &dyn MemoryChannel,
        scheme: &dyn HeapScheme,
        classes: &ClassAccess,
        origin: VirtAddr,
        header: VirtAddr,
    ) -> Result<Option<Arc<RemoteReference>>> {
        if !scheme.is_in_live_memory(header) {
            return Ok(None);
        }
        let hub = match read_hub(channel, header)? {
            Some(hub) => hub,
            None => return Ok(None),
        };
        let class = match classes.find_by_hub(hub) {
            Some(class) => class,
            None => return Ok(None),
        };
        let status = if scheme.is_condemned(origin) {
            ObjectStatus::Unknown
        } else {
            ObjectStatus::Live
        };
        self.next_id += 1;
        let reference = Arc::new(RemoteReference::new(
            RefId(self.next_id),
            origin,
            class.kind.into(),
            status,
        ));
        trace!(%reference, class = %class.name, "new reference");
        self.by_origin.insert(origin, reference.clone());
        Ok(Some(reference))
    }

    /// Re-derive origin and status of every reference for the current GC state.
    ///
    /// Idempotent: a second call for the same GC count and phase changes nothing.
    pub fn update_after_gc(
        &mut self,
        channel: &dyn MemoryChannel,
        scheme: &dyn HeapScheme,
        classes: &ClassAccess,
        gc: GcInfo,
    ) -> Result<UpdateSummary> {
        let key = (gc.gc_count, gc.phase);
        if self.last_update == Some(key) {
            return Ok(UpdateSummary::default());
        }
        let mut summary = UpdateSummary {
            pruned: self.prune(),
            ..UpdateSummary::default()
        };

        let references: Vec<Arc<RemoteReference>> = self.by_origin.values().cloned().collect();
        for reference in references {
            let origin = reference.origin();
            if gc.phase == HeapPhase::Analyzing {
                if reference.status() == ObjectStatus::Forwarded {
                    continue;
                }
                if let Some(copy) = scheme.get_forwarded_origin(channel, origin)? {
                    reference.mark_forwarded(copy);
                    self.by_copy.insert(copy, reference);
                    summary.forwarded += 1;
                } else if scheme.is_condemned(origin) {
                    reference.set_status(ObjectStatus::Unknown);
                } else if !self.is_plausible(channel, scheme, classes, origin)? {
                    self.kill(&reference);
                    summary.died += 1;
                }
                continue;
            }

            let copy = match reference.forwarded_origin() {
                Some(copy) => Some(copy),
                None => scheme.read_forwarding(channel, origin)?,
            };
            match copy {
                Some(copy) if copy != origin => {
                    self.move_reference(&reference, copy);
                    summary.relocated += 1;
                }
                _ if self.is_plausible(channel, scheme, classes, origin)? => {
                    reference.set_status(ObjectStatus::Live);
                }
                _ => {
                    self.kill(&reference);
                    summary.died += 1;
                }
            }
        }
        if gc.phase != HeapPhase::Analyzing {
            self.by_copy.clear();
        }

        self.last_update = Some(key);
        if !summary.is_empty() {
            debug!(
                gc = gc.gc_count,
                phase = ?gc.phase,
                relocated = summary.relocated,
                forwarded = summary.forwarded,
                died = summary.died,
                pruned = summary.pruned,
                "references updated"
            );
        }
        Ok(summary)
    }

    /// Lazily re-resolve one reference whose object no longer matches its header.
    ///
    /// Returns `true` if the reference now denotes a live object.
    pub fn revalidate(
        &mut self,
        channel: &dyn MemoryChannel,
        scheme: &dyn HeapScheme,
        classes: &ClassAccess,
        reference: &Arc<RemoteReference>,
    ) -> Result<bool> {
        let origin = reference.origin();
        if let Some(copy) = scheme.read_forwarding(channel, origin)? {
            if copy != origin {
                self.move_reference(reference, copy);
                return Ok(true);
            }
        }
        if self.is_plausible(channel, scheme, classes, origin)? {
            return Ok(true);
        }
        self.kill(reference);
        Ok(false)
    }

    fn is_plausible(
        &self,
        channel: &dyn MemoryChannel,
        scheme: &dyn HeapScheme,
        classes: &ClassAccess,
        origin: VirtAddr,
    ) -> Result<bool> {
        if !scheme.is_in_live_memory(origin) {
            return Ok(false);
        }
        Ok(read_hub(channel, origin)?.map_or(false, |hub| classes.find_by_hub(hub).is_some()))
    }

    fn move_reference(&mut self, reference: &Arc<RemoteReference>, copy: VirtAddr) {
        let old = reference.origin();
        self.by_origin.remove(&old);
        self.by_copy.remove(&copy);
        if let Some(duplicate) = self.by_origin.insert(copy, reference.clone()) {
            if !Arc::ptr_eq(&duplicate, reference) {
                warn!(%duplicate, %reference, "duplicate reference for relocated object");
                duplicate.set_status(ObjectStatus::Dead);
            }
        }
        reference.relocate(copy);
        trace!(%reference, from = %old, "reference relocated");
    }

    fn kill(&mut self, reference: &Arc<RemoteReference>) {
        reference.set_status(ObjectStatus::Dead);
        let origin = reference.origin();
        if self
            .by_origin
            .get(&origin)
            .map_or(false, |r| Arc::ptr_eq(r, reference))
        {
            self.by_origin.remove(&origin);
        }
        if let Some(copy) = reference.forwarded_origin() {
            self.by_copy.remove(&copy);
        }
    }

    /// Drop references nobody outside the manager holds any more.
    fn prune(&mut self) -> usize {
        let before = self.by_origin.len();
        // Held by this table, plus `by_copy` while forwarded.
        self.by_origin
            .retain(|_, r| Arc::strong_count(r) > 1 + usize::from(r.forwarded_origin().is_some()));
        let live: HashSet<RefId> = self.by_origin.values().map(|r| r.id()).collect();
        self.by_copy.retain(|_, r| live.contains(&r.id()));
        before - self.by_origin.len()
    }

    pub fn len(&self) -> usize {
        self.by_origin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_origin.is_empty()
    }

    pub fn references(&self) -> impl Iterator<Item = &Arc<RemoteReference>> {
        self.by_origin.values()
    }

    pub fn stats(&self) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        for reference in self.by_origin.values() {
            match reference.status() {
                ObjectStatus::Live => stats.live += 1,
                ObjectStatus::Unknown => stats.unknown += 1,
                ObjectStatus::Forwarded => stats.forwarded += 1,
                ObjectStatus::Dead => {}
            }
        }
        stats
    }
}

/// Hub word at `origin`, or `None` if unreadable.
fn read_hub(channel: &dyn MemoryChannel, origin: VirtAddr) -> Result<Option<VirtAddr>> {
    match channel.read_word(origin + HUB_OFFSET) {
        Ok(word) => Ok(Some(VirtAddr(word))),
        Err(e) if e.is_unreadable() => Ok(None),
        Err(e) => Err(e),
    }
}

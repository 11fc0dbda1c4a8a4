//! VM threads and their stacks.
//!
//! The VM keeps a linked list of thread records. Each refresh re-reads the
//! list, fetches registers through the channel, walks every stack, and
//! reports which threads started or died since the previous refresh.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::MemoryChannel;
use crate::code_cache::CodeCacheAccess;
use crate::error::Result;
use crate::layout::{ThreadRecord, VmThreadState};
use crate::registers::RegisterSet;
use crate::types::{AddressRange, ThreadId, VirtAddr};
use crate::unwind::{StackFrame, StackWalker};

#[derive(Debug, Clone)]
pub struct MaxThread {
    pub id: ThreadId,
    pub vm_id: u32,
    pub name: String,
    pub state: VmThreadState,
    /// `None` when the backend could not provide registers.
    pub registers: Option<RegisterSet>,
    pub stack: AddressRange,
    pub locals: AddressRange,
    /// Innermost first.
    pub frames: Vec<StackFrame>,
    pub record: VirtAddr,
}

impl MaxThread {
    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    pub fn ip(&self) -> Option<VirtAddr> {
        self.registers.as_ref().map(RegisterSet::ip)
    }

    /// Frame owning the stack slot at `addr`: the outermost frame whose SP is at or below it.
    pub fn frame_containing(&self, addr: VirtAddr) -> Option<&StackFrame> {
        if !self.stack.contains(addr) {
            return None;
        }
        self.frames
            .iter()
            .filter(|f| f.sp().map_or(false, |sp| sp <= addr))
            .last()
    }
}

impl fmt::Display for MaxThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {} \"{}\" ({:?})", self.id, self.name, self.state)
    }
}

/// Thread membership changes found by one update.
#[derive(Debug, Default, Clone)]
pub struct ThreadDelta {
    pub started: Vec<Arc<MaxThread>>,
    pub died: Vec<Arc<MaxThread>>,
}

#[derive(Debug, Default)]
pub struct ThreadManager {
    threads: BTreeMap<ThreadId, Arc<MaxThread>>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        channel: &dyn MemoryChannel,
        code_cache: &CodeCacheAccess,
        list_slot: VirtAddr,
        max_depth: usize,
    ) -> Result<ThreadDelta> {
        let records = ThreadRecord::read_list(channel, list_slot)?;
        let mut current = BTreeMap::new();
        for record in records {
            if record.state == VmThreadState::Terminated {
                continue;
            }
            let thread = Self::inspect(channel, code_cache, record, max_depth);
            current.insert(thread.id, Arc::new(thread));
        }

        let mut delta = ThreadDelta::default();
        for (id, thread) in &current {
            if !self.threads.contains_key(id) {
                delta.started.push(thread.clone());
            }
        }
        for (id, thread) in &self.threads {
            if !current.contains_key(id) {
                delta.died.push(thread.clone());
            }
        }
        if !delta.started.is_empty() || !delta.died.is_empty() {
            debug!(
                started = delta.started.len(),
                died = delta.died.len(),
                live = current.len(),
                "thread list changed"
            );
        }
        self.threads = current;
        Ok(delta)
    }

    fn inspect(
        channel: &dyn MemoryChannel,
        code_cache: &CodeCacheAccess,
        record: ThreadRecord,
        max_depth: usize,
    ) -> MaxThread {
        let id = ThreadId(record.handle);
        let stack = AddressRange::new(record.stack_base, record.stack_size);
        let (registers, frames) = match channel.read_registers(id) {
            Ok(regs) => {
                let frames = StackWalker::new(channel, code_cache, stack, max_depth).walk(&regs);
                (Some(regs), frames)
            }
            Err(e) => {
                warn!(thread = %id, error = %e, "registers unavailable");
                (
                    None,
                    vec![StackFrame::Truncated {
                        error: e.to_string(),
                        frames_walked: 0,
                    }],
                )
            }
        };
        MaxThread {
            id,
            vm_id: record.vm_id,
            name: record.name,
            state: record.state,
            registers,
            stack,
            locals: AddressRange::new(record.locals_start, record.locals_size),
            frames,
            record: record.address,
        }
    }

    pub fn threads(&self) -> Vec<Arc<MaxThread>> {
        self.threads.values().cloned().collect()
    }

    pub fn find(&self, id: ThreadId) -> Option<&Arc<MaxThread>> {
        self.threads.get(&id)
    }

    pub fn find_by_stack_address(&self, addr: VirtAddr) -> Option<&Arc<MaxThread>> {
        self.threads.values().find(|t| t.stack.contains(addr))
    }

    pub fn find_stack_frame(&self, addr: VirtAddr) -> Option<(Arc<MaxThread>, StackFrame)> {
        let thread = self.find_by_stack_address(addr)?;
        let frame = thread.frame_containing(addr)?.clone();
        Some((thread.clone(), frame))
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

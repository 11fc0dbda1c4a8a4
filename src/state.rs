//! Published VM state snapshots.
//!
//! A [`VmState`] is immutable once published. Each one links to its
//! predecessor, so clients can walk back through recent history; serials
//! strictly increase along the chain.

use std::fmt;
use std::sync::Arc;

use crate::breakpoint::{BreakpointChange, BreakpointHit};
use crate::layout::HeapPhase;
use crate::threads::MaxThread;
use crate::types::{ProcessState, ThreadId};
use crate::watchpoint::WatchpointHit;

/// States kept reachable through `previous`.
pub const HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone)]
pub struct VmState {
    pub process_state: ProcessState,
    pub serial: u64,
    /// Number of halts; a manual refresh keeps the epoch.
    pub epoch: u64,
    pub gc_phase: HeapPhase,
    pub gc_count: u64,
    pub threads: Vec<Arc<MaxThread>>,
    pub started: Vec<Arc<MaxThread>>,
    pub died: Vec<Arc<MaxThread>>,
    pub single_stepped: Option<ThreadId>,
    pub breakpoint_hits: Vec<BreakpointHit>,
    pub watchpoint_hit: Option<WatchpointHit>,
    pub breakpoint_changes: Vec<BreakpointChange>,
    pub previous: Option<Arc<VmState>>,
}

impl VmState {
    /// State before any target is attached.
    pub fn initial() -> Self {
        VmState {
            process_state: ProcessState::None,
            serial: 0,
            epoch: 0,
            gc_phase: HeapPhase::Mutating,
            gc_count: 0,
            threads: Vec::new(),
            started: Vec::new(),
            died: Vec::new(),
            single_stepped: None,
            breakpoint_hits: Vec::new(),
            watchpoint_hit: None,
            breakpoint_changes: Vec::new(),
            previous: None,
        }
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Arc<MaxThread>> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Thread the stop is about: a breakpoint or watchpoint hit, else the stepped thread.
    pub fn focus_thread(&self) -> Option<ThreadId> {
        self.breakpoint_hits
            .first()
            .map(|h| h.thread)
            .or_else(|| self.watchpoint_hit.as_ref().map(|h| h.thread))
            .or(self.single_stepped)
    }

    /// Number of states reachable through `previous`, this one included.
    pub fn history_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.previous.as_ref();
        while let Some(state) = cur {
            n += 1;
            cur = state.previous.as_ref();
        }
        n
    }

    /// This state with its history cut to `keep` states in total.
    pub fn trimmed(self: &Arc<Self>, keep: usize) -> Arc<VmState> {
        if self.history_len() <= keep {
            return self.clone();
        }
        let previous = match (&self.previous, keep) {
            (Some(prev), k) if k > 1 => Some(prev.trimmed(k - 1)),
            _ => None,
        };
        Arc::new(VmState {
            previous,
            ..(**self).clone()
        })
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} epoch={} gc={}({:?}) threads={}",
            self.serial,
            self.process_state,
            self.epoch,
            self.gc_count,
            self.gc_phase,
            self.threads.len()
        )?;
        if !self.breakpoint_hits.is_empty() {
            write!(f, " breakpoints=")?;
            for (i, hit) in self.breakpoint_hits.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", hit.breakpoint)?;
            }
        }
        if let Some(hit) = &self.watchpoint_hit {
            write!(f, " watchpoint={}@{}", hit.watchpoint, hit.address)?;
        }
        Ok(())
    }
}

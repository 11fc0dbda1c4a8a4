//! System triggers: breakpoints the session plants on VM routines that
//! report runtime events.
//!
//! The boot header's trigger table says where each routine lives. A
//! [`TriggerTable`] pairs every [`SystemTrigger`] with a handler; it is built
//! once per session and refuses to exist unless every trigger is handled.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::TriggerRecord;
use crate::types::{ThreadId, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemTrigger {
    CompilationComplete,
    GcStarted,
    GcCompleted,
    ThreadStarted,
    ThreadDetached,
}

impl SystemTrigger {
    pub const ALL: [SystemTrigger; 5] = [
        SystemTrigger::CompilationComplete,
        SystemTrigger::GcStarted,
        SystemTrigger::GcCompleted,
        SystemTrigger::ThreadStarted,
        SystemTrigger::ThreadDetached,
    ];

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn code(self) -> u32 {
        match self {
            SystemTrigger::CompilationComplete => 0,
            SystemTrigger::GcStarted => 1,
            SystemTrigger::GcCompleted => 2,
            SystemTrigger::ThreadStarted => 3,
            SystemTrigger::ThreadDetached => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemTrigger::CompilationComplete => "compilation-complete",
            SystemTrigger::GcStarted => "gc-started",
            SystemTrigger::GcCompleted => "gc-completed",
            SystemTrigger::ThreadStarted => "thread-started",
            SystemTrigger::ThreadDetached => "thread-detached",
        }
    }
}

impl fmt::Display for SystemTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do after a trigger was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub trigger: SystemTrigger,
    pub thread: ThreadId,
}

pub type TriggerHandler = fn(&TriggerEvent) -> TriggerAction;

fn log_and_continue(event: &TriggerEvent) -> TriggerAction {
    debug!(trigger = %event.trigger, thread = %event.thread, "system trigger");
    TriggerAction::Continue
}

#[derive(Debug, Clone)]
pub struct TriggerTable {
    handlers: HashMap<SystemTrigger, TriggerHandler>,
    addresses: HashMap<VirtAddr, SystemTrigger>,
}

impl TriggerTable {
    /// Build a table from explicit handlers. Every trigger needs exactly one.
    pub fn new(handlers: &[(SystemTrigger, TriggerHandler)]) -> Result<Self> {
        let mut map = HashMap::new();
        for &(trigger, handler) in handlers {
            if map.insert(trigger, handler).is_some() {
                return Err(Error::InvalidRequest(format!(
                    "duplicate handler for trigger {}",
                    trigger
                )));
            }
        }
        if let Some(missing) = SystemTrigger::ALL.into_iter().find(|t| !map.contains_key(t)) {
            return Err(Error::InvalidRequest(format!("no handler for trigger {}", missing)));
        }
        Ok(TriggerTable {
            handlers: map,
            addresses: HashMap::new(),
        })
    }

    /// Every trigger logged and auto-continued; the session's state refresh
    /// at the halt does the real work.
    pub fn standard() -> Self {
        let handlers: Vec<(SystemTrigger, TriggerHandler)> = SystemTrigger::ALL
            .into_iter()
            .map(|t| (t, log_and_continue as TriggerHandler))
            .collect();
        TriggerTable {
            handlers: handlers.into_iter().collect(),
            addresses: HashMap::new(),
        }
    }

    /// Attach the routine addresses published by the VM.
    pub fn bind(&mut self, records: &[TriggerRecord]) {
        self.addresses.clear();
        for record in records {
            match SystemTrigger::from_code(record.kind_code) {
                Some(trigger) => {
                    self.addresses.insert(record.address, trigger);
                }
                None => {
                    warn!(
                        code = record.kind_code,
                        address = %record.address,
                        "unknown trigger kind"
                    )
                }
            }
        }
        debug!(bound = self.addresses.len(), "system triggers bound");
    }

    pub fn trigger_at(&self, address: VirtAddr) -> Option<SystemTrigger> {
        self.addresses.get(&address).copied()
    }

    pub fn dispatch(&self, event: &TriggerEvent) -> TriggerAction {
        match self.handlers.get(&event.trigger) {
            Some(handler) => handler(event),
            None => TriggerAction::Continue,
        }
    }

    pub fn addresses(&self) -> Vec<VirtAddr> {
        let mut out: Vec<VirtAddr> = self.addresses.keys().copied().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(_: &TriggerEvent) -> TriggerAction {
        TriggerAction::Stop
    }

    #[test]
    fn codes_are_stable() {
        for t in SystemTrigger::ALL {
            assert_eq!(SystemTrigger::from_code(t.code()), Some(t));
        }
        assert_eq!(SystemTrigger::from_code(99), None);
    }

    #[test]
    fn table_must_be_complete() {
        let partial = [(SystemTrigger::GcStarted, stop as TriggerHandler)];
        assert!(TriggerTable::new(&partial).is_err());

        let mut all: Vec<(SystemTrigger, TriggerHandler)> =
            SystemTrigger::ALL.into_iter().map(|t| (t, stop as TriggerHandler)).collect();
        assert!(TriggerTable::new(&all).is_ok());
        all.push((SystemTrigger::GcStarted, stop));
        assert!(TriggerTable::new(&all).is_err());
    }

    #[test]
    fn bind_and_dispatch() {
        let mut table = TriggerTable::standard();
        table.bind(&[
            TriggerRecord {
                kind_code: SystemTrigger::GcStarted.code(),
                address: VirtAddr(0x4000),
            },
            TriggerRecord {
                kind_code: 42,
                address: VirtAddr(0x5000),
            },
        ]);
        assert_eq!(table.addresses(), [VirtAddr(0x4000)]);
        let trigger = table.trigger_at(VirtAddr(0x4000)).unwrap();
        let event = TriggerEvent {
            trigger,
            thread: ThreadId(1),
        };
        assert_eq!(table.dispatch(&event), TriggerAction::Continue);
        assert!(table.trigger_at(VirtAddr(0x5000)).is_none());
    }
}

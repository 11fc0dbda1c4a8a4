//! Native backend: a local VM process controlled through ptrace.
//!
//! All-stop model: when one thread reports an event, every other running
//! thread is stopped with `SIGSTOP` before the event is handed to the
//! session. Memory goes through `/proc/[pid]/mem`; watchpoints use the
//! debug registers, programmed in every thread via `PTRACE_POKEUSER`.
//!
//! ptrace requests must come from the thread that attached, so the session
//! connects on its request thread. Register sets are cached per stop so
//! other threads can still read them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::breakpoint::INT3;
use crate::channel::{
    AccessKind, Backend, HardwareWatch, Interrupter, MemoryChannel, ProcessChannel, StopEvent,
    StopWaiter,
};
use crate::error::{Error, Result};
use crate::pipe::SyncPipe;
use crate::procfs;
use crate::registers::RegisterSet;
use crate::types::{AddressRange, ThreadId, VirtAddr};
use crate::watchpoint::{dr7_clear, dr7_set};

const WATCH_SLOTS: usize = 4;
const DR_STATUS: usize = 6;
const DR_CONTROL: usize = 7;
/// DR6 bit set by a hardware single step.
const DR6_SINGLE_STEP: u64 = 1 << 14;

const SI_KERNEL: i32 = 0x80;
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const TRAP_HWBKPT: i32 = 4;

// ── Debug register access via PTRACE_PEEKUSER / PTRACE_POKEUSER ──────

/// Offset of `u_debugreg[reg]` within `struct user` on x86_64.
fn debug_reg_offset(reg: usize) -> u64 {
    const U_DEBUGREG_OFFSET: u64 = 848;
    U_DEBUGREG_OFFSET + (reg as u64) * 8
}

fn check_debug_reg(reg: usize) -> Result<()> {
    if reg > 7 || reg == 4 || reg == 5 {
        return Err(Error::Register(format!("invalid debug register: DR{}", reg)));
    }
    Ok(())
}

pub fn read_debug_reg(tid: Pid, reg: usize) -> Result<u64> {
    check_debug_reg(reg)?;
    // PEEKUSER returns the word itself; only errno tells -1 from failure
    unsafe { *libc::__errno_location() = 0 };
    let val = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            tid.as_raw() as libc::c_uint,
            debug_reg_offset(reg) as *mut libc::c_void,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if val == -1 {
        let errno = Errno::last();
        if errno != Errno::UnknownErrno {
            return Err(Error::Register(format!("PTRACE_PEEKUSER DR{}: {}", reg, errno)));
        }
    }
    Ok(val as u64)
}

pub fn write_debug_reg(tid: Pid, reg: usize, value: u64) -> Result<()> {
    check_debug_reg(reg)?;
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            tid.as_raw() as libc::c_uint,
            debug_reg_offset(reg) as *mut libc::c_void,
            value as *mut libc::c_void,
        )
    };
    if ret == -1 {
        return Err(Error::Register(format!("PTRACE_POKEUSER DR{}: {}", reg, Errno::last())));
    }
    Ok(())
}

/// Access kind a DR7 slot is programmed for.
fn slot_access(dr7: u64, slot: usize) -> AccessKind {
    match (dr7 >> (16 + slot * 4)) & 0b11 {
        0b00 => AccessKind::Execute,
        0b01 => AccessKind::Write,
        _ => AccessKind::Unknown,
    }
}

fn thread_id(tid: Pid) -> ThreadId {
    ThreadId(tid.as_raw() as u64)
}

fn pid_of(thread: ThreadId) -> Pid {
    Pid::from_raw(thread.0 as i32)
}

fn tgkill(pid: Pid, tid: Pid, sig: Signal) -> Result<()> {
    let ret =
        unsafe { libc::syscall(libc::SYS_tgkill, pid.as_raw(), tid.as_raw(), sig as libc::c_int) };
    if ret == -1 {
        return Err(Error::Ptrace(Errno::last()));
    }
    Ok(())
}

fn trace_options(launched: bool) -> ptrace::Options {
    let options = ptrace::Options::PTRACE_O_TRACECLONE;
    if launched {
        options | ptrace::Options::PTRACE_O_EXITKILL
    } else {
        options
    }
}

/// State shared by the channel and its stop waiter.
struct Tracee {
    pid: Pid,
    threads: BTreeSet<Pid>,
    running: HashSet<Pid>,
    /// Threads with an undelivered `SIGSTOP` from an earlier stop-all.
    stray_stops: HashSet<Pid>,
    pending_signals: HashMap<Pid, Signal>,
    registers: HashMap<ThreadId, RegisterSet>,
    watches: [Option<HardwareWatch>; WATCH_SLOTS],
    exited: bool,
}

impl Tracee {
    fn new(pid: Pid, threads: impl IntoIterator<Item = Pid>) -> Self {
        Tracee {
            pid,
            threads: threads.into_iter().collect(),
            running: HashSet::new(),
            stray_stops: HashSet::new(),
            pending_signals: HashMap::new(),
            registers: HashMap::new(),
            watches: [None; WATCH_SLOTS],
            exited: false,
        }
    }

    fn forget(&mut self, tid: Pid) {
        self.threads.remove(&tid);
        self.running.remove(&tid);
        self.stray_stops.remove(&tid);
        self.pending_signals.remove(&tid);
        self.registers.remove(&thread_id(tid));
    }

    /// Program every active watch slot into a newly seen thread.
    fn program_watches(&self, tid: Pid) -> Result<()> {
        let mut dr7 = 0;
        for (slot, watch) in self.watches.iter().enumerate() {
            if let Some(watch) = watch {
                write_debug_reg(tid, slot, watch.address.0)?;
                dr7 = dr7_set(dr7, slot, watch.kind, watch.size);
            }
        }
        if dr7 != 0 {
            write_debug_reg(tid, DR_CONTROL, dr7)?;
        }
        Ok(())
    }

    fn adopt(&mut self, tid: Pid) {
        if self.threads.insert(tid) {
            trace!(tid = %tid, "thread adopted");
            if let Err(e) = self.program_watches(tid) {
                warn!(tid = %tid, error = %e, "could not program watchpoints in new thread");
            }
        }
    }

    fn cont(&mut self, tid: Pid) {
        let signal = self.pending_signals.remove(&tid);
        match ptrace::cont(tid, signal) {
            Ok(()) => {
                self.running.insert(tid);
            }
            Err(e) => {
                debug!(tid = %tid, error = %e, "thread vanished on resume");
                self.forget(tid);
            }
        }
    }
}

/// A local VM process under ptrace.
pub struct NativeProcess {
    pid: Pid,
    tracee: Arc<Mutex<Tracee>>,
    interrupted: Arc<AtomicBool>,
    mem: File,
    launched: bool,
}

impl NativeProcess {
    /// Launch a VM and run it until it stops itself once its boot image is mapped.
    ///
    /// Forks, calls `PTRACE_TRACEME` in the child and execs `program`; a
    /// pipe orders the child's traceme before the parent's first `waitpid`.
    pub fn launch(program: &Path, args: &[String]) -> Result<Self> {
        let prog = CString::new(
            program
                .to_str()
                .ok_or_else(|| Error::Process("invalid program path".into()))?,
        )
        .map_err(|e| Error::Process(e.to_string()))?;
        let mut c_args = vec![prog.clone()];
        for arg in args {
            c_args.push(CString::new(arg.as_str()).map_err(|e| Error::Process(e.to_string()))?);
        }
        let c_args_ref: Vec<&std::ffi::CStr> = c_args.iter().map(|a| a.as_c_str()).collect();

        let mut pipe = SyncPipe::new()?;
        match unsafe { fork() }.map_err(|e| Error::Process(format!("fork failed: {}", e)))? {
            ForkResult::Child => {
                let _ = ptrace::traceme();
                let _ = pipe.notify();
                let _ = execvp(&prog, &c_args_ref);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                pipe.wait()?;
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    other => {
                        return Err(Error::Process(format!(
                            "unexpected status after launch: {:?}",
                            other
                        )))
                    }
                }
                ptrace::setoptions(child, trace_options(true))?;
                let threads = run_to_boot_stop(child)?;
                info!(pid = %child, program = %program.display(), "VM launched");
                Self::new(child, threads, true)
            }
        }
    }

    /// Attach to a running VM and every one of its threads.
    pub fn attach(pid: Pid) -> Result<Self> {
        let mut threads = Vec::new();
        for thread in procfs::list_threads(pid)? {
            let tid = pid_of(thread);
            if let Err(e) = ptrace::attach(tid) {
                if tid == pid {
                    return Err(e.into());
                }
                debug!(tid = %tid, error = %e, "thread exited before attach");
                continue;
            }
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, _) => {}
                other => {
                    debug!(tid = %tid, status = ?other, "unexpected status after attach");
                    continue;
                }
            }
            ptrace::setoptions(tid, trace_options(false))?;
            threads.push(tid);
        }
        info!(pid = %pid, threads = threads.len(), "attached to VM");
        Self::new(pid, threads, false)
    }

    fn new(pid: Pid, threads: Vec<Pid>, launched: bool) -> Result<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{}/mem", pid))?;
        Ok(NativeProcess {
            pid,
            tracee: Arc::new(Mutex::new(Tracee::new(pid, threads))),
            interrupted: Arc::new(AtomicBool::new(false)),
            mem,
            launched,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn describe_failure(&self, addr: VirtAddr, error: &std::io::Error) -> String {
        let maps = procfs::read_maps(self.pid).unwrap_or_default();
        match procfs::find_mapping(&maps, addr) {
            Some(m) => format!("{} in {} mapping {}", error, m.perms, m.range),
            None => format!("{} (not mapped)", error),
        }
    }

    fn for_each_thread(&self, mut f: impl FnMut(Pid) -> Result<()>) -> Result<()> {
        let threads: Vec<Pid> = self.tracee.lock().threads.iter().copied().collect();
        for tid in threads {
            f(tid)?;
        }
        Ok(())
    }
}

/// Continue a freshly exec'd VM until it stops on its own.
fn run_to_boot_stop(pid: Pid) -> Result<Vec<Pid>> {
    let mut threads = vec![pid];
    let mut signal = None;
    loop {
        ptrace::cont(pid, signal.take())?;
        match waitpid(pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP | Signal::SIGSTOP) => break,
            WaitStatus::Stopped(_, sig) => signal = Some(sig),
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                let child = Pid::from_raw(ptrace::getevent(pid)? as i32);
                let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                threads.push(child);
            }
            WaitStatus::Exited(_, code) => {
                return Err(Error::Process(format!(
                    "VM exited with code {} before its boot image was mapped",
                    code
                )))
            }
            WaitStatus::Signaled(_, sig, _) => {
                return Err(Error::Process(format!("VM killed by {} during startup", sig)))
            }
            _ => {}
        }
    }
    // threads cloned during startup run on; stop them too
    for &tid in threads.iter().skip(1) {
        let _ = tgkill(pid, tid, Signal::SIGSTOP);
    }
    Ok(threads)
}

impl MemoryChannel for NativeProcess {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self.mem.read_at(&mut buf, addr.0) {
            Ok(n) if n == len => Ok(buf),
            _ => Err(Error::UnreadableMemory { addr, len }),
        }
    }

    fn write_bytes(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        match self.mem.write_at(data, addr.0) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(_) => Err(Error::InvalidAddress {
                addr,
                reason: "short write".into(),
            }),
            Err(e) => Err(Error::InvalidAddress {
                addr,
                reason: self.describe_failure(addr, &e),
            }),
        }
    }

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet> {
        let mut tracee = self.tracee.lock();
        if let Some(registers) = tracee.registers.get(&thread) {
            return Ok(registers.clone());
        }
        let regs = ptrace::getregs(pid_of(thread))?;
        let registers = RegisterSet::from(&regs);
        tracee.registers.insert(thread, registers.clone());
        Ok(registers)
    }

    fn backend(&self) -> Backend {
        Backend::Native
    }

    fn mapped_ranges(&self) -> Vec<AddressRange> {
        match procfs::read_maps(self.pid) {
            Ok(maps) => procfs::readable_ranges(&maps),
            Err(e) => {
                warn!(error = %e, "could not read memory map");
                Vec::new()
            }
        }
    }
}

impl ProcessChannel for NativeProcess {
    fn as_memory(&self) -> &dyn MemoryChannel {
        self
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.tracee.lock().threads.iter().map(|&t| thread_id(t)).collect())
    }

    fn resume(&mut self) -> Result<()> {
        let mut tracee = self.tracee.lock();
        if tracee.exited {
            return Err(Error::Process("process has exited".into()));
        }
        tracee.registers.clear();
        let threads: Vec<Pid> = tracee.threads.iter().copied().collect();
        for tid in threads {
            tracee.cont(tid);
        }
        Ok(())
    }

    fn single_step(&mut self, thread: ThreadId) -> Result<()> {
        let tid = pid_of(thread);
        let mut tracee = self.tracee.lock();
        tracee.registers.remove(&thread);
        let signal = tracee.pending_signals.remove(&tid);
        ptrace::step(tid, signal)?;
        tracee.running.insert(tid);
        Ok(())
    }

    fn set_instruction_pointer(&mut self, thread: ThreadId, ip: VirtAddr) -> Result<()> {
        let tid = pid_of(thread);
        let mut regs = ptrace::getregs(tid)?;
        regs.rip = ip.0;
        ptrace::setregs(tid, regs)?;
        self.tracee.lock().registers.remove(&thread);
        Ok(())
    }

    fn stop_waiter(&mut self) -> Result<Box<dyn StopWaiter>> {
        Ok(Box::new(NativeWaiter {
            tracee: self.tracee.clone(),
            interrupted: self.interrupted.clone(),
            mem: self.mem.try_clone()?,
        }))
    }

    fn interrupter(&self) -> Result<Arc<dyn Interrupter>> {
        Ok(Arc::new(NativeInterrupter {
            pid: self.pid,
            interrupted: self.interrupted.clone(),
        }))
    }

    fn kill(&mut self) -> Result<()> {
        let mut tracee = self.tracee.lock();
        if tracee.exited {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)?;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        tracee.exited = true;
        tracee.threads.clear();
        tracee.running.clear();
        info!(pid = %self.pid, "VM killed");
        Ok(())
    }

    fn max_watchpoints(&self) -> usize {
        WATCH_SLOTS
    }

    fn activate_watchpoint(&mut self, slot: usize, watch: &HardwareWatch) -> Result<()> {
        if slot >= WATCH_SLOTS {
            return Err(Error::InvalidRequest(format!("no watch slot {}", slot)));
        }
        self.for_each_thread(|tid| {
            write_debug_reg(tid, slot, watch.address.0)?;
            let dr7 = read_debug_reg(tid, DR_CONTROL)?;
            write_debug_reg(tid, DR_CONTROL, dr7_set(dr7, slot, watch.kind, watch.size))
        })?;
        self.tracee.lock().watches[slot] = Some(*watch);
        Ok(())
    }

    fn deactivate_watchpoint(&mut self, slot: usize) -> Result<()> {
        if slot >= WATCH_SLOTS {
            return Ok(());
        }
        self.tracee.lock().watches[slot] = None;
        self.for_each_thread(|tid| {
            let dr7 = read_debug_reg(tid, DR_CONTROL)?;
            write_debug_reg(tid, DR_CONTROL, dr7_clear(dr7, slot))
        })
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        let tracee = self.tracee.lock();
        if tracee.exited {
            return;
        }
        if self.launched {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
        } else {
            for &tid in &tracee.threads {
                let _ = ptrace::detach(tid, None);
            }
        }
    }
}

struct NativeInterrupter {
    pid: Pid,
    interrupted: Arc<AtomicBool>,
}

impl Interrupter for NativeInterrupter {
    fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        signal::kill(self.pid, Signal::SIGSTOP)?;
        debug!(pid = %self.pid, "interrupt requested");
        Ok(())
    }
}

struct NativeWaiter {
    tracee: Arc<Mutex<Tracee>>,
    interrupted: Arc<AtomicBool>,
    mem: File,
}

impl StopWaiter for NativeWaiter {
    fn wait(&mut self) -> Result<StopEvent> {
        loop {
            let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))?;
            trace!(?status, "wait status");
            let mut tracee = self.tracee.lock();
            if let Some((event, stopped)) = self.classify(&mut tracee, status)? {
                if let Some(tid) = stopped {
                    tracee.running.remove(&tid);
                    self.stop_all(&mut tracee);
                }
                return Ok(event);
            }
        }
    }
}

impl NativeWaiter {
    /// Turn one wait status into an event for the session, or `None` to keep waiting.
    fn classify(
        &self,
        tracee: &mut Tracee,
        status: WaitStatus,
    ) -> Result<Option<(StopEvent, Option<Pid>)>> {
        let event = match status {
            WaitStatus::Exited(tid, code) => {
                if tid == tracee.pid {
                    tracee.exited = true;
                    tracee.threads.clear();
                    tracee.running.clear();
                    return Ok(Some((StopEvent::Exited { code }, None)));
                }
                tracee.forget(tid);
                return Ok(None);
            }
            WaitStatus::Signaled(tid, sig, _) => {
                if tid == tracee.pid {
                    tracee.exited = true;
                    tracee.threads.clear();
                    tracee.running.clear();
                    return Ok(Some((StopEvent::Exited { code: 128 + sig as i32 }, None)));
                }
                tracee.forget(tid);
                return Ok(None);
            }
            WaitStatus::PtraceEvent(tid, _, event) => {
                if event == libc::PTRACE_EVENT_CLONE {
                    let child = Pid::from_raw(ptrace::getevent(tid)? as i32);
                    if !tracee.threads.contains(&child) {
                        let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                        tracee.adopt(child);
                        tracee.cont(child);
                    }
                }
                tracee.cont(tid);
                return Ok(None);
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP) => {
                if tracee.stray_stops.remove(&tid) {
                    tracee.cont(tid);
                    return Ok(None);
                }
                if !tracee.threads.contains(&tid) {
                    // new thread reporting before its parent's clone event
                    tracee.adopt(tid);
                    tracee.cont(tid);
                    return Ok(None);
                }
                if self.interrupted.swap(false, Ordering::SeqCst) {
                    StopEvent::Paused
                } else {
                    StopEvent::Signal {
                        thread: thread_id(tid),
                        signal: Signal::SIGSTOP as i32,
                    }
                }
            }
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => self.classify_trap(tid)?,
            WaitStatus::Stopped(tid, sig) => {
                tracee.pending_signals.insert(tid, sig);
                StopEvent::Signal {
                    thread: thread_id(tid),
                    signal: sig as i32,
                }
            }
            WaitStatus::PtraceSyscall(tid) => {
                tracee.cont(tid);
                return Ok(None);
            }
            _ => return Ok(None),
        };
        let tid = match status {
            WaitStatus::Stopped(tid, _) => tid,
            _ => tracee.pid,
        };
        Ok(Some((event, Some(tid))))
    }

    fn classify_trap(&self, tid: Pid) -> Result<StopEvent> {
        let thread = thread_id(tid);
        let siginfo = ptrace::getsiginfo(tid)?;
        match siginfo.si_code {
            SI_KERNEL | TRAP_BRKPT => {
                let mut regs = ptrace::getregs(tid)?;
                regs.rip -= 1;
                ptrace::setregs(tid, regs)?;
                Ok(StopEvent::Breakpoint {
                    thread,
                    address: VirtAddr(regs.rip),
                })
            }
            TRAP_TRACE => Ok(StopEvent::SingleStep { thread }),
            TRAP_HWBKPT => {
                let dr6 = read_debug_reg(tid, DR_STATUS)?;
                write_debug_reg(tid, DR_STATUS, 0)?;
                if let Some(slot) = (0..WATCH_SLOTS).find(|&i| dr6 & (1 << i) != 0) {
                    let dr7 = read_debug_reg(tid, DR_CONTROL)?;
                    return Ok(StopEvent::Watchpoint {
                        thread,
                        address: VirtAddr(read_debug_reg(tid, slot)?),
                        access: slot_access(dr7, slot),
                    });
                }
                if dr6 & DR6_SINGLE_STEP != 0 {
                    return Ok(StopEvent::SingleStep { thread });
                }
                Ok(StopEvent::Signal {
                    thread,
                    signal: Signal::SIGTRAP as i32,
                })
            }
            _ => Ok(StopEvent::SingleStep { thread }),
        }
    }

    /// Stop every thread still running after one reported an event.
    fn stop_all(&self, tracee: &mut Tracee) {
        let running: Vec<Pid> = tracee.running.drain().collect();
        for tid in running {
            if let Err(e) = tgkill(tracee.pid, tid, Signal::SIGSTOP) {
                debug!(tid = %tid, error = %e, "thread gone during stop-all");
                tracee.forget(tid);
                continue;
            }
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                    // hit a breakpoint concurrently; rewind so it traps again later
                    self.rewind_breakpoint(tid);
                    tracee.stray_stops.insert(tid);
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    tracee.pending_signals.insert(tid, sig);
                    tracee.stray_stops.insert(tid);
                }
                Ok(WaitStatus::PtraceEvent(_, _, event)) => {
                    if event == libc::PTRACE_EVENT_CLONE {
                        if let Ok(raw) = ptrace::getevent(tid) {
                            let child = Pid::from_raw(raw as i32);
                            let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                            tracee.adopt(child);
                        }
                    }
                    tracee.stray_stops.insert(tid);
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => {
                    tracee.forget(tid)
                }
                Ok(other) => {
                    debug!(tid = %tid, status = ?other, "unexpected status during stop-all")
                }
            }
        }
    }

    fn rewind_breakpoint(&self, tid: Pid) {
        let Ok(siginfo) = ptrace::getsiginfo(tid) else {
            return;
        };
        if siginfo.si_code != SI_KERNEL && siginfo.si_code != TRAP_BRKPT {
            return;
        }
        let Ok(mut regs) = ptrace::getregs(tid) else {
            return;
        };
        let mut byte = [0u8; 1];
        if self.mem.read_at(&mut byte, regs.rip - 1).ok() == Some(1) && byte[0] == INT3 {
            regs.rip -= 1;
            let _ = ptrace::setregs(tid, regs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchpoint::{WatchpointSize, WatchpointType};

    #[test]
    fn debug_register_offsets() {
        assert_eq!(debug_reg_offset(0), 848);
        assert_eq!(debug_reg_offset(7), 848 + 56);
        assert!(check_debug_reg(4).is_err());
        assert!(check_debug_reg(5).is_err());
        assert!(check_debug_reg(8).is_err());
        assert!(check_debug_reg(6).is_ok());
    }

    #[test]
    fn slot_access_follows_dr7() {
        let dr7 = dr7_set(0, 1, WatchpointType::Write, WatchpointSize::Byte8);
        let dr7 = dr7_set(dr7, 2, WatchpointType::ReadWrite, WatchpointSize::Byte4);
        let dr7 = dr7_set(dr7, 3, WatchpointType::Execute, WatchpointSize::Byte1);
        assert_eq!(slot_access(dr7, 1), AccessKind::Write);
        assert_eq!(slot_access(dr7, 2), AccessKind::Unknown);
        assert_eq!(slot_access(dr7, 3), AccessKind::Execute);
    }

    #[test]
    fn launch_fails_when_vm_exits_during_startup() {
        let result = NativeProcess::launch(Path::new("/bin/true"), &[]);
        assert!(matches!(result, Err(Error::Process(_)) | Err(Error::Ptrace(_))));
    }
}

//! The inspection session: one attached target, its mirrored VM state, and
//! the request thread that drives execution.
//!
//! All target-derived state lives in [`Inner`] behind a single
//! `ReentrantMutex`. The request thread takes it to run the
//! halt → refresh → publish cycle; client queries take it with a bounded
//! number of attempts and fail with [`Error::Busy`] rather than block
//! behind a long refresh. While the target runs nobody holds the lock, so
//! clients can see that it runs (and [`Session::pause`] it).
//!
//! Refresh order at every halt: classes, heap regions and GC state,
//! references, objects, code cache, breakpoints, watchpoints, threads,
//! memory regions. Then a new [`VmState`] is published to subscribers and
//! listeners, outside the lock.

use std::cell::RefCell;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::breakpoint::{
    BreakpointId, BreakpointLocation, BreakpointManager, BreakpointSummary, HitContext,
};
use crate::channel::{read_only, Interrupter, ProcessChannel, StopEvent, StopWaiter};
use crate::classes::{ClassAccess, ClassActor, Resolution};
use crate::code_cache::{CodeCacheAccess, CodeRegion, Compilation};
use crate::config::Config;
use crate::coredump;
use crate::disasm::{self, MAX_INSTRUCTION_LEN};
use crate::error::{Error, Result};
use crate::expr_eval::Condition;
use crate::heap_scheme::{self, HeapScheme};
use crate::layout::{BootHeader, GcInfo, HeapRegionRecord, TriggerRecord, BOOT_HEADER_SIZE};
use crate::memory::{self, MemoryRegion, MemoryStatus};
use crate::objects::{HeapView, MaxObject, ObjectAccess, Value};
use crate::reference::{ReferenceManager, ReferenceStats};
use crate::state::{VmState, HISTORY_LIMIT};
use crate::threads::{MaxThread, ThreadManager};
use crate::triggers::{TriggerAction, TriggerEvent, TriggerTable};
use crate::types::{AddressRange, ProcessState, ThreadId, VirtAddr};
use crate::unwind::{FrameSlot, StackFrame};
use crate::watchpoint::{
    Watchpoint, WatchpointHit, WatchpointId, WatchpointManager, WatchpointSettings,
};

/// Opens the backend. Runs on the request thread, which then owns it.
pub type Connector = Box<dyn FnOnce() -> Result<Box<dyn ProcessChannel>> + Send>;

pub type Listener = Arc<dyn Fn(&Arc<VmState>) + Send + Sync>;

/// Whether an execution request waits for the resulting halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Synchronous,
    Asynchronous,
}

/// Configuration and heap knowledge shared by the components of one session.
pub struct SessionContext {
    pub config: Config,
    pub header: BootHeader,
    pub scheme: Box<dyn HeapScheme>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Resume,
    SingleStep(ThreadId),
    StepOver(ThreadId),
    RunTo(VirtAddr),
    ReturnFromFrame(ThreadId),
    Refresh,
    Terminate,
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Resume => "resume",
            Command::SingleStep(_) => "single step",
            Command::StepOver(_) => "step over",
            Command::RunTo(_) => "run to location",
            Command::ReturnFromFrame(_) => "return from frame",
            Command::Refresh => "refresh",
            Command::Terminate => "terminate",
            Command::Shutdown => "shutdown",
        }
    }
}

struct Request {
    command: Command,
    reply: Option<Sender<Result<Arc<VmState>>>>,
}

#[derive(Debug, Clone, Copy)]
enum Run {
    Continue,
    Step(ThreadId),
}

enum Halt {
    Stop,
    Continue,
}

/// Results of the halts since the last publication.
#[derive(Default)]
struct Pending {
    started: Vec<Arc<MaxThread>>,
    died: Vec<Arc<MaxThread>>,
    single_stepped: Option<ThreadId>,
    breakpoint_hits: Vec<crate::breakpoint::BreakpointHit>,
    watchpoint_hit: Option<WatchpointHit>,
}

struct Inner {
    channel: Box<dyn ProcessChannel>,
    context: SessionContext,
    classes: ClassAccess,
    references: ReferenceManager,
    objects: ObjectAccess,
    code_cache: CodeCacheAccess,
    threads: ThreadManager,
    breakpoints: BreakpointManager,
    watchpoints: WatchpointManager,
    triggers: TriggerTable,
    heap_regions: Vec<HeapRegionRecord>,
    gc: GcInfo,
    regions: Vec<MemoryRegion>,
    process_state: ProcessState,
    epoch: u64,
    pending: Pending,
}

impl Inner {
    fn require_not_running(&self) -> Result<()> {
        if self.process_state == ProcessState::Running {
            return Err(Error::InvalidRequest("target is running".into()));
        }
        Ok(())
    }

    fn require_stopped(&self, what: &str) -> Result<()> {
        if self.process_state != ProcessState::Stopped {
            return Err(Error::InvalidRequest(format!(
                "{} requires a stopped target (target is {})",
                what, self.process_state
            )));
        }
        Ok(())
    }

    fn thread(&self, id: ThreadId) -> Result<&Arc<MaxThread>> {
        self.threads
            .find(id)
            .ok_or_else(|| Error::InvalidRequest(format!("no thread {}", id)))
    }

    fn heap(&mut self) -> (HeapView<'_>, &mut ObjectAccess) {
        (
            HeapView {
                channel: self.channel.as_memory(),
                scheme: &*self.context.scheme,
                classes: &self.classes,
                references: &mut self.references,
            },
            &mut self.objects,
        )
    }

    /// Bring every mirror up to date with target memory.
    fn refresh(&mut self) -> Result<()> {
        let channel = self.channel.as_memory();
        let header = self.context.header;

        let loaded = self.classes.update(channel, header.class_registry)?;
        self.heap_regions = HeapRegionRecord::read_all(channel, header.heap_info)?;
        self.gc = GcInfo::read(channel, header.gc_info)?;
        self.context.scheme.update(&self.heap_regions, self.gc);
        let references = self
            .references
            .update_after_gc(channel, &*self.context.scheme, &self.classes, self.gc)?;
        if !references.is_empty() {
            debug!(?references, "references updated");
        }
        self.objects.update(self.epoch);
        let code = self.code_cache.update(channel, &self.classes, header.code_cache)?;
        self.breakpoints.update(&code, &self.code_cache, &self.classes);
        self.watchpoints.reanchor();
        let threads = self.threads.update(
            channel,
            &self.code_cache,
            header.thread_list,
            self.context.config.session.max_stack_depth,
        )?;
        self.pending.started.extend(threads.started);
        self.pending.died.extend(threads.died);
        self.regions = memory::build(
            AddressRange::new(header.address, BOOT_HEADER_SIZE as u64),
            &self.heap_regions,
            self.code_cache.regions(),
            &self.threads.threads(),
        );
        debug!(
            epoch = self.epoch,
            classes_loaded = loaded.len(),
            compilations_added = code.added.len(),
            compilations_evicted = code.evicted.len(),
            threads = self.threads.len(),
            gc_count = self.gc.gc_count,
            "refresh complete"
        );
        Ok(())
    }

    /// Decide how an execution request runs the target.
    fn plan(&mut self, command: Command) -> Result<Run> {
        match command {
            Command::Resume => Ok(Run::Continue),
            Command::SingleStep(thread) => {
                self.thread(thread)?;
                Ok(Run::Step(thread))
            }
            Command::StepOver(thread) => {
                self.thread(thread)?;
                let ip = self.channel.read_registers(thread)?.ip();
                let code = (1..=MAX_INSTRUCTION_LEN)
                    .rev()
                    .find_map(|n| self.channel.read_bytes(ip, n).ok())
                    .unwrap_or_default();
                match disasm::decode_one(&code, ip) {
                    Some(insn) if insn.is_call => {
                        self.breakpoints.add_transient(ip + insn.len as u64);
                        Ok(Run::Continue)
                    }
                    _ => Ok(Run::Step(thread)),
                }
            }
            Command::RunTo(address) => {
                self.breakpoints.add_transient(address);
                Ok(Run::Continue)
            }
            Command::ReturnFromFrame(thread) => {
                let address = return_address(self.thread(thread)?)?;
                self.breakpoints.add_transient(address);
                Ok(Run::Continue)
            }
            other => Err(Error::InvalidRequest(format!(
                "{} does not run the target",
                other.name()
            ))),
        }
    }

    fn start(&mut self, run: Run, waiter: &mut dyn StopWaiter) -> Result<()> {
        match run {
            Run::Step(thread) => self.channel.single_step(thread)?,
            Run::Continue => self.prepare_resume(waiter)?,
        }
        self.process_state = ProcessState::Running;
        Ok(())
    }

    /// Step threads off breakpoint addresses, then plant breakpoints and
    /// watchpoints and let the target run.
    fn prepare_resume(&mut self, waiter: &mut dyn StopWaiter) -> Result<()> {
        let triggers = self.triggers.addresses();
        for thread in self.channel.threads()? {
            let ip = match self.channel.read_registers(thread) {
                Ok(registers) => registers.ip(),
                Err(_) => continue,
            };
            if !self.breakpoints.is_breakpoint_at(ip) && !triggers.contains(&ip) {
                continue;
            }
            trace!(%thread, %ip, "stepping off breakpoint");
            self.channel.single_step(thread)?;
            match waiter.wait()? {
                StopEvent::SingleStep { .. } => {}
                StopEvent::Exited { code } => {
                    return Err(Error::Process(format!(
                        "process exited with code {} while stepping",
                        code
                    )))
                }
                other => warn!(?other, "unexpected stop while stepping off breakpoint"),
            }
        }
        self.breakpoints.install(self.channel.as_memory(), &triggers)?;
        if let Err(e) = self.watchpoints.install(&mut *self.channel) {
            let _ = self.breakpoints.uninstall(self.channel.as_memory());
            return Err(e);
        }
        if let Err(e) = self.channel.resume() {
            let _ = self.breakpoints.uninstall(self.channel.as_memory());
            let _ = self.watchpoints.uninstall(&mut *self.channel);
            return Err(e);
        }
        Ok(())
    }

    fn on_halt(&mut self, event: Result<StopEvent>) -> Result<Halt> {
        let restored = self.breakpoints.uninstall(self.channel.as_memory());
        let cleared = self.watchpoints.uninstall(&mut *self.channel);
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                self.process_state = ProcessState::Terminated;
                return Err(e);
            }
        };
        restored?;
        cleared?;
        self.process_state = ProcessState::Stopped;
        self.epoch += 1;
        debug!(?event, epoch = self.epoch, "target halted");

        if let StopEvent::Exited { code } = event {
            info!(code, "process exited");
            self.process_state = ProcessState::Terminated;
            self.breakpoints.clear_transients();
            return Ok(Halt::Stop);
        }
        self.refresh()?;

        match event {
            StopEvent::Breakpoint { thread, address } => {
                let mut handled = false;
                let mut stop = false;
                if let Some(trigger) = self.triggers.trigger_at(address) {
                    handled = true;
                    let action = self.triggers.dispatch(&TriggerEvent { trigger, thread });
                    stop |= action == TriggerAction::Stop;
                }
                if self.breakpoints.is_breakpoint_at(address) {
                    handled = true;
                    let registers = self.channel.read_registers(thread)?;
                    let ctx = HitContext {
                        channel: self.channel.as_memory(),
                        registers: &registers,
                    };
                    let evaluation = self.breakpoints.evaluate(thread, address, &ctx);
                    stop |= evaluation.should_stop();
                    self.pending.breakpoint_hits = evaluation.hits;
                }
                if handled && !stop {
                    debug!(%thread, %address, "breakpoint evaded");
                    return Ok(Halt::Continue);
                }
            }
            StopEvent::Watchpoint { thread, address, access } => {
                let in_gc = self.gc.phase.is_collecting();
                match self.watchpoints.evaluate_hit(address, access, in_gc) {
                    Some(watchpoint) => {
                        self.pending.watchpoint_hit = Some(WatchpointHit {
                            watchpoint,
                            thread,
                            address,
                            access,
                        })
                    }
                    None => return Ok(Halt::Continue),
                }
            }
            StopEvent::SingleStep { thread } => self.pending.single_stepped = Some(thread),
            StopEvent::Signal { thread, signal } => info!(%thread, signal, "stopped by signal"),
            StopEvent::Paused | StopEvent::Exited { .. } => {}
        }
        self.breakpoints.clear_transients();
        Ok(Halt::Stop)
    }
}

fn return_address(thread: &MaxThread) -> Result<VirtAddr> {
    thread
        .frames
        .get(1)
        .and_then(StackFrame::ip)
        .ok_or_else(|| Error::InvalidRequest("No return location available".into()))
}

struct Shared {
    inner: ReentrantMutex<RefCell<Inner>>,
    current: RwLock<Arc<VmState>>,
    subscribers: Mutex<Vec<Sender<Arc<VmState>>>>,
    listeners: Mutex<Vec<Listener>>,
    interrupter: Option<Arc<dyn Interrupter>>,
    lock_trials: u32,
    lock_retry: Duration,
}

impl Shared {
    /// Connect, read the boot header, and publish the first state.
    fn start(
        config: Config,
        connect: Connector,
    ) -> Result<(Arc<Shared>, Option<Box<dyn StopWaiter>>)> {
        let mut channel = connect()?;
        let boot = channel
            .boot_image_address()
            .or(config.session.boot_image_address.map(VirtAddr))
            .ok_or_else(|| {
                Error::Config("boot image address unknown; set session.boot_image_address".into())
            })?;
        let header = BootHeader::read(channel.as_memory(), boot)?;
        let (waiter, interrupter) = if channel.is_read_only() {
            (None, None)
        } else {
            (Some(channel.stop_waiter()?), Some(channel.interrupter()?))
        };
        let mut triggers = TriggerTable::standard();
        triggers.bind(&TriggerRecord::read_all(channel.as_memory(), header.trigger_table)?);
        let slots = channel.max_watchpoints();
        let lock_trials = config.session.lock_trials;
        let lock_retry = Duration::from_micros(config.session.lock_retry_interval_us);
        let scheme = heap_scheme::create(config.heap.scheme);
        info!(
            backend = ?channel.backend(),
            boot = %boot,
            scheme = scheme.name(),
            "session opened"
        );

        let mut inner = Inner {
            channel,
            context: SessionContext { config, header, scheme },
            classes: ClassAccess::new(),
            references: ReferenceManager::new(),
            objects: ObjectAccess::new(),
            code_cache: CodeCacheAccess::new(),
            threads: ThreadManager::new(),
            breakpoints: BreakpointManager::new(),
            watchpoints: WatchpointManager::new(slots),
            triggers,
            heap_regions: Vec::new(),
            gc: GcInfo::default(),
            regions: Vec::new(),
            process_state: ProcessState::Stopped,
            epoch: 0,
            pending: Pending::default(),
        };
        inner.refresh()?;

        let shared = Arc::new(Shared {
            inner: ReentrantMutex::new(RefCell::new(inner)),
            current: RwLock::new(Arc::new(VmState::initial())),
            subscribers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            interrupter,
            lock_trials,
            lock_retry,
        });
        {
            let guard = shared.inner.lock();
            let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
            shared.stage(&mut inner);
        }
        Ok((shared, waiter))
    }

    /// Acquire the session lock, giving up after the configured attempts.
    fn try_lock(&self) -> Result<ReentrantMutexGuard<'_, RefCell<Inner>>> {
        let trials = self.lock_trials.max(1);
        for attempt in 0..trials {
            if let Some(guard) = self.inner.try_lock() {
                return Ok(guard);
            }
            if attempt + 1 < trials {
                thread::sleep(self.lock_retry);
            }
        }
        debug!(trials, "session lock busy");
        Err(Error::Busy)
    }

    /// Build and install the next state. Called with the lock held.
    fn stage(&self, inner: &mut Inner) -> Arc<VmState> {
        let mut current = self.current.write();
        let pending = std::mem::take(&mut inner.pending);
        let state = Arc::new(VmState {
            process_state: inner.process_state,
            serial: current.serial + 1,
            epoch: inner.epoch,
            gc_phase: inner.gc.phase,
            gc_count: inner.gc.gc_count,
            threads: inner.threads.threads(),
            started: pending.started,
            died: pending.died,
            single_stepped: pending.single_stepped,
            breakpoint_hits: pending.breakpoint_hits,
            watchpoint_hit: pending.watchpoint_hit,
            breakpoint_changes: inner.breakpoints.take_changes(),
            previous: Some(current.trimmed(HISTORY_LIMIT - 1)),
        });
        *current = state.clone();
        debug!(serial = state.serial, state = %state.process_state, "state published");
        state
    }

    /// Deliver a published state. Called without the lock.
    fn notify(&self, state: &Arc<VmState>) {
        self.subscribers.lock().retain(|tx| tx.send(state.clone()).is_ok());
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(state);
        }
    }

    fn publish(&self, update: impl FnOnce(&mut Inner)) -> Option<Arc<VmState>> {
        let state = {
            let guard = self.inner.lock();
            let mut inner = guard.try_borrow_mut().ok()?;
            update(&mut inner);
            self.stage(&mut inner)
        };
        self.notify(&state);
        Some(state)
    }

    fn refresh(&self) -> Result<Arc<VmState>> {
        let state = {
            let guard = self.inner.lock();
            let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
            if matches!(inner.process_state, ProcessState::Running | ProcessState::Terminated) {
                return Err(Error::InvalidRequest(format!(
                    "cannot refresh a {} target",
                    inner.process_state
                )));
            }
            inner.refresh()?;
            self.stage(&mut inner)
        };
        self.notify(&state);
        Ok(state)
    }

    fn terminate(&self) -> Result<Arc<VmState>> {
        let state = {
            let guard = self.inner.lock();
            let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
            inner.require_stopped("terminate")?;
            inner.channel.kill()?;
            inner.process_state = ProcessState::Terminated;
            inner.breakpoints.clear_transients();
            info!("target terminated");
            self.stage(&mut inner)
        };
        self.notify(&state);
        Ok(state)
    }
}

/// State owned by the request thread.
struct Worker {
    shared: Arc<Shared>,
    waiter: Option<Box<dyn StopWaiter>>,
}

impl Worker {
    fn serve(mut self, requests: Receiver<Request>) {
        while let Ok(request) = requests.recv() {
            if request.command == Command::Shutdown {
                break;
            }
            trace!(command = request.command.name(), "request");
            let result = self.execute(request.command);
            if let Err(e) = &result {
                if e.is_fatal() {
                    error!(error = %e, "fatal error; session terminated");
                    self.shared
                        .publish(|inner| inner.process_state = ProcessState::Terminated);
                } else {
                    debug!(command = request.command.name(), error = %e, "request failed");
                }
            }
            if let Some(reply) = request.reply {
                let _ = reply.send(result);
            }
        }
        debug!("request thread exiting");
    }

    fn execute(&mut self, command: Command) -> Result<Arc<VmState>> {
        match command {
            Command::Refresh => self.shared.refresh(),
            Command::Terminate => self.shared.terminate(),
            _ => {
                let mut announced = false;
                let result = self.run(command, &mut announced);
                if result.is_err() && announced {
                    // clients saw Running; tell them where the target ended up
                    self.shared.publish(|_| {});
                }
                result
            }
        }
    }

    fn run(&mut self, command: Command, announced: &mut bool) -> Result<Arc<VmState>> {
        let waiter = self.waiter.as_deref_mut().ok_or_else(|| read_only(command.name()))?;
        let shared = &self.shared;
        let mut run = {
            let guard = shared.inner.lock();
            let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
            inner.require_stopped(command.name())?;
            inner.plan(command)?
        };
        loop {
            let running = {
                let guard = shared.inner.lock();
                let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
                inner.start(run, waiter)?;
                if *announced {
                    None
                } else {
                    *announced = true;
                    Some(shared.stage(&mut inner))
                }
            };
            if let Some(state) = running {
                shared.notify(&state);
            }

            let event = waiter.wait();

            let stopped = {
                let guard = shared.inner.lock();
                let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
                match inner.on_halt(event)? {
                    Halt::Stop => Some(shared.stage(&mut inner)),
                    Halt::Continue => None,
                }
            };
            match stopped {
                Some(state) => {
                    shared.notify(&state);
                    return Ok(state);
                }
                None => run = Run::Continue,
            }
        }
    }
}

/// An open inspection session.
pub struct Session {
    shared: Arc<Shared>,
    requests: Mutex<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to a target on a new request thread and mirror its state.
    pub fn open(config: Config, connect: Connector) -> Result<Session> {
        let (requests, incoming) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker = thread::Builder::new()
            .name("rtele-requests".into())
            .spawn(move || match Shared::start(config, connect) {
                Ok((shared, waiter)) => {
                    let _ = ready_tx.send(Ok(shared.clone()));
                    Worker { shared, waiter }.serve(incoming);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;
        let shared = ready_rx
            .recv()
            .map_err(|_| Error::Process("request thread exited during startup".into()))??;
        Ok(Session {
            shared,
            requests: Mutex::new(requests),
            worker: Some(worker),
        })
    }

    /// Latest published state. Never blocks.
    pub fn state(&self) -> Arc<VmState> {
        self.shared.current.read().clone()
    }

    pub fn process_state(&self) -> ProcessState {
        self.state().process_state
    }

    pub fn subscribe(&self) -> Receiver<Arc<VmState>> {
        let (tx, rx) = mpsc::channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Register a callback for every published state; it runs outside the session lock.
    pub fn add_listener(&self, listener: impl Fn(&Arc<VmState>) + Send + Sync + 'static) {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    fn query<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R>) -> Result<R> {
        let guard = self.shared.try_lock()?;
        let mut inner = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
        inner.require_not_running()?;
        f(&mut inner)
    }

    pub fn config(&self) -> Result<Config> {
        self.query(|inner| Ok(inner.context.config.clone()))
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn find_object_at(&self, origin: VirtAddr) -> Result<Option<MaxObject>> {
        self.query(|inner| {
            let (mut heap, objects) = inner.heap();
            objects.find_object_at(&mut heap, origin)
        })
    }

    pub fn read_field(&self, object: &MaxObject, field: &str) -> Result<Value> {
        self.query(|inner| {
            let (mut heap, objects) = inner.heap();
            objects.read_field_value(&mut heap, object, field)
        })
    }

    pub fn array_length(&self, object: &MaxObject) -> Result<u64> {
        self.query(|inner| {
            let (mut heap, objects) = inner.heap();
            objects.array_length(&mut heap, object)
        })
    }

    pub fn read_array_element(&self, object: &MaxObject, index: u64) -> Result<Value> {
        self.query(|inner| {
            let (mut heap, objects) = inner.heap();
            objects.read_array_element(&mut heap, object, index)
        })
    }

    pub fn read_string(&self, object: &MaxObject) -> Result<String> {
        self.query(|inner| {
            let (mut heap, objects) = inner.heap();
            objects.read_string(&mut heap, object)
        })
    }

    pub fn reference_stats(&self) -> Result<ReferenceStats> {
        self.query(|inner| Ok(inner.references.stats()))
    }

    pub fn find_compilation(&self, addr: VirtAddr) -> Result<Option<Arc<Compilation>>> {
        self.query(|inner| Ok(inner.code_cache.find_compilation(addr)))
    }

    pub fn find_thread_by_stack_address(&self, addr: VirtAddr) -> Result<Option<Arc<MaxThread>>> {
        self.query(|inner| Ok(inner.threads.find_by_stack_address(addr).cloned()))
    }

    pub fn find_stack_frame(&self, addr: VirtAddr) -> Result<Option<(Arc<MaxThread>, StackFrame)>> {
        self.query(|inner| Ok(inner.threads.find_stack_frame(addr)))
    }

    /// Locals, stack slots and locks of frame `index` (0 = innermost) of `thread`.
    pub fn frame_slots(&self, thread: ThreadId, index: usize) -> Result<Vec<FrameSlot>> {
        self.query(|inner| {
            let thread = inner.thread(thread)?.clone();
            let frame = thread
                .frames
                .get(index)
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("no frame {} in thread {}", index, thread.id))
                })?;
            let registers = if index == 0 { thread.registers.as_ref() } else { None };
            Ok(frame.slots(inner.channel.as_memory(), registers))
        })
    }

    pub fn memory_regions(&self) -> Result<Vec<MemoryRegion>> {
        self.query(|inner| Ok(inner.regions.clone()))
    }

    pub fn heap_regions(&self) -> Result<Vec<HeapRegionRecord>> {
        self.query(|inner| Ok(inner.heap_regions.clone()))
    }

    pub fn code_regions(&self) -> Result<Vec<CodeRegion>> {
        self.query(|inner| Ok(inner.code_cache.regions().to_vec()))
    }

    /// Threads of the latest published state.
    pub fn threads(&self) -> Vec<Arc<MaxThread>> {
        self.state().threads.clone()
    }

    pub fn classes(&self) -> Result<Vec<Arc<ClassActor>>> {
        self.query(|inner| Ok(inner.classes.classes().to_vec()))
    }

    pub fn find_class(&self, name: &str) -> Result<Resolution<Arc<ClassActor>>> {
        self.query(|inner| Ok(inner.classes.resolve(name)))
    }

    pub fn read_memory(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        self.query(|inner| inner.channel.read_bytes(addr, len))
    }

    pub fn memory_status(&self, addr: VirtAddr) -> Result<MemoryStatus> {
        self.query(|inner| Ok(memory::status(&inner.regions, inner.channel.as_memory(), addr)))
    }

    pub fn breakpoints(&self) -> Result<Vec<BreakpointSummary>> {
        self.query(|inner| Ok(inner.breakpoints.summaries()))
    }

    pub fn watchpoints(&self) -> Result<Vec<Watchpoint>> {
        self.query(|inner| Ok(inner.watchpoints.watchpoints().cloned().collect()))
    }

    /// Write the target's memory and registers to an ELF core file.
    pub fn write_core(&self, path: &Path) -> Result<()> {
        self.query(|inner| {
            let channel = inner.channel.as_memory();
            let mut ranges = channel.mapped_ranges();
            if ranges.is_empty() {
                ranges = inner.regions.iter().map(|r| r.range).collect();
            }
            let threads = inner.channel.threads()?;
            let boot = Some(inner.context.header.address);
            let info = coredump::capture(channel, &threads, &ranges, boot);
            coredump::write(path, &info)
        })
    }

    // ── Breakpoints and watchpoints ─────────────────────────────────

    pub fn make_breakpoint(
        &self,
        location: BreakpointLocation,
        condition: Option<&str>,
    ) -> Result<BreakpointId> {
        let condition = condition.map(Condition::parse).transpose()?;
        self.query(|inner| {
            let id = inner
                .breakpoints
                .make_breakpoint(location, condition, &inner.code_cache, &inner.classes)?;
            info!(%id, "breakpoint created");
            Ok(id)
        })
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<()> {
        self.query(|inner| inner.breakpoints.remove(id))
    }

    pub fn set_breakpoint_enabled(&self, id: BreakpointId, enabled: bool) -> Result<()> {
        self.query(|inner| inner.breakpoints.set_enabled(id, enabled))
    }

    pub fn set_breakpoint_condition(
        &self,
        id: BreakpointId,
        condition: Option<&str>,
    ) -> Result<()> {
        let condition = condition.map(Condition::parse).transpose()?;
        self.query(|inner| inner.breakpoints.set_condition(id, condition))
    }

    pub fn set_region_watchpoint(
        &self,
        range: AddressRange,
        settings: WatchpointSettings,
    ) -> Result<WatchpointId> {
        self.query(|inner| {
            let description = memory::find(&inner.regions, range.start)
                .map(|r| r.name.clone())
                .unwrap_or_else(|| "region".to_string());
            inner.watchpoints.set_region(range, settings, &description)
        })
    }

    /// Watch one field of an object; the watchpoint follows the object when it moves.
    pub fn set_object_watchpoint(
        &self,
        object: &MaxObject,
        field: &str,
        settings: WatchpointSettings,
    ) -> Result<WatchpointId> {
        let field = object.class().find_field(field).cloned().ok_or_else(|| {
            Error::InvalidRequest(format!("{} has no field '{}'", object.class().name, field))
        })?;
        self.query(|inner| {
            inner.watchpoints.set_object(
                object.reference().clone(),
                field.offset as u64,
                field.kind.size().max(1) as u64,
                settings,
            )
        })
    }

    pub fn remove_watchpoint(&self, id: WatchpointId) -> Result<()> {
        self.query(|inner| inner.watchpoints.remove(id))
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Reject a request that cannot run in the current state.
    fn validate(&self, command: Command) -> Result<()> {
        let guard = self.shared.try_lock()?;
        let inner = guard.try_borrow().map_err(|_| Error::Busy)?;
        if inner.channel.is_read_only() && command != Command::Refresh {
            return Err(read_only(command.name()));
        }
        match command {
            Command::Terminate => {
                if inner.process_state == ProcessState::Terminated {
                    return Err(Error::InvalidRequest("target already terminated".into()));
                }
            }
            _ => inner.require_stopped(command.name())?,
        }
        match command {
            Command::SingleStep(thread) | Command::StepOver(thread) => {
                inner.thread(thread)?;
            }
            Command::ReturnFromFrame(thread) => {
                return_address(inner.thread(thread)?)?;
            }
            Command::RunTo(address) => {
                if !inner.channel.is_readable(address, 1) {
                    return Err(Error::InvalidAddress {
                        addr: address,
                        reason: "not mapped".into(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn submit(&self, command: Command, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.validate(command)?;
        self.send(command, mode)
    }

    fn send(&self, command: Command, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        let (reply, response) = match mode {
            RequestMode::Synchronous => {
                let (tx, rx) = mpsc::channel();
                (Some(tx), Some(rx))
            }
            RequestMode::Asynchronous => (None, None),
        };
        self.requests
            .lock()
            .send(Request { command, reply })
            .map_err(|_| Error::InvalidRequest("session is closed".into()))?;
        match response {
            Some(rx) => rx
                .recv()
                .map_err(|_| Error::Process("request thread exited".into()))?
                .map(Some),
            None => Ok(None),
        }
    }

    pub fn resume(&self, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::Resume, mode)
    }

    /// Stop a running target. The halt is published by the request thread.
    pub fn pause(&self) -> Result<()> {
        {
            let guard = self.shared.try_lock()?;
            let inner = guard.try_borrow().map_err(|_| Error::Busy)?;
            if inner.process_state != ProcessState::Running {
                return Err(Error::InvalidRequest(format!(
                    "pause requires a running target (target is {})",
                    inner.process_state
                )));
            }
        }
        let interrupter = self.shared.interrupter.as_ref().ok_or_else(|| read_only("pause"))?;
        interrupter.interrupt()
    }

    pub fn single_step(&self, thread: ThreadId, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::SingleStep(thread), mode)
    }

    /// Single step, treating a call as one instruction.
    pub fn step_over(&self, thread: ThreadId, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::StepOver(thread), mode)
    }

    pub fn run_to_location(
        &self,
        address: VirtAddr,
        mode: RequestMode,
    ) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::RunTo(address), mode)
    }

    /// Run until the top frame of `thread` returns to its caller.
    pub fn return_from_frame(
        &self,
        thread: ThreadId,
        mode: RequestMode,
    ) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::ReturnFromFrame(thread), mode)
    }

    /// Re-read target state without running it; publishes a new state.
    pub fn refresh(&self, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.submit(Command::Refresh, mode)
    }

    pub fn terminate(&self, mode: RequestMode) -> Result<Option<Arc<VmState>>> {
        self.validate(Command::Terminate)?;
        if self.state().process_state == ProcessState::Running {
            if let Some(interrupter) = &self.shared.interrupter {
                interrupter.interrupt()?;
            }
        }
        self.send(Command::Terminate, mode)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.requests.lock().send(Request {
            command: Command::Shutdown,
            reply: None,
        });
        let Some(worker) = self.worker.take() else {
            return;
        };
        let mut interrupted = None;
        while !worker.is_finished() {
            let state = self.state();
            if state.process_state == ProcessState::Running && interrupted != Some(state.serial) {
                if let Some(interrupter) = &self.shared.interrupter {
                    let _ = interrupter.interrupt();
                }
                interrupted = Some(state.serial);
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = worker.join();
    }
}

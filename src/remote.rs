//! Remote backend: a VM behind a GDB remote stub, reached over TCP.
//!
//! One [`Connection`] carries every packet. While the target runs, the stop
//! waiter holds it for the stop reply; interrupts go out on a cloned socket
//! as a bare `0x03` byte.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::breakpoint::INT3;
use crate::channel::{
    Backend, HardwareWatch, Interrupter, MemoryChannel, ProcessChannel, StopEvent, StopWaiter,
};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::gdb_rsp::{self, Connection, StopReply};
use crate::registers::RegisterSet;
use crate::types::{ThreadId, VirtAddr};
use crate::watchpoint::WatchpointType;

/// Largest memory transfer per `m`/`M` packet.
const MAX_TRANSFER: usize = 2048;

type Link = Arc<Mutex<Connection<TcpStream>>>;

#[derive(Debug, Default)]
struct RunState {
    stepping: Option<ThreadId>,
    interrupted: bool,
    exited: bool,
}

pub struct RemoteTarget {
    address: String,
    link: Link,
    run: Arc<Mutex<RunState>>,
    interrupt_stream: TcpStream,
    slots: Vec<Option<HardwareWatch>>,
    timeout: Duration,
}

impl RemoteTarget {
    /// Connect to a stub at `address` (`host:port`). The target must be stopped.
    pub fn connect(address: &str, config: &RemoteConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let interrupt_stream = stream.try_clone()?;
        let mut conn = Connection::new(stream);

        let features = conn.request("qSupported:swbreak+;hwbreak+")?;
        debug!(features = %features, "remote stub features");
        match gdb_rsp::parse_stop_reply(&conn.request("?")?)? {
            StopReply::Exited { code } => {
                return Err(Error::Process(format!(
                    "remote target already exited with code {}",
                    code
                )))
            }
            StopReply::Terminated { signal } => {
                return Err(Error::Process(format!(
                    "remote target already killed by signal {}",
                    signal
                )))
            }
            stop => debug!(?stop, "initial stop"),
        }
        info!(address, "connected to remote stub");

        Ok(RemoteTarget {
            address: address.to_owned(),
            link: Arc::new(Mutex::new(conn)),
            run: Arc::new(Mutex::new(RunState::default())),
            interrupt_stream,
            slots: vec![None; config.watchpoint_slots],
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn expect_ok(reply: &str, what: &str) -> Result<()> {
    match reply {
        "OK" => Ok(()),
        "" => Err(Error::Protocol(format!("remote stub does not support {}", what))),
        other => Err(Error::Protocol(format!("{} failed: {}", what, other))),
    }
}

fn select_thread(conn: &mut Connection<TcpStream>, thread: ThreadId) -> Result<()> {
    match conn.request(&format!("Hg{:x}", thread.0))?.as_str() {
        "OK" => Ok(()),
        other => Err(Error::Register(format!("no thread {} on remote target ({})", thread, other))),
    }
}

fn fetch_registers(conn: &mut Connection<TcpStream>, thread: ThreadId) -> Result<RegisterSet> {
    select_thread(conn, thread)?;
    let reply = conn.request("g")?;
    if reply.starts_with('E') {
        return Err(Error::Register(format!("register read failed: {}", reply)));
    }
    gdb_rsp::registers_from_g(&reply)
}

/// Write `rip`, with `P` when the stub has it and `G` otherwise.
fn store_ip(conn: &mut Connection<TcpStream>, thread: ThreadId, ip: VirtAddr) -> Result<()> {
    select_thread(conn, thread)?;
    let reply = conn.request(&gdb_rsp::register_write_packet("rip", ip.0)?)?;
    if reply.is_empty() {
        let mut registers = fetch_registers(conn, thread)?;
        registers.set_ip(ip);
        let reply = conn.request(&format!("G{}", gdb_rsp::registers_to_g(&registers)?))?;
        return expect_ok(&reply, "register writes");
    }
    expect_ok(&reply, "register writes")
}

fn read_memory(conn: &mut Connection<TcpStream>, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = (len - out.len()).min(MAX_TRANSFER);
        let at = addr.0 + out.len() as u64;
        let reply = conn.request(&gdb_rsp::memory_read_packet(at, chunk))?;
        if reply.starts_with('E') {
            return Err(Error::UnreadableMemory { addr, len });
        }
        let bytes = gdb_rsp::hex_to_bytes(&reply)
            .ok_or_else(|| Error::Protocol(format!("bad memory reply at {:#x}", at)))?;
        if bytes.len() < chunk {
            // partial replies stop at the first unreadable byte
            return Err(Error::UnreadableMemory { addr, len });
        }
        out.extend_from_slice(&bytes[..chunk]);
    }
    Ok(out)
}

fn watch_packet(insert: bool, watch: &HardwareWatch) -> String {
    let kind = match watch.kind {
        WatchpointType::Execute => 1,
        WatchpointType::Write => 2,
        WatchpointType::ReadWrite => 4,
    };
    format!(
        "{}{},{:x},{:x}",
        if insert { 'Z' } else { 'z' },
        kind,
        watch.address.0,
        watch.size.bytes()
    )
}

impl MemoryChannel for RemoteTarget {
    fn read_bytes(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        read_memory(&mut self.link.lock(), addr, len)
    }

    fn write_bytes(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mut conn = self.link.lock();
        for (i, chunk) in data.chunks(MAX_TRANSFER).enumerate() {
            let at = addr.0 + (i * MAX_TRANSFER) as u64;
            let reply = conn.request(&gdb_rsp::memory_write_packet(at, chunk))?;
            if reply != "OK" {
                return Err(Error::InvalidAddress {
                    addr: VirtAddr(at),
                    reason: format!("remote write failed: {}", reply),
                });
            }
        }
        Ok(())
    }

    fn read_registers(&self, thread: ThreadId) -> Result<RegisterSet> {
        fetch_registers(&mut self.link.lock(), thread)
    }

    fn backend(&self) -> Backend {
        Backend::Remote
    }
}

impl ProcessChannel for RemoteTarget {
    fn as_memory(&self) -> &dyn MemoryChannel {
        self
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        let mut conn = self.link.lock();
        let mut threads = Vec::new();
        let mut query = "qfThreadInfo";
        loop {
            let (ids, more) = gdb_rsp::parse_thread_list(&conn.request(query)?)?;
            threads.extend(ids.into_iter().map(ThreadId));
            if !more {
                break;
            }
            query = "qsThreadInfo";
        }
        threads.sort();
        threads.dedup();
        Ok(threads)
    }

    fn resume(&mut self) -> Result<()> {
        {
            let mut run = self.run.lock();
            if run.exited {
                return Err(Error::Process("remote target has exited".into()));
            }
            run.stepping = None;
        }
        self.link.lock().send("c")
    }

    fn single_step(&mut self, thread: ThreadId) -> Result<()> {
        self.run.lock().stepping = Some(thread);
        self.link.lock().send(&format!("vCont;s:{:x}", thread.0))
    }

    fn set_instruction_pointer(&mut self, thread: ThreadId, ip: VirtAddr) -> Result<()> {
        store_ip(&mut self.link.lock(), thread, ip)
    }

    fn stop_waiter(&mut self) -> Result<Box<dyn StopWaiter>> {
        Ok(Box::new(RemoteWaiter {
            link: self.link.clone(),
            run: self.run.clone(),
            timeout: self.timeout,
        }))
    }

    fn interrupter(&self) -> Result<Arc<dyn Interrupter>> {
        Ok(Arc::new(RemoteInterrupter {
            stream: self.interrupt_stream.try_clone()?,
            run: self.run.clone(),
        }))
    }

    fn kill(&mut self) -> Result<()> {
        let mut run = self.run.lock();
        if run.exited {
            return Ok(());
        }
        // the stub may close the connection without acknowledging
        if let Err(e) = self.link.lock().send("k") {
            debug!(error = %e, "kill not acknowledged");
        }
        run.exited = true;
        info!(address = %self.address, "remote target killed");
        Ok(())
    }

    fn max_watchpoints(&self) -> usize {
        self.slots.len()
    }

    fn activate_watchpoint(&mut self, slot: usize, watch: &HardwareWatch) -> Result<()> {
        if slot >= self.slots.len() {
            return Err(Error::InvalidRequest(format!("no watch slot {}", slot)));
        }
        let reply = self.link.lock().request(&watch_packet(true, watch))?;
        match reply.as_str() {
            "OK" => {
                self.slots[slot] = Some(*watch);
                Ok(())
            }
            "" => Err(Error::InvalidRequest(format!(
                "remote stub does not support {} watchpoints",
                watch.kind
            ))),
            other => Err(Error::InvalidRequest(format!(
                "remote stub refused watchpoint at {}: {}",
                watch.address, other
            ))),
        }
    }

    fn deactivate_watchpoint(&mut self, slot: usize) -> Result<()> {
        let Some(watch) = self.slots.get_mut(slot).and_then(Option::take) else {
            return Ok(());
        };
        let reply = self.link.lock().request(&watch_packet(false, &watch))?;
        if reply != "OK" {
            warn!(address = %watch.address, reply = %reply, "watchpoint removal refused");
        }
        Ok(())
    }
}

impl Drop for RemoteTarget {
    fn drop(&mut self) {
        if self.run.lock().exited {
            return;
        }
        if let Err(e) = self.link.lock().request("D") {
            debug!(error = %e, "detach failed");
        }
    }
}

struct RemoteInterrupter {
    stream: TcpStream,
    run: Arc<Mutex<RunState>>,
}

impl Interrupter for RemoteInterrupter {
    fn interrupt(&self) -> Result<()> {
        self.run.lock().interrupted = true;
        (&self.stream).write_all(&[gdb_rsp::INTERRUPT])?;
        debug!("interrupt sent");
        Ok(())
    }
}

struct RemoteWaiter {
    link: Link,
    run: Arc<Mutex<RunState>>,
    timeout: Duration,
}

impl RemoteWaiter {
    fn next_stop(&self) -> Result<StopReply> {
        let mut conn = self.link.lock();
        conn.get_ref().set_read_timeout(None)?;
        let reply = conn.receive();
        conn.get_ref().set_read_timeout(Some(self.timeout))?;
        gdb_rsp::parse_stop_reply(&reply?)
    }

    fn current_thread(&self) -> Result<ThreadId> {
        let reply = self.link.lock().request("qC")?;
        reply
            .strip_prefix("QC")
            .and_then(gdb_rsp::parse_thread_id)
            .map(ThreadId)
            .ok_or_else(|| Error::Protocol(format!("stop reply names no thread (qC: '{}')", reply)))
    }

    /// A SIGTRAP that is neither a step nor a watch: find the INT3 that raised it.
    fn classify_trap(&self, thread: ThreadId, reported: bool) -> Result<StopEvent> {
        let mut conn = self.link.lock();
        let ip = fetch_registers(&mut conn, thread)?.ip();
        if ip.0 > 0 && read_memory(&mut conn, VirtAddr(ip.0 - 1), 1)? == [INT3] {
            let address = VirtAddr(ip.0 - 1);
            store_ip(&mut conn, thread, address)?;
            return Ok(StopEvent::Breakpoint { thread, address });
        }
        if reported {
            return Ok(StopEvent::Breakpoint { thread, address: ip });
        }
        Ok(StopEvent::Signal {
            thread,
            signal: gdb_rsp::SIGTRAP as i32,
        })
    }
}

impl StopWaiter for RemoteWaiter {
    fn wait(&mut self) -> Result<StopEvent> {
        let stop = loop {
            match self.next_stop()? {
                StopReply::Output(text) => debug!(output = %text.trim_end(), "remote console"),
                stop => break stop,
            }
        };
        let (stepping, interrupted) = {
            let mut run = self.run.lock();
            if matches!(stop, StopReply::Exited { .. } | StopReply::Terminated { .. }) {
                run.exited = true;
            }
            (run.stepping.take(), std::mem::take(&mut run.interrupted))
        };
        match stop {
            StopReply::Exited { code } => Ok(StopEvent::Exited { code: code as i32 }),
            StopReply::Terminated { signal } => Ok(StopEvent::Exited {
                code: 128 + signal as i32,
            }),
            StopReply::Output(_) => Err(Error::Protocol("unexpected console output".into())),
            StopReply::Signal {
                signal,
                thread,
                watch,
                breakpoint,
            } => {
                let thread = match thread.map(ThreadId).or(stepping) {
                    Some(thread) => thread,
                    None => self.current_thread()?,
                };
                if let Some((access, address)) = watch {
                    return Ok(StopEvent::Watchpoint {
                        thread,
                        address: VirtAddr(address),
                        access,
                    });
                }
                if signal == gdb_rsp::SIGTRAP {
                    if let Some(stepped) = stepping {
                        return Ok(StopEvent::SingleStep { thread: stepped });
                    }
                    return self.classify_trap(thread, breakpoint);
                }
                if interrupted && (signal == gdb_rsp::SIGINT || signal == 0) {
                    return Ok(StopEvent::Paused);
                }
                Ok(StopEvent::Signal {
                    thread,
                    signal: signal as i32,
                })
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use rtele::breakpoint::{BreakpointId, BreakpointLocation};
use rtele::channel::ProcessChannel;
use rtele::classes::Resolution;
use rtele::commands;
use rtele::config::{self, Config};
use rtele::coredump::CoreFile;
use rtele::disasm::{self, DisasmStyle};
use rtele::memory::MemoryStatus;
use rtele::remote::RemoteTarget;
use rtele::session::{Connector, RequestMode, Session};
use rtele::state::VmState;
use rtele::types::{AddressRange, ProcessState, ThreadId, VirtAddr};
use rtele::watchpoint::{WatchpointId, WatchpointSettings};

const SYNC: RequestMode = RequestMode::Synchronous;

#[derive(Parser)]
#[command(
    name = "rtele",
    about = "Inspect a running VM: heap objects, classes, threads and compiled code"
)]
struct Cli {
    /// Attach to a running VM by PID
    #[arg(short = 'p', long = "attach", group = "target")]
    attach_pid: Option<i32>,

    /// Launch a VM and stop it once its boot image is mapped
    #[arg(long, group = "target")]
    launch: Option<PathBuf>,

    /// Connect to a GDB remote stub (host:port)
    #[arg(long, group = "target")]
    remote: Option<String>,

    /// Open an ELF core file read-only
    #[arg(long, group = "target")]
    core: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command file to run after connecting
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Boot image header address, overriding the configuration
    #[arg(long, value_parser = parse_address)]
    boot_image: Option<u64>,

    /// Log filter, overriding the configuration (e.g. `debug`, `rtele::session=trace`)
    #[arg(long)]
    log: Option<String>,

    /// Arguments passed to the launched VM
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(address) = cli.boot_image {
        config.session.boot_image_address = Some(address);
    }
    if let Some(level) = &cli.log {
        config.logging.level = level.clone();
    }
    config::init_logging(&config.logging);

    let (connector, description) = connector(&cli, &config)?;
    let session = Session::open(config, connector)
        .with_context(|| format!("cannot open {}", description))?;
    println!("{} {} ({})", "rtele".bold().cyan(), description, session.state().process_state);

    if let Some(path) = &cli.commands {
        cmd_source(&session, path)?;
    }

    let background = Arc::new(AtomicBool::new(false));
    {
        let background = background.clone();
        session.add_listener(move |state| {
            if state.process_state != ProcessState::Running
                && background.swap(false, Ordering::SeqCst)
            {
                println!();
                print_state(state);
            }
        });
    }

    let mut rl = DefaultEditor::new()?;
    loop {
        if session.process_state() == ProcessState::Terminated {
            println!("{}", "VM has terminated.".yellow());
            break;
        }

        let prompt = format!("{} ", "rtele>".bold().green());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line)?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0];
        let args = &parts[1..];

        match handle_command(&session, &background, cmd, args) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => eprintln!("{}: {}", "error".red(), e),
        }
    }

    Ok(())
}

fn connector(cli: &Cli, config: &Config) -> anyhow::Result<(Connector, String)> {
    if let Some(address) = &cli.remote {
        let address = address.clone();
        let remote = config.remote.clone();
        let description = format!("remote stub {}", address);
        return Ok((
            Box::new(move || {
                Ok(Box::new(RemoteTarget::connect(&address, &remote)?) as Box<dyn ProcessChannel>)
            }),
            description,
        ));
    }
    if let Some(path) = &cli.core {
        let path = path.clone();
        let description = format!("core file {}", path.display());
        return Ok((
            Box::new(move || Ok(Box::new(CoreFile::open(&path)?) as Box<dyn ProcessChannel>)),
            description,
        ));
    }
    native_connector(cli)
}

#[cfg(target_os = "linux")]
fn native_connector(cli: &Cli) -> anyhow::Result<(Connector, String)> {
    use rtele::process::NativeProcess;

    if let Some(pid) = cli.attach_pid {
        let pid = nix::unistd::Pid::from_raw(pid);
        return Ok((
            Box::new(move || Ok(Box::new(NativeProcess::attach(pid)?) as Box<dyn ProcessChannel>)),
            format!("attached to VM process {}", pid),
        ));
    }
    if let Some(program) = &cli.launch {
        let program = program.clone();
        let args = cli.args.clone();
        let description = format!("launched {}", program.display());
        return Ok((
            Box::new(move || {
                Ok(Box::new(NativeProcess::launch(&program, &args)?) as Box<dyn ProcessChannel>)
            }),
            description,
        ));
    }
    bail!(
        "provide a target: --attach <pid>, --launch <program>, --remote <addr> or --core <file>"
    )
}

#[cfg(not(target_os = "linux"))]
fn native_connector(_cli: &Cli) -> anyhow::Result<(Connector, String)> {
    bail!("--attach and --launch require Linux (ptrace); use --remote or --core")
}

/// Returns `true` when the REPL should exit.
fn handle_command(
    session: &Session,
    background: &AtomicBool,
    cmd: &str,
    args: &[&str],
) -> anyhow::Result<bool> {
    match cmd {
        "continue" | "c" => cmd_continue(session, background, args)?,
        "pause" => {
            session.pause()?;
        }
        "stepi" | "si" => cmd_execute(session, |s, t| s.single_step(t, SYNC), args)?,
        "next" | "n" => cmd_execute(session, |s, t| s.step_over(t, SYNC), args)?,
        "finish" | "fin" => cmd_execute(session, |s, t| s.return_from_frame(t, SYNC), args)?,
        "until" | "u" => cmd_until(session, args)?,
        "refresh" => cmd_refresh(session)?,
        "kill" => cmd_kill(session)?,
        "state" | "info" => print_state(&session.state()),
        "threads" | "thr" => cmd_threads(session),
        "backtrace" | "bt" => cmd_backtrace(session, args)?,
        "frame" | "f" => cmd_frame(session, args)?,
        "register" | "reg" | "r" => cmd_register(session, args)?,
        "memory" | "mem" | "x" => cmd_memory(session, args)?,
        "disassemble" | "disas" | "d" => cmd_disassemble(session, args)?,
        "object" | "obj" | "o" => cmd_object(session, args)?,
        "classes" => cmd_classes(session, args)?,
        "class" => cmd_class(session, args)?,
        "code" => cmd_code(session, args)?,
        "breakpoint" | "break" | "b" => cmd_breakpoint(session, args)?,
        "watchpoint" | "watch" | "wp" => cmd_watchpoint(session, args)?,
        "refs" => cmd_refs(session)?,
        "core" => cmd_core(session, args)?,
        "source" => match args.first() {
            Some(path) => cmd_source(session, Path::new(path))?,
            None => println!("usage: source <command file>"),
        },
        "help" | "h" => cmd_help(),
        "quit" | "q" => return Ok(true),
        _ => println!("unknown command: {}. Type 'help' for available commands.", cmd),
    }
    Ok(false)
}

// ── Execution ───────────────────────────────────────────────────────

fn cmd_continue(session: &Session, background: &AtomicBool, args: &[&str]) -> anyhow::Result<()> {
    if args.first() == Some(&"&") {
        background.store(true, Ordering::SeqCst);
        if let Err(e) = session.resume(RequestMode::Asynchronous) {
            background.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        println!("  running; use 'pause' to stop");
        return Ok(());
    }
    print_outcome(session.resume(SYNC)?);
    Ok(())
}

fn cmd_execute(
    session: &Session,
    request: impl FnOnce(&Session, ThreadId) -> rtele::error::Result<Option<Arc<VmState>>>,
    args: &[&str],
) -> anyhow::Result<()> {
    let thread = select_thread(session, args.first().copied())?;
    print_outcome(request(session, thread)?);
    Ok(())
}

fn cmd_until(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let Some(addr) = args.first() else {
        println!("usage: until <address>");
        return Ok(());
    };
    let addr = VirtAddr(parse_address(addr)?);
    print_outcome(session.run_to_location(addr, SYNC)?);
    Ok(())
}

fn cmd_refresh(session: &Session) -> anyhow::Result<()> {
    print_outcome(session.refresh(SYNC)?);
    Ok(())
}

fn cmd_kill(session: &Session) -> anyhow::Result<()> {
    print_outcome(session.terminate(SYNC)?);
    Ok(())
}

fn print_outcome(state: Option<Arc<VmState>>) {
    if let Some(state) = state {
        print_state(&state);
    }
}

fn print_state(state: &VmState) {
    let label = match state.process_state {
        ProcessState::Stopped => "stopped".yellow(),
        ProcessState::Running => "running".green(),
        ProcessState::Terminated => "terminated".red(),
        ProcessState::None => "none".normal(),
    };
    println!(
        "  [{}] {}  epoch {}  {} thread(s)",
        state.serial,
        label,
        state.epoch,
        state.threads.len()
    );
    for hit in &state.breakpoint_hits {
        match hit.bytecode {
            Some(owner) => println!(
                "  {} #{} (bytecode #{}) in thread {} at {}",
                "breakpoint".bold(),
                hit.breakpoint,
                owner,
                hit.thread,
                format!("{}", hit.address).cyan()
            ),
            None => println!(
                "  {} #{} in thread {} at {}",
                "breakpoint".bold(),
                hit.breakpoint,
                hit.thread,
                format!("{}", hit.address).cyan()
            ),
        }
    }
    if let Some(hit) = &state.watchpoint_hit {
        println!(
            "  {} #{} in thread {}: {:?} at {}",
            "watchpoint".bold(),
            hit.watchpoint,
            hit.thread,
            hit.access,
            format!("{}", hit.address).cyan()
        );
    }
    if let Some(thread) = state.single_stepped {
        if let Some(ip) = state.thread(thread).and_then(|t| t.registers.as_ref()).map(|r| r.ip()) {
            println!("  thread {} at {}", thread, format!("{}", ip).cyan());
        }
    }
    for thread in &state.started {
        println!("  {} {}", "started".green(), thread);
    }
    for thread in &state.died {
        println!("  {} {}", "died".red(), thread);
    }
    for change in &state.breakpoint_changes {
        println!("  {:?}", change);
    }
}

// ── Threads and frames ──────────────────────────────────────────────

fn select_thread(session: &Session, arg: Option<&str>) -> anyhow::Result<ThreadId> {
    if let Some(arg) = arg {
        return Ok(ThreadId(arg.parse().with_context(|| format!("invalid thread id '{}'", arg))?));
    }
    let state = session.state();
    state
        .focus_thread()
        .or_else(|| state.threads.first().map(|t| t.id))
        .context("the VM has no threads")
}

fn cmd_threads(session: &Session) {
    let state = session.state();
    if state.threads.is_empty() {
        println!("  no threads");
    }
    let focus = state.focus_thread();
    for thread in &state.threads {
        let marker = if Some(thread.id) == focus { "*" } else { " " };
        println!("{} {}", marker.bold(), thread);
    }
}

fn cmd_backtrace(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let id = select_thread(session, args.first().copied())?;
    let state = session.state();
    let thread = state.thread(id).with_context(|| format!("no thread {}", id))?;
    for (i, frame) in thread.frames.iter().enumerate() {
        println!("  #{:<3} {}", i, frame);
    }
    Ok(())
}

fn cmd_frame(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    if args.len() < 2 {
        println!("usage: frame <thread> <index>");
        return Ok(());
    }
    let thread = select_thread(session, Some(args[0]))?;
    let index: usize = args[1].parse().context("invalid frame index")?;
    let slots = session.frame_slots(thread, index)?;
    if slots.is_empty() {
        println!("  no slot information for this frame");
    }
    for slot in slots {
        let value = match slot.value {
            Some(v) => format!("0x{:016x}", v).cyan(),
            None => "<unavailable>".yellow(),
        };
        println!("  {:?}[{}] = {}", slot.role, slot.index, value);
    }
    Ok(())
}

fn cmd_register(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let id = select_thread(session, args.first().copied())?;
    let state = session.state();
    let thread = state.thread(id).with_context(|| format!("no thread {}", id))?;
    let Some(regs) = &thread.registers else {
        println!("  registers unavailable for thread {}", id);
        return Ok(());
    };
    for (name, value) in regs.iter() {
        println!("  {:>8} = {}", name.bold(), format!("0x{:016x}", value).cyan());
    }
    Ok(())
}

// ── Memory and code ─────────────────────────────────────────────────

fn cmd_memory(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    match args.first().copied() {
        Some("regions") | Some("maps") => {
            for region in session.memory_regions()? {
                println!("  {}", region);
            }
        }
        Some("status") => {
            let arg = args.get(1).context("usage: memory status <address>")?;
            let addr = VirtAddr(parse_address(arg)?);
            match session.memory_status(addr)? {
                MemoryStatus::Unreadable => println!("  {} is {}", addr, "unreadable".red()),
                MemoryStatus::Unknown => println!("  {} is readable, outside known regions", addr),
                MemoryStatus::Region { name, kind } => {
                    println!("  {} is in {} ({})", addr, name.bold(), kind)
                }
            }
        }
        Some(addr) => {
            let addr = VirtAddr(parse_address(addr)?);
            let len: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);
            let data = session.read_memory(addr, len)?;
            print_hexdump(addr, &data);
        }
        None => {
            println!("usage: memory <address> [length]");
            println!("       memory regions");
            println!("       memory status <address>");
        }
    }
    Ok(())
}

fn cmd_disassemble(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let addr = match args.first() {
        Some(a) => VirtAddr(parse_address(a)?),
        None => {
            let state = session.state();
            let id = select_thread(session, None)?;
            state
                .thread(id)
                .and_then(|t| t.registers.as_ref())
                .map(|r| r.ip())
                .context("no instruction pointer; give an address")?
        }
    };
    let count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(10);
    let code = session.read_memory(addr, count * 15)?;
    let insns = disasm::disassemble(&code, addr, count, DisasmStyle::Intel);
    print!("{}", disasm::format_disassembly(&insns, Some(addr)));
    Ok(())
}

fn cmd_code(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let Some(addr) = args.first() else {
        println!("usage: code <address>");
        return Ok(());
    };
    let addr = VirtAddr(parse_address(addr)?);
    match session.find_compilation(addr)? {
        Some(compilation) => println!("  {}", compilation),
        None => match session.find_stack_frame(addr)? {
            Some((thread, frame)) => println!("  stack of thread {}: {}", thread.id, frame),
            None => println!("  {} is not in compiled code", addr),
        },
    }
    Ok(())
}

// ── Heap ────────────────────────────────────────────────────────────

fn cmd_object(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let Some(addr) = args.first() else {
        println!("usage: object <address> [field|index]");
        return Ok(());
    };
    let addr = VirtAddr(parse_address(addr)?);
    let Some(object) = session.find_object_at(addr)? else {
        println!("  no object at {}", addr);
        return Ok(());
    };
    let class = object.class().clone();

    if let Some(selector) = args.get(1) {
        let value = match selector.parse::<u64>() {
            Ok(index) if class.is_array() => session.read_array_element(&object, index)?,
            _ => session.read_field(&object, selector)?,
        };
        println!("  {} = {}", selector.bold(), value);
        return Ok(());
    }

    println!("  {} ({})", object.to_string().bold(), object.status());
    if class.is_array() {
        println!("  length = {}", session.array_length(&object)?);
    } else if class.name == "java.lang.String" {
        println!("  value = {:?}", session.read_string(&object)?);
    } else {
        for field in &class.fields {
            match session.read_field(&object, &field.name) {
                Ok(value) => println!("  {:>16} = {}", field.name, value),
                Err(e) => println!("  {:>16} = {}", field.name, e.to_string().red()),
            }
        }
    }
    Ok(())
}

fn cmd_classes(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let filter = args.first().copied().unwrap_or("");
    for class in session.classes()?.iter().filter(|c| c.name.contains(filter)) {
        println!(
            "  {:>5}  {}  ({} fields, {} methods)",
            class.id,
            class.name,
            class.fields.len(),
            class.methods.len()
        );
    }
    Ok(())
}

fn cmd_class(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let Some(name) = args.first() else {
        println!("usage: class <name>");
        return Ok(());
    };
    match session.find_class(name)? {
        Resolution::Resolved(class) => {
            println!("  {} (id {}, hub {})", class.name.bold(), class.id, class.hub);
            for field in &class.fields {
                println!("    +{:<4} {} {}", field.offset, field.type_name, field.name);
            }
            for method in &class.methods {
                println!("    {}{}", method.name.cyan(), method.signature);
            }
        }
        Resolution::Unresolved(name) => println!("  {} is not loaded", name),
    }
    Ok(())
}

fn cmd_refs(session: &Session) -> anyhow::Result<()> {
    let stats = session.reference_stats()?;
    println!("  live {}  forwarded {}  unknown {}", stats.live, stats.forwarded, stats.unknown);
    Ok(())
}

// ── Breakpoints and watchpoints ─────────────────────────────────────

fn cmd_breakpoint(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    match args.first().copied() {
        Some("set") | Some("s") => {
            if args.len() < 2 {
                println!("usage: breakpoint set <address|Class.method(sig)[@bci]> [if <cond>]");
                return Ok(());
            }
            let location = BreakpointLocation::parse(args[1])?;
            let condition = if args.len() >= 4 && args[2] == "if" {
                Some(args[3..].join(" "))
            } else {
                None
            };
            let id = session.make_breakpoint(location.clone(), condition.as_deref())?;
            match &condition {
                Some(cond) => println!("  breakpoint #{} set at {} if {}", id, location, cond),
                None => println!("  breakpoint #{} set at {}", id, location),
            }
        }
        Some("delete") | Some("d") => {
            let id = breakpoint_id(args.get(1))?;
            session.remove_breakpoint(id)?;
            println!("  breakpoint #{} removed", id);
        }
        Some("enable") => session.set_breakpoint_enabled(breakpoint_id(args.get(1))?, true)?,
        Some("disable") => session.set_breakpoint_enabled(breakpoint_id(args.get(1))?, false)?,
        Some("cond") => {
            let id = breakpoint_id(args.get(1))?;
            let condition = (args.len() > 2).then(|| args[2..].join(" "));
            session.set_breakpoint_condition(id, condition.as_deref())?;
        }
        Some("list") | Some("l") | None => {
            let bps = session.breakpoints()?;
            if bps.is_empty() {
                println!("  no breakpoints set");
            }
            for bp in bps {
                let owner = bp.owner.map(|o| format!(" (from #{})", o)).unwrap_or_default();
                match &bp.condition {
                    Some(cond) => println!(
                        "  #{}: {} [{}]{} if {}",
                        bp.id, bp.location, bp.state, owner, cond
                    ),
                    None => println!("  #{}: {} [{}]{}", bp.id, bp.location, bp.state, owner),
                }
            }
        }
        Some(sub) => println!("unknown breakpoint subcommand: {}", sub),
    }
    Ok(())
}

fn breakpoint_id(arg: Option<&&str>) -> anyhow::Result<BreakpointId> {
    let arg = arg.context("missing breakpoint id")?;
    let id = arg
        .trim_start_matches('#')
        .parse()
        .with_context(|| format!("invalid breakpoint id '{}'", arg))?;
    Ok(BreakpointId(id))
}

/// `r`, `w` and `x` letters, plus `g` to also trap while the collector runs.
fn parse_watch_settings(arg: Option<&&str>) -> WatchpointSettings {
    match arg {
        Some(flags) => WatchpointSettings {
            read: flags.contains('r'),
            write: flags.contains('w'),
            exec: flags.contains('x'),
            enabled_during_gc: flags.contains('g'),
        },
        None => WatchpointSettings::default(),
    }
}

fn cmd_watchpoint(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    match args.first().copied() {
        Some("region") => {
            if args.len() < 3 {
                println!("usage: watchpoint region <address> <size> [rwxg]");
                return Ok(());
            }
            let start = VirtAddr(parse_address(args[1])?);
            let size: u64 = args[2].parse().context("invalid size")?;
            let settings = parse_watch_settings(args.get(3));
            let id = session.set_region_watchpoint(AddressRange::new(start, size), settings)?;
            println!("  watchpoint #{} set on {}", id, AddressRange::new(start, size));
        }
        Some("field") => {
            if args.len() < 3 {
                println!("usage: watchpoint field <object address> <field> [rwxg]");
                return Ok(());
            }
            let origin = VirtAddr(parse_address(args[1])?);
            let object = session
                .find_object_at(origin)?
                .with_context(|| format!("no object at {}", origin))?;
            let settings = parse_watch_settings(args.get(3));
            let id = session.set_object_watchpoint(&object, args[2], settings)?;
            println!("  watchpoint #{} set on {}.{}", id, object, args[2]);
        }
        Some("delete") | Some("d") => {
            let arg = args.get(1).context("missing watchpoint id")?;
            let id = arg.trim_start_matches('#').parse().context("invalid watchpoint id")?;
            let id = WatchpointId(id);
            session.remove_watchpoint(id)?;
            println!("  watchpoint #{} removed", id);
        }
        Some("list") | Some("l") | None => {
            let wps = session.watchpoints()?;
            if wps.is_empty() {
                println!("  no watchpoints set");
            }
            for wp in wps {
                println!("  {}", wp);
            }
        }
        Some(sub) => println!("unknown watchpoint subcommand: {}", sub),
    }
    Ok(())
}

// ── Files ───────────────────────────────────────────────────────────

fn cmd_core(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let Some(path) = args.first() else {
        println!("usage: core <output file>");
        return Ok(());
    };
    session.write_core(Path::new(path))?;
    println!("  core written to {}", path.green());
    Ok(())
}

fn cmd_source(session: &Session, path: &Path) -> anyhow::Result<()> {
    let report = commands::execute_file(session, path)?;
    for (line, id) in &report.breakpoints {
        println!("  line {}: breakpoint #{}", line, id);
    }
    for error in &report.errors {
        eprintln!("  {}: {}", "error".red(), error);
    }
    if !report.ignored.is_empty() {
        println!("  {} unknown command(s) ignored", report.ignored.len());
    }
    Ok(())
}

fn cmd_help() {
    println!("{}", "Execution:".bold());
    println!("  continue, c [&]             Resume; '&' returns to the prompt");
    println!("  pause                       Stop a running VM");
    println!("  stepi, si [thread]          Single instruction step");
    println!("  next, n [thread]            Step over calls");
    println!("  finish, fin [thread]        Run until the top frame returns");
    println!("  until, u <addr>             Run to an address");
    println!("  refresh                     Re-read VM state");
    println!("  kill                        Terminate the VM");
    println!("{}", "State:".bold());
    println!("  state, info                 Show the latest state");
    println!("  threads, thr                List threads");
    println!("  backtrace, bt [thread]      Show stack frames");
    println!("  frame, f <thread> <index>   Show frame slots");
    println!("  register, reg [thread]      Show registers");
    println!("{}", "Memory and code:".bold());
    println!("  memory, x <addr> [len]      Hex dump");
    println!("  memory regions              List memory regions");
    println!("  memory status <addr>        Classify an address");
    println!("  disassemble, d [addr] [n]   Disassemble");
    println!("  code <addr>                 Find compiled code or stack frame");
    println!("{}", "Heap:".bold());
    println!("  object, o <addr> [field|i]  Inspect an object");
    println!("  classes [filter]            List loaded classes");
    println!("  class <name>                Show a class");
    println!("  refs                        Reference statistics");
    println!("{}", "Breakpoints:".bold());
    println!("  breakpoint set <loc> [if <cond>]");
    println!("  breakpoint delete|enable|disable <id>");
    println!("  breakpoint cond <id> [cond]");
    println!("  breakpoint list");
    println!("  watchpoint region <addr> <size> [rwxg]");
    println!("  watchpoint field <addr> <field> [rwxg]");
    println!("  watchpoint delete <id> | list");
    println!("{}", "Files:".bold());
    println!("  core <file>                 Write a core file");
    println!("  source <file>               Run a command file");
    println!("  quit, q");
}

fn print_hexdump(base: VirtAddr, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = base.addr() + (i * 16) as u64;
        print!("  {:016x}  ", addr);
        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                print!(" ");
            }
            print!("{:02x} ", byte);
        }
        for j in chunk.len()..16 {
            if j == 8 {
                print!(" ");
            }
            print!("   ");
        }
        print!(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                print!("{}", *byte as char);
            } else {
                print!(".");
            }
        }
        println!("|");
    }
}

fn parse_address(s: &str) -> anyhow::Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("invalid address '{}': {}", s, e))
}

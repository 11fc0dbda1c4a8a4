//! GDB Remote Serial Protocol (RSP), client side.
//!
//! Packet framing, escaping and run-length decoding, hex helpers, stop-reply
//! parsing and the x86_64 `g` packet layout used by the remote backend.
//!
//! Protocol reference: https://sourceware.org/gdb/onlinedocs/gdb/Remote-Protocol.html

use std::collections::VecDeque;
use std::io::{Read, Write};

use tracing::trace;

use crate::channel::AccessKind;
use crate::error::{Error, Result};
use crate::registers::RegisterSet;

pub const SIGINT: u8 = 2;
pub const SIGTRAP: u8 = 5;

/// Byte sent outside any packet to interrupt a running target.
pub const INTERRUPT: u8 = 0x03;

const MAX_RETRANSMITS: usize = 3;

// ── Packet encoding/decoding ────────────────────────────────────────

/// Calculate the GDB RSP checksum for a payload.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Encode a payload into a packet: `$<escaped data>#<checksum>`.
pub fn encode_packet(data: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len());
    for &b in data.as_bytes() {
        if matches!(b, b'$' | b'#' | b'}' | b'*') {
            body.push(b'}');
            body.push(b ^ 0x20);
        } else {
            body.push(b);
        }
    }
    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(&body);
    packet.extend_from_slice(format!("#{:02x}", checksum(&body)).as_bytes());
    packet
}

/// Undo `}` escaping and `*` run-length encoding of a received packet body.
pub fn unescape(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'}' => {
                let b = body
                    .get(i + 1)
                    .ok_or_else(|| Error::Protocol("dangling escape in packet".into()))?;
                out.push(b ^ 0x20);
                i += 2;
            }
            b'*' => {
                let prev = *out
                    .last()
                    .ok_or_else(|| Error::Protocol("run-length marker at packet start".into()))?;
                let count = body
                    .get(i + 1)
                    .ok_or_else(|| Error::Protocol("truncated run-length marker".into()))?;
                let repeat = count
                    .checked_sub(29)
                    .ok_or_else(|| Error::Protocol("bad run-length count".into()))?;
                out.extend(std::iter::repeat(prev).take(repeat as usize));
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Encode bytes as a hex string.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string into bytes.
pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let s = std::str::from_utf8(chunk).ok()?;
        let b = u8::from_str_radix(s, 16).ok()?;
        bytes.push(b);
    }
    Some(bytes)
}

/// Parse a hex number from a string.
pub fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s, 16).ok()
}

/// `size` low bytes of `value`, little-endian, as hex.
pub fn le_hex(value: u64, size: usize) -> String {
    bytes_to_hex(&value.to_le_bytes()[..size.min(8)])
}

/// Parse little-endian hex bytes into a number.
pub fn parse_le_hex(hex: &str) -> Option<u64> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

// ── Connection ──────────────────────────────────────────────────────

/// A packet stream with acknowledgements.
pub struct Connection<S> {
    stream: S,
    pending: VecDeque<u8>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            pending: VecDeque::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    fn next_byte(&mut self) -> Result<u8> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(b);
        }
        let mut buf = [0u8; 4096];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Err(Error::Protocol("connection closed by remote stub".into()));
        }
        self.pending.extend(&buf[..n]);
        self.pending
            .pop_front()
            .ok_or_else(|| Error::Protocol("empty read".into()))
    }

    /// Send one packet and wait for its acknowledgement.
    pub fn send(&mut self, payload: &str) -> Result<()> {
        let packet = encode_packet(payload);
        for _ in 0..MAX_RETRANSMITS {
            trace!(payload, "rsp ->");
            self.stream.write_all(&packet)?;
            self.stream.flush()?;
            match self.next_byte()? {
                b'+' => return Ok(()),
                b'-' => continue,
                other => {
                    // the stub answered without an ack
                    self.pending.push_front(other);
                    return Ok(());
                }
            }
        }
        Err(Error::Protocol(format!("packet '{}' rejected {} times", payload, MAX_RETRANSMITS)))
    }

    /// Read the next packet, acknowledging it. Bytes outside packets are skipped.
    pub fn receive(&mut self) -> Result<String> {
        loop {
            if self.next_byte()? != b'$' {
                continue;
            }
            let mut body = Vec::new();
            loop {
                match self.next_byte()? {
                    b'#' => break,
                    b => body.push(b),
                }
            }
            let digits = [self.next_byte()?, self.next_byte()?];
            let expected = std::str::from_utf8(&digits)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            if expected != Some(checksum(&body)) {
                self.stream.write_all(b"-")?;
                self.stream.flush()?;
                continue;
            }
            self.stream.write_all(b"+")?;
            self.stream.flush()?;
            let payload = String::from_utf8(unescape(&body)?)
                .map_err(|_| Error::Protocol("packet is not valid UTF-8".into()))?;
            trace!(payload = %payload, "rsp <-");
            return Ok(payload);
        }
    }

    pub fn request(&mut self, payload: &str) -> Result<String> {
        self.send(payload)?;
        self.receive()
    }

    /// Send raw bytes outside packet framing.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }
}

// ── Stop replies ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    Signal {
        signal: u8,
        thread: Option<u64>,
        watch: Option<(AccessKind, u64)>,
        /// The stub reported a software breakpoint (`swbreak`).
        breakpoint: bool,
    },
    Exited { code: u8 },
    Terminated { signal: u8 },
    /// Console output (`O` packet) sent while the target runs.
    Output(String),
}

/// Thread id from `tid` or multiprocess `p<pid>.<tid>` syntax.
pub fn parse_thread_id(s: &str) -> Option<u64> {
    let s = s.strip_prefix('p').unwrap_or(s);
    let tid = s.rsplit('.').next()?;
    if tid == "-1" || tid == "0" {
        return None;
    }
    parse_hex(tid)
}

fn parse_signal(s: &str) -> Result<u8> {
    s.get(..2)
        .and_then(|h| u8::from_str_radix(h, 16).ok())
        .ok_or_else(|| Error::Protocol(format!("bad stop reply '{}'", s)))
}

pub fn parse_stop_reply(reply: &str) -> Result<StopReply> {
    let (kind, rest) = reply.split_at(reply.len().min(1));
    match kind {
        "S" => Ok(StopReply::Signal {
            signal: parse_signal(rest)?,
            thread: None,
            watch: None,
            breakpoint: false,
        }),
        "T" => {
            let signal = parse_signal(rest)?;
            let mut thread = None;
            let mut watch = None;
            let mut breakpoint = false;
            for pair in rest[2..].split(';').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once(':').unwrap_or((pair, ""));
                match key {
                    "thread" => thread = parse_thread_id(value),
                    "watch" => watch = parse_hex(value).map(|a| (AccessKind::Write, a)),
                    "rwatch" => watch = parse_hex(value).map(|a| (AccessKind::Read, a)),
                    "awatch" => watch = parse_hex(value).map(|a| (AccessKind::Unknown, a)),
                    "swbreak" => breakpoint = true,
                    _ => {}
                }
            }
            Ok(StopReply::Signal {
                signal,
                thread,
                watch,
                breakpoint,
            })
        }
        "W" => Ok(StopReply::Exited {
            code: parse_signal(rest)?,
        }),
        "X" => Ok(StopReply::Terminated {
            signal: parse_signal(rest)?,
        }),
        "O" => {
            let bytes = hex_to_bytes(rest).unwrap_or_default();
            Ok(StopReply::Output(String::from_utf8_lossy(&bytes).into_owned()))
        }
        "E" => Err(Error::Protocol(format!("remote stub error {}", reply))),
        _ => Err(Error::Protocol(format!("unexpected stop reply '{}'", reply))),
    }
}

/// Parse a `qfThreadInfo` / `qsThreadInfo` reply. Returns the ids and
/// whether more follow.
pub fn parse_thread_list(reply: &str) -> Result<(Vec<u64>, bool)> {
    if reply == "l" {
        return Ok((Vec::new(), false));
    }
    let list = reply
        .strip_prefix('m')
        .ok_or_else(|| Error::Protocol(format!("bad thread list reply '{}'", reply)))?;
    let ids = list.split(',').filter_map(parse_thread_id).collect();
    Ok((ids, true))
}

// ── Registers ───────────────────────────────────────────────────────

/// x86_64 register order and byte widths of the `g` packet.
pub const GDB_X86_64_REGS: [(&str, usize); 24] = [
    ("rax", 8), ("rbx", 8), ("rcx", 8), ("rdx", 8),
    ("rsi", 8), ("rdi", 8), ("rbp", 8), ("rsp", 8),
    ("r8", 8), ("r9", 8), ("r10", 8), ("r11", 8),
    ("r12", 8), ("r13", 8), ("r14", 8), ("r15", 8),
    ("rip", 8), ("eflags", 4), ("cs", 4), ("ss", 4),
    ("ds", 4), ("es", 4), ("fs", 4), ("gs", 4),
];

/// General purpose registers plus rip; stubs must send at least these.
const REQUIRED_REGS: usize = 17;

/// Decode a `g` reply. Unavailable registers (`xx..`) read as zero and
/// trailing floating-point state is ignored.
pub fn registers_from_g(hex: &str) -> Result<RegisterSet> {
    let mut set = RegisterSet::new();
    let mut offset = 0;
    for (index, (name, size)) in GDB_X86_64_REGS.iter().enumerate() {
        let Some(field) = hex.get(offset..offset + size * 2) else {
            if index < REQUIRED_REGS {
                return Err(Error::Protocol(format!(
                    "register packet too short ({} chars)",
                    hex.len()
                )));
            }
            break;
        };
        offset += size * 2;
        if field.contains('x') {
            continue;
        }
        let value = parse_le_hex(field)
            .ok_or_else(|| Error::Protocol(format!("bad register value for {}", name)))?;
        set.set(name, value)?;
    }
    Ok(set)
}

/// Encode a register set as a `G` packet payload body.
pub fn registers_to_g(set: &RegisterSet) -> Result<String> {
    let mut out = String::new();
    for (name, size) in GDB_X86_64_REGS {
        out.push_str(&le_hex(set.get(name)?, size));
    }
    Ok(out)
}

/// `P` packet writing one register.
pub fn register_write_packet(name: &str, value: u64) -> Result<String> {
    let (index, (_, size)) = GDB_X86_64_REGS
        .iter()
        .enumerate()
        .find(|(_, (n, _))| *n == name)
        .ok_or_else(|| Error::Register(format!("register {} not in remote layout", name)))?;
    Ok(format!("P{:x}={}", index, le_hex(value, *size)))
}

pub fn memory_read_packet(addr: u64, len: usize) -> String {
    format!("m{:x},{:x}", addr, len)
}

pub fn memory_write_packet(addr: u64, data: &[u8]) -> String {
    format!("M{:x},{:x}:{}", addr, data.len(), bytes_to_hex(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, records writes.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn duplex(input: &[u8]) -> Connection<Duplex> {
        Connection::new(Duplex {
            input: Cursor::new(input.to_vec()),
            output: Vec::new(),
        })
    }

    #[test]
    fn checksum_basic() {
        assert_eq!(checksum(b"OK"), b'O'.wrapping_add(b'K'));
        assert_eq!(encode_packet("OK"), b"$OK#9a");
    }

    #[test]
    fn special_bytes_are_escaped() {
        let packet = encode_packet("a#b");
        assert_eq!(&packet[..5], b"$a}\x03b");
        assert_eq!(unescape(b"a}\x03b").unwrap(), b"a#b");
    }

    #[test]
    fn run_length_decoding() {
        // '0' followed by 3 more: count byte is 3 + 29 = ' '
        assert_eq!(unescape(b"0* ").unwrap(), b"0000");
        assert!(unescape(b"*!").is_err());
    }

    #[test]
    fn receive_acks_and_skips_noise() {
        let mut conn = duplex(b"+$S05#b8");
        assert_eq!(conn.receive().unwrap(), "S05");
        assert_eq!(conn.get_ref().output, b"+");
    }

    #[test]
    fn receive_nacks_bad_checksum_then_accepts_resend() {
        let mut conn = duplex(b"$OK#00$OK#9a");
        assert_eq!(conn.receive().unwrap(), "OK");
        assert_eq!(conn.get_ref().output, b"-+");
    }

    #[test]
    fn send_retransmits_on_nack() {
        let mut conn = duplex(b"-+");
        conn.send("g").unwrap();
        assert_eq!(conn.get_ref().output, b"$g#67$g#67");
    }

    #[test]
    fn request_without_ack_keeps_reply() {
        let mut conn = duplex(b"$OK#9a");
        assert_eq!(conn.request("D").unwrap(), "OK");
    }

    #[test]
    fn closed_stream_is_protocol_error() {
        let mut conn = duplex(b"$O");
        assert!(matches!(conn.receive(), Err(Error::Protocol(_))));
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(bytes_to_hex(&[0xde, 0xad]), "dead");
        assert!(hex_to_bytes("abc").is_none());
        assert_eq!(parse_hex("401000"), Some(0x401000));
        assert_eq!(le_hex(0x1122, 4), "22110000");
        assert_eq!(parse_le_hex("22110000"), Some(0x1122));
    }

    #[test]
    fn stop_replies() {
        assert_eq!(
            parse_stop_reply("S05").unwrap(),
            StopReply::Signal { signal: 5, thread: None, watch: None, breakpoint: false }
        );
        assert_eq!(
            parse_stop_reply("T05thread:p1f.2a;watch:7f001000;").unwrap(),
            StopReply::Signal {
                signal: 5,
                thread: Some(0x2a),
                watch: Some((AccessKind::Write, 0x7f001000)),
                breakpoint: false
            }
        );
        match parse_stop_reply("T05rwatch:10;thread:3;").unwrap() {
            StopReply::Signal { watch, thread, .. } => {
                assert_eq!(watch, Some((AccessKind::Read, 0x10)));
                assert_eq!(thread, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_stop_reply("T05awatch:20;swbreak:;").unwrap() {
            StopReply::Signal { watch, breakpoint, .. } => {
                assert_eq!(watch, Some((AccessKind::Unknown, 0x20)));
                assert!(breakpoint);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_stop_reply("W00").unwrap(), StopReply::Exited { code: 0 });
        assert_eq!(parse_stop_reply("X09").unwrap(), StopReply::Terminated { signal: 9 });
        assert_eq!(parse_stop_reply("O6869").unwrap(), StopReply::Output("hi".into()));
        assert!(parse_stop_reply("E01").is_err());
        assert!(parse_stop_reply("").is_err());
    }

    #[test]
    fn thread_lists() {
        assert_eq!(parse_thread_list("m1a,p1.1b").unwrap(), (vec![0x1a, 0x1b], true));
        assert_eq!(parse_thread_list("l").unwrap(), (vec![], false));
        assert!(parse_thread_list("E01").is_err());
    }

    #[test]
    fn g_packet_layout() {
        let mut set = RegisterSet::new();
        set.set("rax", 1).unwrap();
        set.set("rip", 0x401000).unwrap();
        set.set("eflags", 0x246).unwrap();
        set.set("gs", 0x2b).unwrap();
        let hex = registers_to_g(&set).unwrap();
        assert_eq!(hex.len(), (17 * 8 + 7 * 4) * 2);
        assert!(hex.starts_with("0100000000000000"));

        // trailing FP state is ignored
        let decoded = registers_from_g(&format!("{}{}", hex, "00".repeat(16))).unwrap();
        assert_eq!(decoded.get("rip").unwrap(), 0x401000);
        assert_eq!(decoded.get("rflags").unwrap(), 0x246);
        assert_eq!(decoded.get("gs").unwrap(), 0x2b);
    }

    #[test]
    fn g_packet_unavailable_and_short() {
        let mut hex = "x".repeat(16);
        hex.push_str(&"00".repeat(16 * 8));
        let decoded = registers_from_g(&hex).unwrap();
        assert_eq!(decoded.get("rax").unwrap(), 0);
        assert!(matches!(registers_from_g("0011"), Err(Error::Protocol(_))));
    }

    #[test]
    fn request_packets() {
        assert_eq!(register_write_packet("rip", 0x1000).unwrap(), "P10=0010000000000000");
        assert!(register_write_packet("orig_rax", 0).is_err());
        assert_eq!(memory_read_packet(0x1000, 16), "m1000,10");
        assert_eq!(memory_write_packet(0x1000, &[0xcc]), "M1000,1:cc");
    }
}

//! x86_64 disassembly of compiled code using iced-x86.
//!
//! Used to list a compilation's instructions and by step-over, which needs
//! to know whether the instruction at the IP is a call and how long it is.

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, FormatterOutput, FormatterTextKind,
    GasFormatter, Instruction, IntelFormatter,
};

use crate::types::VirtAddr;

/// Longest x86_64 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Disassembly output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisasmStyle {
    /// Intel syntax (e.g., `mov rax, [rbx+8]`)
    #[default]
    Intel,
    /// AT&T / GAS syntax (e.g., `movq 8(%rbx), %rax`)
    Gas,
}

/// A single disassembled instruction.
#[derive(Debug, Clone)]
pub struct DisasmInstruction {
    pub addr: VirtAddr,
    pub bytes: Vec<u8>,
    /// Formatted mnemonic + operands.
    pub text: String,
    pub len: usize,
    pub is_call: bool,
}

/// Disassemble up to `count` instructions from `code`, whose first byte is at `base_addr`.
pub fn disassemble(
    code: &[u8],
    base_addr: VirtAddr,
    count: usize,
    style: DisasmStyle,
) -> Vec<DisasmInstruction> {
    let mut decoder = Decoder::with_ip(64, code, base_addr.addr(), DecoderOptions::NONE);
    let mut results = Vec::new();
    let mut output = FormatterOutputBuffer::default();
    let mut intel = IntelFormatter::new();
    let mut gas = GasFormatter::new();

    while decoder.can_decode() && results.len() < count {
        let mut insn = Instruction::default();
        decoder.decode_out(&mut insn);

        output.text.clear();
        match style {
            DisasmStyle::Intel => intel.format(&insn, &mut output),
            DisasmStyle::Gas => gas.format(&insn, &mut output),
        }

        let start = (insn.ip() - base_addr.addr()) as usize;
        results.push(DisasmInstruction {
            addr: VirtAddr(insn.ip()),
            bytes: code[start..start + insn.len()].to_vec(),
            text: output.text.clone(),
            len: insn.len(),
            is_call: is_call_flow(&insn),
        });
    }

    results
}

fn is_call_flow(insn: &Instruction) -> bool {
    matches!(
        insn.flow_control(),
        FlowControl::Call | FlowControl::IndirectCall
    )
}

/// Decode the first instruction of `code`; `None` if the bytes are not a valid instruction.
pub fn decode_one(code: &[u8], addr: VirtAddr) -> Option<DisasmInstruction> {
    let mut decoder = Decoder::with_ip(64, code, addr.addr(), DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let insn = decoder.decode();
    if insn.is_invalid() {
        return None;
    }
    Some(DisasmInstruction {
        addr,
        bytes: code[..insn.len()].to_vec(),
        text: String::new(),
        len: insn.len(),
        is_call: is_call_flow(&insn),
    })
}

/// Format disassembly output, marking the instruction at `current` if given.
pub fn format_disassembly(instructions: &[DisasmInstruction], current: Option<VirtAddr>) -> String {
    let mut out = String::new();
    for insn in instructions {
        let marker = if Some(insn.addr) == current { "=>" } else { "  " };
        out.push_str(&format!("{}{:016x}  ", marker, insn.addr.addr()));

        let mut bytes_str = String::new();
        for b in &insn.bytes {
            bytes_str.push_str(&format!("{:02x} ", b));
        }
        out.push_str(&format!("{:<30} ", bytes_str.trim_end()));

        out.push_str(&insn.text);
        out.push('\n');
    }
    out
}

#[derive(Default)]
struct FormatterOutputBuffer {
    text: String,
}

impl FormatterOutput for FormatterOutputBuffer {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}

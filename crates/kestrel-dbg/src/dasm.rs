//! Table-driven 8086/80286 disassembler for the `u` and `dh` commands.
//!
//! One entry per opcode with a mnemonic and an operand template; the renderer
//! interprets the template codes (`Eb`, `Gv`, `Iw`, …) against the ModR/M
//! byte and trailing immediates. 16-bit addressing only, which is all the
//! 286 has.

/// Longest encodable 286 instruction (prefixes included).
pub const MAX_OP_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub len: usize,
    pub text: String,
}

#[derive(Clone, Copy)]
struct OpSpec {
    mnem: &'static str,
    args: &'static str,
}

const fn op(mnem: &'static str, args: &'static str) -> OpSpec {
    OpSpec { mnem, args }
}

const BAD: OpSpec = op("DB", "#");

const REG16: [&str; 8] = ["AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI"];
const REG8: [&str; 8] = ["AL", "CL", "DL", "BL", "AH", "CH", "DH", "BH"];
const SREG: [&str; 4] = ["ES", "CS", "SS", "DS"];
const RM16: [&str; 8] = [
    "BX+SI", "BX+DI", "BP+SI", "BP+DI", "SI", "DI", "BP", "BX",
];

const GRP1: [&str; 8] = ["ADD", "OR", "ADC", "SBB", "AND", "SUB", "XOR", "CMP"];
const GRP2: [&str; 8] = ["ROL", "ROR", "RCL", "RCR", "SHL", "SHR", "SHL", "SAR"];
const GRP3: [&str; 8] = ["TEST", "???", "NOT", "NEG", "MUL", "IMUL", "DIV", "IDIV"];
const GRP4: [&str; 8] = ["INC", "DEC", "???", "???", "???", "???", "???", "???"];
const GRP5: [&str; 8] = ["INC", "DEC", "CALL", "CALLF", "JMP", "JMPF", "PUSH", "???"];
const GRP6: [&str; 8] = ["SLDT", "STR", "LLDT", "LTR", "VERR", "VERW", "???", "???"];
const GRP7: [&str; 8] = ["SGDT", "SIDT", "LGDT", "LIDT", "SMSW", "???", "LMSW", "???"];

#[rustfmt::skip]
static ONE_BYTE: [OpSpec; 256] = [
    /* 00 */ op("ADD", "Eb,Gb"), op("ADD", "Ev,Gv"), op("ADD", "Gb,Eb"), op("ADD", "Gv,Ev"),
    /* 04 */ op("ADD", "AL,Ib"), op("ADD", "AX,Iv"), op("PUSH", "ES"),   op("POP", "ES"),
    /* 08 */ op("OR", "Eb,Gb"),  op("OR", "Ev,Gv"),  op("OR", "Gb,Eb"),  op("OR", "Gv,Ev"),
    /* 0C */ op("OR", "AL,Ib"),  op("OR", "AX,Iv"),  op("PUSH", "CS"),   op("ESC0F", ""),
    /* 10 */ op("ADC", "Eb,Gb"), op("ADC", "Ev,Gv"), op("ADC", "Gb,Eb"), op("ADC", "Gv,Ev"),
    /* 14 */ op("ADC", "AL,Ib"), op("ADC", "AX,Iv"), op("PUSH", "SS"),   op("POP", "SS"),
    /* 18 */ op("SBB", "Eb,Gb"), op("SBB", "Ev,Gv"), op("SBB", "Gb,Eb"), op("SBB", "Gv,Ev"),
    /* 1C */ op("SBB", "AL,Ib"), op("SBB", "AX,Iv"), op("PUSH", "DS"),   op("POP", "DS"),
    /* 20 */ op("AND", "Eb,Gb"), op("AND", "Ev,Gv"), op("AND", "Gb,Eb"), op("AND", "Gv,Ev"),
    /* 24 */ op("AND", "AL,Ib"), op("AND", "AX,Iv"), op("SEG", "ES"),    op("DAA", ""),
    /* 28 */ op("SUB", "Eb,Gb"), op("SUB", "Ev,Gv"), op("SUB", "Gb,Eb"), op("SUB", "Gv,Ev"),
    /* 2C */ op("SUB", "AL,Ib"), op("SUB", "AX,Iv"), op("SEG", "CS"),    op("DAS", ""),
    /* 30 */ op("XOR", "Eb,Gb"), op("XOR", "Ev,Gv"), op("XOR", "Gb,Eb"), op("XOR", "Gv,Ev"),
    /* 34 */ op("XOR", "AL,Ib"), op("XOR", "AX,Iv"), op("SEG", "SS"),    op("AAA", ""),
    /* 38 */ op("CMP", "Eb,Gb"), op("CMP", "Ev,Gv"), op("CMP", "Gb,Eb"), op("CMP", "Gv,Ev"),
    /* 3C */ op("CMP", "AL,Ib"), op("CMP", "AX,Iv"), op("SEG", "DS"),    op("AAS", ""),
    /* 40 */ op("INC", "AX"), op("INC", "CX"), op("INC", "DX"), op("INC", "BX"),
    /* 44 */ op("INC", "SP"), op("INC", "BP"), op("INC", "SI"), op("INC", "DI"),
    /* 48 */ op("DEC", "AX"), op("DEC", "CX"), op("DEC", "DX"), op("DEC", "BX"),
    /* 4C */ op("DEC", "SP"), op("DEC", "BP"), op("DEC", "SI"), op("DEC", "DI"),
    /* 50 */ op("PUSH", "AX"), op("PUSH", "CX"), op("PUSH", "DX"), op("PUSH", "BX"),
    /* 54 */ op("PUSH", "SP"), op("PUSH", "BP"), op("PUSH", "SI"), op("PUSH", "DI"),
    /* 58 */ op("POP", "AX"), op("POP", "CX"), op("POP", "DX"), op("POP", "BX"),
    /* 5C */ op("POP", "SP"), op("POP", "BP"), op("POP", "SI"), op("POP", "DI"),
    /* 60 */ op("PUSHA", ""), op("POPA", ""), op("BOUND", "Gv,Ev"), op("ARPL", "Ev,Gv"),
    /* 64 */ BAD, BAD, BAD, BAD,
    /* 68 */ op("PUSH", "Iv"), op("IMUL", "Gv,Ev,Iv"), op("PUSH", "Ibs"), op("IMUL", "Gv,Ev,Ibs"),
    /* 6C */ op("INSB", ""), op("INSW", ""), op("OUTSB", ""), op("OUTSW", ""),
    /* 70 */ op("JO", "Jb"),  op("JNO", "Jb"), op("JB", "Jb"),  op("JNB", "Jb"),
    /* 74 */ op("JZ", "Jb"),  op("JNZ", "Jb"), op("JBE", "Jb"), op("JA", "Jb"),
    /* 78 */ op("JS", "Jb"),  op("JNS", "Jb"), op("JP", "Jb"),  op("JNP", "Jb"),
    /* 7C */ op("JL", "Jb"),  op("JGE", "Jb"), op("JLE", "Jb"), op("JG", "Jb"),
    /* 80 */ op("GRP1", "Eb,Ib"), op("GRP1", "Ev,Iv"), op("GRP1", "Eb,Ib"), op("GRP1", "Ev,Ibs"),
    /* 84 */ op("TEST", "Eb,Gb"), op("TEST", "Ev,Gv"), op("XCHG", "Eb,Gb"), op("XCHG", "Ev,Gv"),
    /* 88 */ op("MOV", "Eb,Gb"),  op("MOV", "Ev,Gv"),  op("MOV", "Gb,Eb"),  op("MOV", "Gv,Ev"),
    /* 8C */ op("MOV", "Ev,Sw"),  op("LEA", "Gv,M"),   op("MOV", "Sw,Ev"),  op("POP", "Ev"),
    /* 90 */ op("NOP", ""), op("XCHG", "AX,CX"), op("XCHG", "AX,DX"), op("XCHG", "AX,BX"),
    /* 94 */ op("XCHG", "AX,SP"), op("XCHG", "AX,BP"), op("XCHG", "AX,SI"), op("XCHG", "AX,DI"),
    /* 98 */ op("CBW", ""), op("CWD", ""), op("CALLF", "Ap"), op("WAIT", ""),
    /* 9C */ op("PUSHF", ""), op("POPF", ""), op("SAHF", ""), op("LAHF", ""),
    /* A0 */ op("MOV", "AL,Ob"), op("MOV", "AX,Ov"), op("MOV", "Ob,AL"), op("MOV", "Ov,AX"),
    /* A4 */ op("MOVSB", ""), op("MOVSW", ""), op("CMPSB", ""), op("CMPSW", ""),
    /* A8 */ op("TEST", "AL,Ib"), op("TEST", "AX,Iv"), op("STOSB", ""), op("STOSW", ""),
    /* AC */ op("LODSB", ""), op("LODSW", ""), op("SCASB", ""), op("SCASW", ""),
    /* B0 */ op("MOV", "AL,Ib"), op("MOV", "CL,Ib"), op("MOV", "DL,Ib"), op("MOV", "BL,Ib"),
    /* B4 */ op("MOV", "AH,Ib"), op("MOV", "CH,Ib"), op("MOV", "DH,Ib"), op("MOV", "BH,Ib"),
    /* B8 */ op("MOV", "AX,Iv"), op("MOV", "CX,Iv"), op("MOV", "DX,Iv"), op("MOV", "BX,Iv"),
    /* BC */ op("MOV", "SP,Iv"), op("MOV", "BP,Iv"), op("MOV", "SI,Iv"), op("MOV", "DI,Iv"),
    /* C0 */ op("GRP2", "Eb,Ib"), op("GRP2", "Ev,Ib"), op("RET", "Iw"), op("RET", ""),
    /* C4 */ op("LES", "Gv,M"), op("LDS", "Gv,M"), op("MOV", "Eb,Ib"), op("MOV", "Ev,Iv"),
    /* C8 */ op("ENTER", "Iw,Ib"), op("LEAVE", ""), op("RETF", "Iw"), op("RETF", ""),
    /* CC */ op("INT3", ""), op("INT", "Ib"), op("INTO", ""), op("IRET", ""),
    /* D0 */ op("GRP2", "Eb,1"), op("GRP2", "Ev,1"), op("GRP2", "Eb,CL"), op("GRP2", "Ev,CL"),
    /* D4 */ op("AAM", "Ib"), op("AAD", "Ib"), BAD, op("XLAT", ""),
    /* D8 */ op("ESC", "Ev"), op("ESC", "Ev"), op("ESC", "Ev"), op("ESC", "Ev"),
    /* DC */ op("ESC", "Ev"), op("ESC", "Ev"), op("ESC", "Ev"), op("ESC", "Ev"),
    /* E0 */ op("LOOPNZ", "Jb"), op("LOOPZ", "Jb"), op("LOOP", "Jb"), op("JCXZ", "Jb"),
    /* E4 */ op("IN", "AL,Ib"), op("IN", "AX,Ib"), op("OUT", "Ib,AL"), op("OUT", "Ib,AX"),
    /* E8 */ op("CALL", "Jv"), op("JMP", "Jv"), op("JMPF", "Ap"), op("JMP", "Jb"),
    /* EC */ op("IN", "AL,DX"), op("IN", "AX,DX"), op("OUT", "DX,AL"), op("OUT", "DX,AX"),
    /* F0 */ op("LOCK", ""), BAD, op("REPNZ", ""), op("REPZ", ""),
    /* F4 */ op("HLT", ""), op("CMC", ""), op("GRP3", "Eb"), op("GRP3", "Ev"),
    /* F8 */ op("CLC", ""), op("STC", ""), op("CLI", ""), op("STI", ""),
    /* FC */ op("CLD", ""), op("STD", ""), op("GRP4", "Eb"), op("GRP5", "Ev"),
];

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Some(u16::from(lo) | (u16::from(hi) << 8))
    }
}

struct ModRm {
    raw: u8,
    text: String,
}

impl ModRm {
    fn reg(&self) -> usize {
        usize::from((self.raw >> 3) & 7)
    }
}

fn fetch_modrm(r: &mut Reader<'_>, word: bool, seg: Option<&str>) -> Option<ModRm> {
    let raw = r.u8()?;
    let md = raw >> 6;
    let rm = usize::from(raw & 7);
    let seg_prefix = seg.map(|s| format!("{s}:")).unwrap_or_default();
    let text = match md {
        3 => {
            if word {
                REG16[rm].to_owned()
            } else {
                REG8[rm].to_owned()
            }
        }
        0 if rm == 6 => format!("{seg_prefix}[{:04X}]", r.u16()?),
        0 => format!("{seg_prefix}[{}]", RM16[rm]),
        1 => {
            let disp = r.u8()? as i8;
            let sign = if disp < 0 { '-' } else { '+' };
            format!("{seg_prefix}[{}{}{:02X}]", RM16[rm], sign, disp.unsigned_abs())
        }
        _ => format!("{seg_prefix}[{}+{:04X}]", RM16[rm], r.u16()?),
    };
    Some(ModRm { raw, text })
}

/// Disassembles one instruction at `addr`. Undecodable bytes come back as a
/// one-byte `DB`.
pub fn disassemble(bytes: &[u8], addr: u32) -> Decoded {
    decode(bytes, addr).unwrap_or_else(|| Decoded {
        len: 1,
        text: format!("DB {:02X}", bytes.first().copied().unwrap_or(0)),
    })
}

fn decode(bytes: &[u8], addr: u32) -> Option<Decoded> {
    let mut r = Reader { bytes, pos: 0 };
    let mut seg: Option<&str> = None;
    let mut rep: Option<&str> = None;

    let spec = loop {
        if r.pos >= MAX_OP_LEN {
            return None;
        }
        let opcode = r.u8()?;
        let spec = ONE_BYTE[usize::from(opcode)];
        match spec.mnem {
            "SEG" => seg = Some(spec.args),
            "LOCK" | "REPNZ" | "REPZ" => rep = Some(spec.mnem),
            "ESC0F" => break two_byte(r.u8()?)?,
            "DB" => return None,
            _ => break spec,
        }
    };

    // Group opcodes take their mnemonic from ModR/M.reg; fetch it up front so
    // the operand renderer can reuse it.
    let word = !spec.args.contains("Eb");
    let mut modrm: Option<ModRm> = None;
    let mnem: &str = match spec.mnem {
        "GRP1" | "GRP2" | "GRP3" | "GRP4" | "GRP5" | "GRP6" | "GRP7" => {
            let m = fetch_modrm(&mut r, word, seg)?;
            let table = match spec.mnem {
                "GRP1" => &GRP1,
                "GRP2" => &GRP2,
                "GRP3" => &GRP3,
                "GRP4" => &GRP4,
                "GRP5" => &GRP5,
                "GRP6" => &GRP6,
                _ => &GRP7,
            };
            let m_name = table[m.reg()];
            modrm = Some(m);
            m_name
        }
        m => m,
    };
    if mnem == "???" {
        return None;
    }

    let mut rendered = Vec::new();
    if !spec.args.is_empty() {
        for code in spec.args.split(',') {
            let text = match code {
                "Eb" | "Ev" | "M" => {
                    let word = code != "Eb";
                    let m = match modrm.take() {
                        Some(m) => m,
                        None => fetch_modrm(&mut r, word, seg)?,
                    };
                    let text = m.text.clone();
                    modrm = Some(m);
                    text
                }
                "Gb" | "Gv" => {
                    let word = code == "Gv";
                    let m = match modrm.take() {
                        Some(m) => m,
                        None => fetch_modrm(&mut r, word, seg)?,
                    };
                    let reg = if word { REG16[m.reg()] } else { REG8[m.reg()] };
                    modrm = Some(m);
                    reg.to_owned()
                }
                "Sw" => {
                    let m = match modrm.take() {
                        Some(m) => m,
                        None => fetch_modrm(&mut r, true, seg)?,
                    };
                    let sreg = SREG.get(m.reg() & 3).copied().unwrap_or("??");
                    modrm = Some(m);
                    sreg.to_owned()
                }
                "Ib" => format!("{:02X}", r.u8()?),
                "Ibs" => {
                    let v = r.u8()? as i8;
                    let sign = if v < 0 { "-" } else { "+" };
                    format!("{sign}{:02X}", v.unsigned_abs())
                }
                "Iv" | "Iw" => format!("{:04X}", r.u16()?),
                "Jb" => {
                    let disp = r.u8()? as i8;
                    let target = addr
                        .wrapping_add(r.pos as u32)
                        .wrapping_add(disp as u32);
                    format!("{:04X}", target & 0xFFFF)
                }
                "Jv" => {
                    let disp = r.u16()? as i16;
                    let target = addr
                        .wrapping_add(r.pos as u32)
                        .wrapping_add(disp as u32);
                    format!("{:04X}", target & 0xFFFF)
                }
                "Ap" => {
                    let off = r.u16()?;
                    let segm = r.u16()?;
                    format!("{segm:04X}:{off:04X}")
                }
                "Ob" | "Ov" => {
                    let s = seg.unwrap_or("DS");
                    format!("{s}:[{:04X}]", r.u16()?)
                }
                fixed => fixed.to_owned(),
            };
            rendered.push(text);
        }
    }

    let mut text = String::new();
    if let Some(rep) = rep {
        text.push_str(rep);
        text.push(' ');
    }
    text.push_str(mnem);
    if !rendered.is_empty() {
        text.push(' ');
        text.push_str(&rendered.join(","));
    }
    Some(Decoded { len: r.pos, text })
}

fn two_byte(opcode: u8) -> Option<OpSpec> {
    Some(match opcode {
        0x00 => op("GRP6", "Ev"),
        0x01 => op("GRP7", "Ev"),
        0x02 => op("LAR", "Gv,Ev"),
        0x03 => op("LSL", "Gv,Ev"),
        0x06 => op("CLTS", ""),
        _ => return None,
    })
}

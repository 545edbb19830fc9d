use serde::{Deserialize, Serialize};

use crate::segment::{SegRole, SegmentRegister, SegmentState};
use crate::segmentation::SegId;

// Flag bits (80286 FLAGS register).
pub const FLAG_CF: u16 = 1 << 0;
pub const FLAG_ALWAYS_ON: u16 = 1 << 1;
pub const FLAG_PF: u16 = 1 << 2;
pub const FLAG_AF: u16 = 1 << 4;
pub const FLAG_ZF: u16 = 1 << 6;
pub const FLAG_SF: u16 = 1 << 7;
pub const FLAG_TF: u16 = 1 << 8;
pub const FLAG_IF: u16 = 1 << 9;
pub const FLAG_DF: u16 = 1 << 10;
pub const FLAG_OF: u16 = 1 << 11;
pub const FLAG_IOPL: u16 = 3 << 12;
pub const FLAG_NT: u16 = 1 << 14;

// Machine status word bits.
pub const MSW_PE: u16 = 1 << 0;
pub const MSW_MP: u16 = 1 << 1;
pub const MSW_EM: u16 = 1 << 2;
pub const MSW_TS: u16 = 1 << 3;

/// Which member of the family is being modeled. The 286 is the implemented
/// and tested target; the 386 variant widens descriptor bases/limits and the
/// operand-size defaults where the loader consults it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    C286,
    C386,
}

/// GDTR/IDTR: a bare base/limit pair with no descriptor cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

/// The architectural segment registers, plus a scratch register the debugger
/// uses to resolve `seg:off` addresses without disturbing program state.
pub struct Segments {
    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub ldt: SegmentRegister,
    pub tr: SegmentRegister,
    pub probe: SegmentRegister,
}

impl Segments {
    fn new() -> Self {
        Self {
            es: SegmentRegister::new(SegRole::Data, "ES"),
            cs: SegmentRegister::new(SegRole::Code, "CS"),
            ss: SegmentRegister::new(SegRole::Stack, "SS"),
            ds: SegmentRegister::new(SegRole::Data, "DS"),
            ldt: SegmentRegister::new(SegRole::Ldt, "LDT"),
            tr: SegmentRegister::new(SegRole::Tss, "TR"),
            probe: SegmentRegister::new(SegRole::Other, "DBG"),
        }
    }

    pub fn get(&self, id: SegId) -> &SegmentRegister {
        match id {
            SegId::Es => &self.es,
            SegId::Cs => &self.cs,
            SegId::Ss => &self.ss,
            SegId::Ds => &self.ds,
            SegId::Ldt => &self.ldt,
            SegId::Tr => &self.tr,
            SegId::Probe => &self.probe,
        }
    }

    pub fn get_mut(&mut self, id: SegId) -> &mut SegmentRegister {
        match id {
            SegId::Es => &mut self.es,
            SegId::Cs => &mut self.cs,
            SegId::Ss => &mut self.ss,
            SegId::Ds => &mut self.ds,
            SegId::Ldt => &mut self.ldt,
            SegId::Tr => &mut self.tr,
            SegId::Probe => &mut self.probe,
        }
    }

    fn each_mut(&mut self, mut f: impl FnMut(&mut SegmentRegister)) {
        f(&mut self.es);
        f(&mut self.cs);
        f(&mut self.ss);
        f(&mut self.ds);
        f(&mut self.ldt);
        f(&mut self.tr);
        f(&mut self.probe);
    }
}

/// 80286 architectural state.
pub struct CpuState {
    pub ax: u16,
    pub cx: u16,
    pub dx: u16,
    pub bx: u16,
    pub sp: u16,
    pub bp: u16,
    pub si: u16,
    pub di: u16,
    pub ip: u16,
    pub flags: u16,

    msw: u16,
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub segs: Segments,

    pub halted: bool,
    pub(crate) model: CpuModel,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new(CpuModel::C286)
    }
}

impl CpuState {
    pub fn new(model: CpuModel) -> Self {
        let mut state = Self {
            ax: 0,
            cx: 0,
            dx: 0,
            bx: 0,
            sp: 0,
            bp: 0,
            si: 0,
            di: 0,
            ip: 0xFFF0,
            flags: FLAG_ALWAYS_ON,
            msw: 0,
            gdtr: TableReg::default(),
            idtr: TableReg { base: 0, limit: 0x3FF },
            segs: Segments::new(),
            halted: false,
            model,
        };
        // Power-on: execution starts at F000:FFF0.
        state.segs.cs.load_real(0xF000);
        state
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    pub fn msw(&self) -> u16 {
        self.msw
    }

    pub fn protected(&self) -> bool {
        self.msw & MSW_PE != 0
    }

    /// Updates the machine status word, retargeting every segment register's
    /// dispatch when the PE bit changes. (The 286 cannot clear PE once set,
    /// but the emulator allows it for machine reset.)
    pub fn set_msw(&mut self, value: u16) {
        let was = self.protected();
        self.msw = value;
        let now = self.msw & MSW_PE != 0;
        if was != now {
            let model = self.model;
            self.segs.each_mut(|seg| seg.set_protected(now, model));
        }
    }

    pub fn set_ts(&mut self) {
        self.msw |= MSW_TS;
    }

    /// Current privilege level: the CS cache's CPL.
    pub fn cpl(&self) -> u8 {
        if self.protected() {
            self.segs.cs.cpl
        } else {
            0
        }
    }

    pub fn get_flag(&self, mask: u16) -> bool {
        self.flags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u16, val: bool) {
        if val {
            self.flags |= mask;
        } else {
            self.flags &= !mask;
        }
        self.flags |= FLAG_ALWAYS_ON;
    }

    /// Linear address of the next instruction fetch.
    pub fn pc_linear(&self) -> u32 {
        self.segs.cs.base.wrapping_add(u32::from(self.ip)) & 0x00FF_FFFF
    }

    /// Named register read, for the debugger. Segment names yield the
    /// selector.
    pub fn reg(&self, name: &str) -> Option<u16> {
        let v = match name.to_ascii_uppercase().as_str() {
            "AX" => self.ax,
            "CX" => self.cx,
            "DX" => self.dx,
            "BX" => self.bx,
            "SP" => self.sp,
            "BP" => self.bp,
            "SI" => self.si,
            "DI" => self.di,
            "IP" => self.ip,
            "PS" | "FL" | "FLAGS" => self.flags,
            "MSW" => self.msw,
            "CS" => self.segs.cs.sel,
            "DS" => self.segs.ds.sel,
            "ES" => self.segs.es.sel,
            "SS" => self.segs.ss.sel,
            "TR" => self.segs.tr.sel,
            "LDT" => self.segs.ldt.sel,
            _ => return None,
        };
        Some(v)
    }

    /// Named register write, for the debugger. Segment registers go through
    /// a real-mode style selector store only; protected reloads are the
    /// program's business.
    pub fn set_reg(&mut self, name: &str, value: u16) -> bool {
        match name.to_ascii_uppercase().as_str() {
            "AX" => self.ax = value,
            "CX" => self.cx = value,
            "DX" => self.dx = value,
            "BX" => self.bx = value,
            "SP" => self.sp = value,
            "BP" => self.bp = value,
            "SI" => self.si = value,
            "DI" => self.di = value,
            "IP" => self.ip = value,
            "PS" | "FL" | "FLAGS" => self.flags = value | FLAG_ALWAYS_ON,
            "CS" if !self.protected() => {
                self.segs.cs.load_real(value);
            }
            "DS" if !self.protected() => {
                self.segs.ds.load_real(value);
            }
            "ES" if !self.protected() => {
                self.segs.es.load_real(value);
            }
            "SS" if !self.protected() => {
                self.segs.ss.load_real(value);
            }
            _ => return false,
        }
        true
    }

    /// DEBUG-style register display.
    pub fn regs_to_string(&self, detail: bool) -> String {
        let f = self.flags;
        let flag = |mask: u16, on: &'static str, off: &'static str| {
            if f & mask != 0 {
                on
            } else {
                off
            }
        };
        let mut s = format!(
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SP={:04X} BP={:04X} SI={:04X} DI={:04X}\n\
             DS={:04X} ES={:04X} SS={:04X} CS={:04X} IP={:04X} {} {} {} {} {} {} {} {}",
            self.ax,
            self.bx,
            self.cx,
            self.dx,
            self.sp,
            self.bp,
            self.si,
            self.di,
            self.segs.ds.sel,
            self.segs.es.sel,
            self.segs.ss.sel,
            self.segs.cs.sel,
            self.ip,
            flag(FLAG_OF, "OV", "NV"),
            flag(FLAG_DF, "DN", "UP"),
            flag(FLAG_IF, "EI", "DI"),
            flag(FLAG_SF, "NG", "PL"),
            flag(FLAG_ZF, "ZR", "NZ"),
            flag(FLAG_AF, "AC", "NA"),
            flag(FLAG_PF, "PE", "PO"),
            flag(FLAG_CF, "CY", "NC"),
        );
        if detail {
            s.push('\n');
            for seg in [&self.segs.cs, &self.segs.ds, &self.segs.es, &self.segs.ss] {
                s.push_str(&format!(
                    "{}={:04X} base={:06X} limit={:04X} dpl={} ",
                    seg.name, seg.sel, seg.base, seg.limit, seg.dpl
                ));
            }
            s.push_str(&format!(
                "\nGDT={:06X}:{:04X} IDT={:06X}:{:04X} LDT={:04X} TR={:04X} MSW={:04X} CPL={}",
                self.gdtr.base,
                self.gdtr.limit,
                self.idtr.base,
                self.idtr.limit,
                self.segs.ldt.sel,
                self.segs.tr.sel,
                self.msw,
                self.cpl(),
            ));
        }
        s
    }

    /// Serializes every descriptor cache plus the register file.
    pub fn save(&self) -> CpuSnapshot {
        CpuSnapshot {
            gpr: [
                self.ax, self.cx, self.dx, self.bx, self.sp, self.bp, self.si, self.di,
            ],
            ip: self.ip,
            flags: self.flags,
            msw: self.msw,
            gdtr: self.gdtr,
            idtr: self.idtr,
            segs: [
                self.segs.es.save(),
                self.segs.cs.save(),
                self.segs.ss.save(),
                self.segs.ds.save(),
                self.segs.ldt.save(),
                self.segs.tr.save(),
            ],
        }
    }

    pub fn restore(&mut self, snap: &CpuSnapshot) {
        [
            self.ax, self.cx, self.dx, self.bx, self.sp, self.bp, self.si, self.di,
        ] = snap.gpr;
        self.ip = snap.ip;
        self.flags = snap.flags;
        self.msw = snap.msw;
        self.gdtr = snap.gdtr;
        self.idtr = snap.idtr;
        self.segs.es.restore(&snap.segs[0]);
        self.segs.cs.restore(&snap.segs[1]);
        self.segs.ss.restore(&snap.segs[2]);
        self.segs.ds.restore(&snap.segs[3]);
        self.segs.ldt.restore(&snap.segs[4]);
        self.segs.tr.restore(&snap.segs[5]);
    }
}

/// Serialized CPU state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub gpr: [u16; 8],
    pub ip: u16,
    pub flags: u16,
    pub msw: u16,
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub segs: [SegmentState; 6],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state_points_at_the_bios_vector() {
        let cpu = CpuState::default();
        assert_eq!(cpu.segs.cs.sel, 0xF000);
        assert_eq!(cpu.ip, 0xFFF0);
        assert_eq!(cpu.pc_linear(), 0xFFFF0);
        assert!(!cpu.protected());
        assert_eq!(cpu.cpl(), 0);
    }

    #[test]
    fn registers_resolve_by_name() {
        let mut cpu = CpuState::default();
        assert!(cpu.set_reg("ax", 0x1234));
        assert_eq!(cpu.reg("AX"), Some(0x1234));
        assert!(cpu.set_reg("DS", 0x2000));
        assert_eq!(cpu.segs.ds.base, 0x2_0000);
        assert_eq!(cpu.reg("XX"), None);
        assert!(!cpu.set_reg("XX", 0));
    }

    #[test]
    fn msw_pe_transition_retargets_segments() {
        let mut cpu = CpuState::default();
        assert!(cpu.segs.ds.check_read(0, 1).is_ok());

        cpu.set_msw(MSW_PE);
        assert!(cpu.protected());
        // DS still holds a null selector: protected dispatch disallows it.
        assert!(cpu.segs.ds.check_read(0, 1).is_err());

        cpu.set_msw(0);
        assert!(cpu.segs.ds.check_read(0, 1).is_ok());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut cpu = CpuState::default();
        cpu.ax = 0xBEEF;
        cpu.sp = 0x8000;
        cpu.gdtr = TableReg { base: 0x100, limit: 0x7F };
        let snap = cpu.save();

        let mut other = CpuState::default();
        other.restore(&snap);
        assert_eq!(other.ax, 0xBEEF);
        assert_eq!(other.sp, 0x8000);
        assert_eq!(other.gdtr, cpu.gdtr);
        assert_eq!(other.segs.cs.sel, 0xF000);
        assert_eq!(other.pc_linear(), 0xFFFF0);
    }
}

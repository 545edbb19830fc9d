//! Protected-mode segment loading, gate transfers and task switching.
//!
//! These are methods on [`CpuState`] rather than on the individual segment
//! registers because nearly every operation consults more than one register:
//! descriptor fetches need GDTR/LDTR, gate transfers read the TSS and push on
//! the stack, task switches touch everything.
//!
//! Faults are returned, never delivered; the executor owns IDT vectoring.

use tracing::trace;

use crate::descriptor::{Descriptor, SysType, ACC_ACCESSED, ACC_TSS_BUSY};
use crate::exception::Exception;
use crate::mem::MemAccess;
use crate::segment::{SegRole, SegmentRegister, TransferKind, ADDR_INVALID};
use crate::state::{CpuState, FLAG_ALWAYS_ON, FLAG_IF, FLAG_NT, FLAG_TF};

/// Names one architectural segment register of [`CpuState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegId {
    Es,
    Cs,
    Ss,
    Ds,
    Ldt,
    Tr,
    Probe,
}

/// Field offsets of the 80286 task state segment.
pub mod tss {
    pub const BACKLINK: u32 = 0x00;
    pub const IP: u32 = 0x0E;
    pub const FLAGS: u32 = 0x10;
    pub const AX: u32 = 0x12;
    pub const CX: u32 = 0x14;
    pub const DX: u32 = 0x16;
    pub const BX: u32 = 0x18;
    pub const SP: u32 = 0x1A;
    pub const BP: u32 = 0x1C;
    pub const SI: u32 = 0x1E;
    pub const DI: u32 = 0x20;
    pub const ES: u32 = 0x22;
    pub const CS: u32 = 0x24;
    pub const SS: u32 = 0x26;
    pub const DS: u32 = 0x28;
    pub const LDT: u32 = 0x2A;
    /// A 286 TSS must cover at least the LDT selector field.
    pub const LIMIT_MIN: u32 = 0x2B;

    /// Privileged-stack SP slot for an inward transfer to `cpl`.
    pub fn sp_for(cpl: u8) -> u32 {
        0x02 + 4 * u32::from(cpl)
    }

    /// Privileged-stack SS slot for an inward transfer to `cpl`.
    pub fn ss_for(cpl: u8) -> u32 {
        0x04 + 4 * u32::from(cpl)
    }
}

impl CpuState {
    /// Loads `sel` into the given segment register, dispatching on the
    /// register's current mode. Returns the new base.
    pub fn load_seg(
        &mut self,
        mem: &mut impl MemAccess,
        id: SegId,
        sel: u16,
    ) -> Result<u32, Exception> {
        if self.segs.get(id).is_protected() {
            self.load_prot(mem, id, sel, false)
        } else {
            Ok(self.segs.get_mut(id).load_real(sel))
        }
    }

    /// Fault-free selector probe for the debugger: no exception is raised and
    /// no ACCESSED bit is written. The register still receives the descriptor
    /// cache so the caller can inspect base/limit afterwards.
    pub fn probe_seg(&mut self, mem: &mut impl MemAccess, id: SegId, sel: u16) -> Option<u32> {
        if self.segs.get(id).is_protected() {
            self.load_prot(mem, id, sel, true).ok()
        } else {
            Some(self.segs.get_mut(id).load_real(sel))
        }
    }

    /// LLDT.
    pub fn load_ldtr(&mut self, mem: &mut impl MemAccess, sel: u16) -> Result<u32, Exception> {
        self.load_seg(mem, SegId::Ldt, sel)
    }

    /// LTR: loads the task register and marks the descriptor busy, both in
    /// memory and in the cached rights.
    pub fn load_tr(&mut self, mem: &mut impl MemAccess, sel: u16) -> Result<u32, Exception> {
        let base = self.load_seg(mem, SegId::Tr, sel)?;
        let tr = &mut self.segs.tr;
        if tr.is_protected() && tr.desc_addr != ADDR_INVALID {
            let acc = mem.read_u16(tr.desc_addr.wrapping_add(4));
            mem.write_u16(tr.desc_addr.wrapping_add(4), acc | ACC_TSS_BUSY);
            tr.acc |= ACC_TSS_BUSY;
        }
        Ok(base)
    }

    /// Declares the kind of control transfer driving the next CS load.
    pub fn set_call_kind(&mut self, kind: Option<TransferKind>) {
        self.segs.cs.call_kind = kind;
    }

    /// Resolves the interrupt `vector` to a linear target address, loading CS
    /// (and, through gates, possibly switching stacks or tasks) on the way.
    pub fn load_idt(&mut self, mem: &mut impl MemAccess, vector: u8) -> Result<u32, Exception> {
        if !self.protected() {
            let entry_off = u32::from(vector) * 4;
            if entry_off + 3 > u32::from(self.idtr.limit) {
                return Err(Exception::gp0());
            }
            let entry = self.idtr.base.wrapping_add(entry_off);
            let off = mem.read_u16(entry);
            let seg = mem.read_u16(entry.wrapping_add(2));
            let base = self.segs.cs.load_real(seg);
            self.ip = off;
            return Ok(base.wrapping_add(u32::from(off)));
        }

        // IDT-sourced faults carry `vector*8 | 2` as the error selector.
        let err_sel = (u16::from(vector) << 3) | 2;
        let entry_off = u32::from(vector) * 8;
        if entry_off + 7 > u32::from(self.idtr.limit) {
            return Err(Exception::gp(err_sel));
        }
        let gate = Descriptor::fetch(mem, self.idtr.base.wrapping_add(entry_off), self.model);
        if gate.is_seg() || !gate.sys_type().is_gate() || gate.sys_type() == SysType::CallGate {
            return Err(Exception::gp(err_sel));
        }
        self.through_gate(mem, err_sel, gate, Some(TransferKind::Call), true)?;
        Ok(self.pc_linear())
    }

    /// Linear address of the descriptor named by `sel`, with table limit
    /// checks.
    fn desc_addr_for(&self, sel: u16) -> Result<u32, Exception> {
        let index = u32::from(sel & !0x7);
        if sel & 0x4 != 0 {
            let ldt = &self.segs.ldt;
            if SegmentRegister::is_null_sel(ldt.sel) && ldt.desc_addr == ADDR_INVALID {
                return Err(Exception::gp(sel));
            }
            if index + 8 > ldt.off_max {
                return Err(Exception::gp(sel));
            }
            Ok(ldt.base.wrapping_add(index))
        } else {
            if index + 7 > u32::from(self.gdtr.limit) {
                return Err(Exception::gp(sel));
            }
            Ok(self.gdtr.base.wrapping_add(index))
        }
    }

    fn load_prot(
        &mut self,
        mem: &mut impl MemAccess,
        id: SegId,
        sel: u16,
        suppress: bool,
    ) -> Result<u32, Exception> {
        let role = self.segs.get(id).role;

        if SegmentRegister::is_null_sel(sel) {
            return match role {
                // Null loads are architecturally legal for data-like
                // registers; the register becomes unusable until reloaded.
                SegRole::Data | SegRole::Ldt | SegRole::Other => {
                    self.install_unusable(id, sel);
                    Ok(0)
                }
                SegRole::Code | SegRole::Stack | SegRole::Tss => Err(Exception::gp0()),
            };
        }

        let addr = self.desc_addr_for(sel)?;
        let desc = Descriptor::fetch(mem, addr, self.model);

        match role {
            SegRole::Code => self.load_code(mem, sel, desc, suppress),
            SegRole::Data | SegRole::Other => {
                let readable_seg = desc.is_seg() && !(desc.is_code() && !desc.is_readable_code());
                // The debugger's scratch register also accepts TSS/LDT
                // descriptors so system segments can be dumped.
                let system_ok = role == SegRole::Other
                    && !desc.is_seg()
                    && (desc.sys_type().is_tss() || desc.sys_type() == SysType::Ldt);
                if !readable_seg && !system_ok {
                    if desc.acc == 0 {
                        // Empty-descriptor quirk: fault, but leave the
                        // register loaded-and-disallowed so software that
                        // dereferences empty descriptors can recover.
                        self.install_unusable(id, sel);
                    }
                    return Err(Exception::gp(sel));
                }
                if desc.is_seg() && !desc.is_conforming_code() {
                    let rpl = (sel & 3) as u8;
                    if desc.dpl() < rpl.max(self.cpl()) {
                        return Err(Exception::gp(sel));
                    }
                }
                if !desc.present() {
                    return Err(Exception::np(sel));
                }
                self.commit(mem, id, sel, &desc, suppress);
                Ok(self.segs.get(id).base)
            }
            SegRole::Stack => {
                if !desc.is_writable_data() {
                    return Err(Exception::gp(sel));
                }
                let rpl = (sel & 3) as u8;
                if rpl != self.segs.cs.cpl || desc.dpl() != self.segs.cs.cpl {
                    return Err(Exception::gp(sel));
                }
                if !desc.present() {
                    return Err(Exception::ss(sel));
                }
                self.commit(mem, id, sel, &desc, suppress);
                Ok(self.segs.get(id).base)
            }
            SegRole::Tss => {
                if desc.is_seg() || !desc.sys_type().is_tss() {
                    return Err(Exception::ts(sel));
                }
                if !desc.present() {
                    return Err(Exception::np(sel));
                }
                self.commit(mem, id, sel, &desc, suppress);
                Ok(self.segs.get(id).base)
            }
            SegRole::Ldt => {
                if desc.is_seg() || desc.sys_type() != SysType::Ldt {
                    return Err(Exception::gp(sel));
                }
                if !desc.present() {
                    return Err(Exception::np(sel));
                }
                self.commit(mem, id, sel, &desc, suppress);
                Ok(self.segs.get(id).base)
            }
        }
    }

    fn install_unusable(&mut self, id: SegId, sel: u16) {
        let model = self.model;
        let seg = self.segs.get_mut(id);
        seg.sel = sel;
        seg.base = 0;
        seg.limit = 0;
        seg.off_max = 0;
        seg.acc = 0;
        seg.ext = 0;
        seg.desc_addr = ADDR_INVALID;
        seg.update_mode(true, model);
    }

    /// Installs a vetted descriptor and performs the ACCESSED write-back.
    fn commit(
        &mut self,
        mem: &mut impl MemAccess,
        id: SegId,
        sel: u16,
        desc: &Descriptor,
        suppress: bool,
    ) {
        let model = self.model;
        self.segs.get_mut(id).install(sel, desc, model);
        if !suppress {
            self.set_accessed(mem, desc);
        }
    }

    fn set_accessed(&self, mem: &mut impl MemAccess, desc: &Descriptor) {
        if desc.is_seg() && desc.addr != ADDR_INVALID && desc.acc & ACC_ACCESSED == 0 {
            mem.write_u16(desc.addr.wrapping_add(4), desc.acc | ACC_ACCESSED);
        }
    }

    fn load_code(
        &mut self,
        mem: &mut impl MemAccess,
        sel: u16,
        desc: Descriptor,
        suppress: bool,
    ) -> Result<u32, Exception> {
        let kind = self.segs.cs.call_kind.take();
        self.segs.cs.stack_switched = false;
        let rpl = (sel & 3) as u8;
        let cpl = self.segs.cs.cpl;

        if !desc.is_seg() {
            if desc.sys_type().is_gate() {
                if suppress {
                    // Probes never follow gate indirection.
                    return Err(Exception::gp(sel));
                }
                return self.through_gate(mem, sel, desc, kind, false);
            }
            return Err(Exception::gp(sel));
        }

        if !desc.present() {
            return Err(Exception::np(sel));
        }
        if !desc.is_code() {
            return Err(Exception::gp(sel));
        }

        if kind == Some(TransferKind::Return) && rpl > cpl {
            // Outward return: the popped CS may be less privileged; SP and SS
            // for the outer ring follow on the current stack.
            if desc.is_conforming_code() {
                if desc.dpl() > rpl {
                    return Err(Exception::gp(sel));
                }
            } else if desc.dpl() != rpl {
                return Err(Exception::gp(sel));
            }

            let frame = self.segs.ss.check_read(u32::from(self.sp), 4)?;
            let new_sp = mem.read_u16(frame);
            let new_ss = mem.read_u16(frame.wrapping_add(2));

            self.commit(mem, SegId::Cs, sel, &desc, suppress);
            self.segs.cs.cpl = rpl;
            self.sp = new_sp;
            self.load_prot(mem, SegId::Ss, new_ss, suppress)?;
            return Ok(self.segs.cs.base);
        }

        if desc.is_conforming_code() {
            if desc.dpl() > cpl {
                return Err(Exception::gp(sel));
            }
        } else if desc.dpl() != cpl {
            return Err(Exception::gp(sel));
        }

        self.commit(mem, SegId::Cs, sel, &desc, suppress);
        self.segs.cs.cpl = cpl;
        Ok(self.segs.cs.base)
    }

    /// Gate indirection for far transfers and interrupt delivery.
    ///
    /// `gsel` is the selector (or IDT error selector) naming the gate, used
    /// in fault error codes. `via_idt` relaxes the RPL/DPL check, which does
    /// not apply to hardware interrupt delivery.
    fn through_gate(
        &mut self,
        mem: &mut impl MemAccess,
        gsel: u16,
        gate: Descriptor,
        kind: Option<TransferKind>,
        via_idt: bool,
    ) -> Result<u32, Exception> {
        let cpl = self.segs.cs.cpl;
        let rpl = (gsel & 3) as u8;

        if !via_idt && rpl.max(cpl) > gate.dpl() {
            return Err(Exception::gp(gsel));
        }
        if !gate.present() {
            return Err(Exception::np(gsel));
        }

        if gate.sys_type() == SysType::TaskGate {
            self.switch_tss(mem, gate.gate_selector(), true)?;
            return Ok(self.segs.cs.base);
        }

        let target_sel = gate.gate_selector();
        if SegmentRegister::is_null_sel(target_sel) {
            return Err(Exception::gp0());
        }
        let target_addr = self.desc_addr_for(target_sel)?;
        let target = Descriptor::fetch(mem, target_addr, self.model);
        if !target.present() {
            return Err(Exception::np(target_sel));
        }
        if !target.is_code() {
            return Err(Exception::gp(target_sel));
        }
        let tdpl = target.dpl();
        if tdpl > cpl {
            return Err(Exception::gp(target_sel));
        }

        let inward = !target.is_conforming_code() && tdpl < cpl;
        if inward {
            if !via_idt && kind != Some(TransferKind::Call) {
                // Only CALLF/INT may change privilege through a gate.
                return Err(Exception::gp(gsel));
            }

            let n_words = if gate.sys_type() == SysType::CallGate {
                usize::from(gate.gate_word_count())
            } else {
                0
            };
            let old_ss = self.segs.ss.sel;
            let old_sp = self.sp;

            let mut parms = self.segs.cs.aw_parms;
            for (i, slot) in parms.iter_mut().enumerate().take(n_words) {
                let lin = self
                    .segs
                    .ss
                    .check_read(u32::from(old_sp) + 2 * i as u32, 2)?;
                *slot = mem.read_u16(lin);
            }
            self.segs.cs.aw_parms = parms;

            // The inner stack pointer lives in the current task's TSS.
            let tr = &self.segs.tr;
            if tss::ss_for(tdpl) + 2 > tr.off_max {
                return Err(Exception::ts(tr.sel));
            }
            let new_sp = mem.read_u16(tr.base.wrapping_add(tss::sp_for(tdpl)));
            let new_ss = mem.read_u16(tr.base.wrapping_add(tss::ss_for(tdpl)));

            self.commit(mem, SegId::Cs, target_sel, &target, false);
            self.segs.cs.cpl = tdpl;
            self.load_prot(mem, SegId::Ss, new_ss, false)?;
            self.sp = new_sp;

            self.push_word(mem, old_ss)?;
            self.push_word(mem, old_sp)?;
            for i in (0..n_words).rev() {
                let word = self.segs.cs.aw_parms[i];
                self.push_word(mem, word)?;
            }
            self.segs.cs.stack_switched = true;
            trace!(
                gate = format_args!("{gsel:#06x}"),
                cpl = tdpl,
                words = n_words,
                "inward gate transfer"
            );
        } else {
            self.commit(mem, SegId::Cs, target_sel, &target, false);
            self.segs.cs.cpl = cpl;
        }

        self.ip = gate.gate_offset();
        match gate.sys_type() {
            SysType::IntGate => self.flags &= !(FLAG_IF | FLAG_TF | FLAG_NT),
            SysType::TrapGate => self.flags &= !(FLAG_TF | FLAG_NT),
            _ => {}
        }
        Ok(self.segs.cs.base)
    }

    fn push_word(&mut self, mem: &mut impl MemAccess, value: u16) -> Result<(), Exception> {
        let sp = self.sp.wrapping_sub(2);
        let lin = self.segs.ss.check_write(u32::from(sp), 2)?;
        mem.write_u16(lin, value);
        self.sp = sp;
        Ok(())
    }

    /// Switches to the task named by `sel_new`.
    ///
    /// `nest` is set for CALL/INT-style entry (backlink written, NT set) and
    /// clear for a JMP-style switch or an IRET return along the backlink.
    pub fn switch_tss(
        &mut self,
        mem: &mut impl MemAccess,
        sel_new: u16,
        nest: bool,
    ) -> Result<(), Exception> {
        if !nest {
            let tr = &self.segs.tr;
            if (tr.acc >> 8) & 0x0F != 0x03 {
                return Err(Exception::ts(sel_new));
            }
            if tr.desc_addr != ADDR_INVALID {
                let acc = mem.read_u16(tr.desc_addr.wrapping_add(4));
                mem.write_u16(tr.desc_addr.wrapping_add(4), acc & !ACC_TSS_BUSY);
            }
        }

        if sel_new & 0x4 != 0 || SegmentRegister::is_null_sel(sel_new) {
            return Err(Exception::gp(sel_new));
        }
        let addr = self.desc_addr_for(sel_new)?;
        let desc = Descriptor::fetch(mem, addr, self.model);
        if nest {
            if desc.is_seg() || desc.sys_type() != SysType::Tss {
                return Err(Exception::gp(sel_new));
            }
        } else if desc.is_seg() || !desc.sys_type().is_tss() {
            return Err(Exception::ts(sel_new));
        }
        if !desc.present() {
            return Err(Exception::np(sel_new));
        }
        if desc.limit < tss::LIMIT_MIN {
            return Err(Exception::ts(sel_new));
        }
        let mut desc = desc;
        if nest {
            mem.write_u16(addr.wrapping_add(4), desc.acc | ACC_TSS_BUSY);
            desc.acc |= ACC_TSS_BUSY;
        }

        // Save the outgoing context into the old TSS.
        let old_base = self.segs.tr.base;
        let old_tr_sel = self.segs.tr.sel;
        let old_cpl = self.cpl();
        mem.write_u16(old_base.wrapping_add(tss::IP), self.ip);
        mem.write_u16(old_base.wrapping_add(tss::FLAGS), self.flags);
        mem.write_u16(old_base.wrapping_add(tss::AX), self.ax);
        mem.write_u16(old_base.wrapping_add(tss::CX), self.cx);
        mem.write_u16(old_base.wrapping_add(tss::DX), self.dx);
        mem.write_u16(old_base.wrapping_add(tss::BX), self.bx);
        mem.write_u16(old_base.wrapping_add(tss::SP), self.sp);
        mem.write_u16(old_base.wrapping_add(tss::BP), self.bp);
        mem.write_u16(old_base.wrapping_add(tss::SI), self.si);
        mem.write_u16(old_base.wrapping_add(tss::DI), self.di);
        mem.write_u16(old_base.wrapping_add(tss::ES), self.segs.es.sel);
        mem.write_u16(old_base.wrapping_add(tss::CS), self.segs.cs.sel);
        mem.write_u16(old_base.wrapping_add(tss::SS), self.segs.ss.sel);
        mem.write_u16(old_base.wrapping_add(tss::DS), self.segs.ds.sel);

        // Install the new TSS and pull the incoming context.
        let model = self.model;
        self.segs.tr.install(sel_new, &desc, model);
        let nb = self.segs.tr.base;

        self.ip = mem.read_u16(nb.wrapping_add(tss::IP));
        self.flags = mem.read_u16(nb.wrapping_add(tss::FLAGS)) | FLAG_ALWAYS_ON;
        self.ax = mem.read_u16(nb.wrapping_add(tss::AX));
        self.cx = mem.read_u16(nb.wrapping_add(tss::CX));
        self.dx = mem.read_u16(nb.wrapping_add(tss::DX));
        self.bx = mem.read_u16(nb.wrapping_add(tss::BX));
        self.sp = mem.read_u16(nb.wrapping_add(tss::SP));
        self.bp = mem.read_u16(nb.wrapping_add(tss::BP));
        self.si = mem.read_u16(nb.wrapping_add(tss::SI));
        self.di = mem.read_u16(nb.wrapping_add(tss::DI));
        let ldt_sel = mem.read_u16(nb.wrapping_add(tss::LDT));
        let es_sel = mem.read_u16(nb.wrapping_add(tss::ES));
        let cs_sel = mem.read_u16(nb.wrapping_add(tss::CS));
        let mut ss_sel = mem.read_u16(nb.wrapping_add(tss::SS));
        let ds_sel = mem.read_u16(nb.wrapping_add(tss::DS));

        if nest {
            self.flags |= FLAG_NT;
            mem.write_u16(nb.wrapping_add(tss::BACKLINK), old_tr_sel);
        }
        self.set_ts();

        self.load_prot(mem, SegId::Ldt, ldt_sel, false)?;

        self.segs.cs.call_kind = None;
        self.segs.cs.cpl = (cs_sel & 3) as u8;
        self.load_prot(mem, SegId::Cs, cs_sel, false)?;

        // An incoming task at an outer ring takes its stack from the new
        // TSS's CPL-indexed slots.
        let new_cpl = self.segs.cs.cpl;
        if new_cpl > old_cpl {
            if tss::ss_for(new_cpl) + 2 > self.segs.tr.off_max {
                return Err(Exception::ts(sel_new));
            }
            self.sp = mem.read_u16(nb.wrapping_add(tss::sp_for(new_cpl)));
            ss_sel = mem.read_u16(nb.wrapping_add(tss::ss_for(new_cpl)));
        }
        self.load_prot(mem, SegId::Ss, ss_sel, false)?;
        self.load_prot(mem, SegId::Ds, ds_sel, false)?;
        self.load_prot(mem, SegId::Es, es_sel, false)?;

        trace!(
            old = format_args!("{old_tr_sel:#06x}"),
            new = format_args!("{sel_new:#06x}"),
            nest,
            "task switch"
        );
        Ok(())
    }
}

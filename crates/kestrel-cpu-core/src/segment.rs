use serde::{Deserialize, Serialize};

use crate::descriptor::{AccessRights, Descriptor};
use crate::exception::Exception;
use crate::state::CpuModel;

/// Sentinel for "this descriptor cache was not loaded from memory".
pub const ADDR_INVALID: u32 = u32::MAX;

/// Architectural role of a segment register; selects the checking branch of
/// the protected-mode loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegRole {
    Code,
    Data,
    Stack,
    Tss,
    Ldt,
    Other,
}

/// Kind of control transfer driving the next CS load.
///
/// Set by the CPU immediately before a far transfer and consumed by the load:
/// `Call` (CALLF/INT) permits an inward privilege change through a gate,
/// `Return` (RETF/IRET) permits an outward one. A plain load (jump) permits
/// neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Call,
    Return,
}

/// Which bounds/permission rule an access direction currently follows.
///
/// Loads retarget these tags instead of swapping function pointers; the check
/// methods switch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundsCheck {
    /// Real-mode rule: offsets within `off_max` of the cached limit.
    Real,
    /// Normal protected segment: `[off, off + count)` within `off_max`.
    Up,
    /// Expand-down data segment: valid offsets lie ABOVE the limit.
    Down,
    /// Null or non-readable/non-writable segment: every access faults.
    Disallowed,
}

/// One architectural segment register with its descriptor cache.
///
/// The cache (base/limit/rights) is consulted on every access without
/// re-reading descriptor memory; only `load` refreshes it.
pub struct SegmentRegister {
    pub name: &'static str,
    pub role: SegRole,

    pub sel: u16,
    pub base: u32,
    pub limit: u32,
    /// `limit + 1`; kept in sync with `limit`.
    pub off_max: u32,
    pub acc: u16,
    pub ext: u16,
    /// Linear address of the source descriptor, or [`ADDR_INVALID`].
    pub desc_addr: u32,

    pub cpl: u8,
    pub dpl: u8,

    protected: bool,
    read_rule: BoundsCheck,
    write_rule: BoundsCheck,

    pub data_size: u8,
    pub addr_size: u8,
    pub data_mask: u32,
    pub addr_mask: u32,

    /// Gate parameter copy buffer; used only inside a single CS load.
    pub(crate) aw_parms: [u16; 32],
    /// Pending transfer kind, consumed by the next protected CS load.
    pub call_kind: Option<TransferKind>,
    /// Whether the last gate transfer switched stacks.
    pub stack_switched: bool,
}

impl SegmentRegister {
    pub fn new(role: SegRole, name: &'static str) -> Self {
        Self {
            name,
            role,
            sel: 0,
            base: 0,
            limit: 0xFFFF,
            off_max: 0x1_0000,
            acc: 0,
            ext: 0,
            desc_addr: ADDR_INVALID,
            cpl: 0,
            dpl: 0,
            protected: false,
            read_rule: BoundsCheck::Real,
            write_rule: BoundsCheck::Real,
            data_size: 2,
            addr_size: 2,
            data_mask: 0xFFFF,
            addr_mask: 0xFFFF,
            aw_parms: [0; 32],
            call_kind: None,
            stack_switched: false,
        }
    }

    /// Real-mode load: the base tracks the selector, every other cached
    /// attribute is left as is.
    pub fn load_real(&mut self, sel: u16) -> u32 {
        self.sel = sel;
        self.base = u32::from(sel) << 4;
        self.desc_addr = ADDR_INVALID;
        self.cpl = 0;
        self.base
    }

    /// Installs a fetched descriptor into the cache. The caller has already
    /// performed the role/privilege checks.
    pub(crate) fn install(&mut self, sel: u16, desc: &Descriptor, model: CpuModel) {
        self.sel = sel;
        self.base = if model == CpuModel::C286 {
            desc.base & 0x00FF_FFFF
        } else {
            desc.base
        };
        self.limit = desc.limit;
        self.off_max = desc.limit.wrapping_add(1);
        self.acc = desc.acc;
        self.ext = desc.ext;
        self.desc_addr = desc.addr;
        self.update_mode(true, model);
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Null selector: index 0 in the GDT regardless of RPL.
    pub fn is_null_sel(sel: u16) -> bool {
        sel & !0x3 == 0
    }

    fn rights(&self) -> AccessRights {
        AccessRights::from_bits_truncate(self.acc)
    }

    pub fn is_expand_down(&self) -> bool {
        self.protected
            && self.rights().contains(AccessRights::SEG | AccessRights::CONFORMING)
            && !self.rights().contains(AccessRights::CODE)
    }

    pub fn is_conforming(&self) -> bool {
        self.rights()
            .contains(AccessRights::SEG | AccessRights::CODE | AccessRights::CONFORMING)
    }

    /// Rebinds the check tags to the current mode and cached rights.
    ///
    /// In real mode everything goes through the `Real` rule. In protected
    /// mode the tags derive from the descriptor: expand-down data selects the
    /// `Down` rule, a missing permission or a null selector selects
    /// `Disallowed`. When `just_loaded`, privilege fields and operand/address
    /// sizes are recomputed as well.
    pub fn update_mode(&mut self, just_loaded: bool, model: CpuModel) {
        if !self.protected {
            self.read_rule = BoundsCheck::Real;
            self.write_rule = BoundsCheck::Real;
            return;
        }

        let rights = self.rights();
        if Self::is_null_sel(self.sel) || !rights.contains(AccessRights::SEG) {
            // Null selectors and system descriptors are never directly
            // addressable; TSS/LDT fetches go through dedicated paths.
            self.read_rule = BoundsCheck::Disallowed;
            self.write_rule = BoundsCheck::Disallowed;
        } else if rights.contains(AccessRights::CODE) {
            self.read_rule = if rights.contains(AccessRights::RW) {
                BoundsCheck::Up
            } else {
                BoundsCheck::Disallowed
            };
            self.write_rule = BoundsCheck::Disallowed;
        } else {
            let rule = if self.is_expand_down() {
                BoundsCheck::Down
            } else {
                BoundsCheck::Up
            };
            self.read_rule = rule;
            self.write_rule = if rights.contains(AccessRights::RW) {
                rule
            } else {
                BoundsCheck::Disallowed
            };
        }

        if just_loaded {
            self.dpl = ((self.acc >> 13) & 0x3) as u8;
            if self.role != SegRole::Code {
                self.cpl = (self.sel & 0x3) as u8;
            }
            let big = model == CpuModel::C386 && self.ext & 0x0040 != 0;
            let size = if big { 4 } else { 2 };
            self.data_size = size;
            self.addr_size = size;
            self.data_mask = if big { 0xFFFF_FFFF } else { 0xFFFF };
            self.addr_mask = self.data_mask;
        }
    }

    /// Switches this register between real and protected dispatch. The cached
    /// descriptor survives the transition (the 286 relies on that when
    /// dropping back to real mode).
    pub fn set_protected(&mut self, protected: bool, model: CpuModel) {
        self.protected = protected;
        self.update_mode(false, model);
    }

    /// Validates `[offset, offset + count)` for reading and returns the
    /// linear address on success.
    pub fn check_read(&self, offset: u32, count: u32) -> Result<u32, Exception> {
        self.check(self.read_rule, offset, count)
    }

    /// Validates `[offset, offset + count)` for writing and returns the
    /// linear address on success.
    pub fn check_write(&self, offset: u32, count: u32) -> Result<u32, Exception> {
        self.check(self.write_rule, offset, count)
    }

    /// Fault-free probe variants for the debugger.
    pub fn probe_read(&self, offset: u32, count: u32) -> Option<u32> {
        self.check(self.read_rule, offset, count).ok()
    }

    pub fn probe_write(&self, offset: u32, count: u32) -> Option<u32> {
        self.check(self.write_rule, offset, count).ok()
    }

    fn check(&self, rule: BoundsCheck, offset: u32, count: u32) -> Result<u32, Exception> {
        let end = u64::from(offset) + u64::from(count);
        let ok = match rule {
            BoundsCheck::Real | BoundsCheck::Up => end <= u64::from(self.off_max),
            // Expand-down: valid offsets lie above the limit, bounded by the
            // 64K top of a 16-bit segment.
            BoundsCheck::Down => offset > self.limit && end <= 0x1_0000,
            BoundsCheck::Disallowed => false,
        };
        if ok {
            Ok(self.base.wrapping_add(offset) & 0x00FF_FFFF)
        } else {
            Err(Exception::gp0())
        }
    }

    /// Forces a base independent of the selector; truncated to the 24-bit
    /// physical space of the 286.
    pub fn set_base(&mut self, addr: u32) {
        self.base = addr & 0x00FF_FFFF;
    }

    /// Serializes the descriptor cache so execution can resume without
    /// re-reading descriptor memory.
    pub fn save(&self) -> SegmentState {
        SegmentState {
            sel: self.sel,
            base: self.base,
            limit: self.limit,
            off_max: self.off_max,
            acc: self.acc,
            ext: self.ext,
            desc_addr: self.desc_addr,
            role: self.role,
            cpl: self.cpl,
            dpl: self.dpl,
            protected: self.protected,
            check_read: self.read_rule,
            check_write: self.write_rule,
            data_size: self.data_size,
            addr_size: self.addr_size,
            data_mask: self.data_mask,
            addr_mask: self.addr_mask,
        }
    }

    pub fn restore(&mut self, state: &SegmentState) {
        self.sel = state.sel;
        self.base = state.base;
        self.limit = state.limit;
        self.off_max = state.off_max;
        self.acc = state.acc;
        self.ext = state.ext;
        self.desc_addr = state.desc_addr;
        self.role = state.role;
        self.cpl = state.cpl;
        self.dpl = state.dpl;
        self.protected = state.protected;
        self.read_rule = state.check_read;
        self.write_rule = state.check_write;
        self.data_size = state.data_size;
        self.addr_size = state.addr_size;
        self.data_mask = state.data_mask;
        self.addr_mask = state.addr_mask;
    }
}

/// Serialized descriptor cache of one segment register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentState {
    pub sel: u16,
    pub base: u32,
    pub limit: u32,
    pub off_max: u32,
    pub acc: u16,
    pub ext: u16,
    pub desc_addr: u32,
    pub role: SegRole,
    pub cpl: u8,
    pub dpl: u8,
    pub protected: bool,
    pub check_read: BoundsCheck,
    pub check_write: BoundsCheck,
    pub data_size: u8,
    pub addr_size: u8,
    pub data_mask: u32,
    pub addr_mask: u32,
}

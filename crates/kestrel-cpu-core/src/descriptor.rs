use bitflags::bitflags;

use crate::mem::MemAccess;
use crate::state::CpuModel;

/// ACCESSED bit position within the 16-bit word at descriptor offset 4.
pub const ACC_ACCESSED: u16 = 0x0100;
/// BUSY bit of a TSS descriptor type (distinguishes type 1 from type 3).
pub const ACC_TSS_BUSY: u16 = 0x0200;

bitflags! {
    /// Access-rights word of a descriptor: the byte at offset 5 in the high
    /// half, base bits 23:16 in the low half. For `SEG` descriptors the type
    /// nibble decomposes into the ACCESSED/RW/CONFORMING/CODE bits below; for
    /// system descriptors it is an enumeration read via
    /// [`Descriptor::sys_type`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u16 {
        const BASE_HI    = 0x00FF;
        const ACCESSED   = 0x0100;
        /// Readable for code segments, writable for data segments.
        const RW         = 0x0200;
        /// Conforming for code segments, expand-down for data segments.
        const CONFORMING = 0x0400;
        const CODE       = 0x0800;
        /// S bit: set for code/data, clear for system descriptors and gates.
        const SEG        = 0x1000;
        const DPL_LO     = 0x2000;
        const DPL_HI     = 0x4000;
        const PRESENT    = 0x8000;
    }
}

/// System descriptor / gate types of the 80286 (type nibble with S = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysType {
    Tss,
    Ldt,
    TssBusy,
    CallGate,
    TaskGate,
    IntGate,
    TrapGate,
    Invalid(u8),
}

impl SysType {
    fn from_nibble(t: u8) -> Self {
        match t {
            1 => SysType::Tss,
            2 => SysType::Ldt,
            3 => SysType::TssBusy,
            4 => SysType::CallGate,
            5 => SysType::TaskGate,
            6 => SysType::IntGate,
            7 => SysType::TrapGate,
            other => SysType::Invalid(other),
        }
    }

    pub fn is_gate(self) -> bool {
        matches!(
            self,
            SysType::CallGate | SysType::TaskGate | SysType::IntGate | SysType::TrapGate
        )
    }

    pub fn is_tss(self) -> bool {
        matches!(self, SysType::Tss | SysType::TssBusy)
    }
}

/// An 8-byte descriptor as fetched from a descriptor table, plus the linear
/// address it came from (needed for the ACCESSED/BUSY write-backs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub limit: u32,
    pub base: u32,
    pub acc: u16,
    pub ext: u16,
    pub addr: u32,
}

impl Descriptor {
    /// Reads the four descriptor words at `addr` and assembles base/limit for
    /// the given model. On the 286 the extension word is reserved and the
    /// base is 24-bit; larger models fold in the high base/limit bits and the
    /// page-granularity scaling.
    pub fn fetch(mem: &mut impl MemAccess, addr: u32, model: CpuModel) -> Self {
        let limit_raw = mem.read_u16(addr);
        let base_lo = mem.read_u16(addr.wrapping_add(2));
        let acc = mem.read_u16(addr.wrapping_add(4));
        let ext = mem.read_u16(addr.wrapping_add(6));

        let mut base = u32::from(base_lo) | (u32::from(acc & 0x00FF) << 16);
        let mut limit = u32::from(limit_raw);
        if model == CpuModel::C386 {
            base |= u32::from(ext & 0xFF00) << 16;
            limit |= u32::from(ext & 0x000F) << 16;
            if ext & 0x0080 != 0 {
                limit = (limit << 12) | 0xFFF;
            }
        }

        Self {
            limit,
            base,
            acc,
            ext,
            addr,
        }
    }

    pub fn rights(&self) -> AccessRights {
        AccessRights::from_bits_truncate(self.acc)
    }

    pub fn present(&self) -> bool {
        self.rights().contains(AccessRights::PRESENT)
    }

    pub fn dpl(&self) -> u8 {
        ((self.acc >> 13) & 0x3) as u8
    }

    /// S bit: code/data descriptor (as opposed to system/gate).
    pub fn is_seg(&self) -> bool {
        self.rights().contains(AccessRights::SEG)
    }

    pub fn is_code(&self) -> bool {
        self.is_seg() && self.rights().contains(AccessRights::CODE)
    }

    pub fn is_conforming_code(&self) -> bool {
        self.is_code() && self.rights().contains(AccessRights::CONFORMING)
    }

    pub fn is_readable_code(&self) -> bool {
        self.is_code() && self.rights().contains(AccessRights::RW)
    }

    pub fn is_data(&self) -> bool {
        self.is_seg() && !self.rights().contains(AccessRights::CODE)
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_data() && self.rights().contains(AccessRights::RW)
    }

    /// Type nibble interpreted as a system descriptor. Only meaningful when
    /// the S bit is clear.
    pub fn sys_type(&self) -> SysType {
        SysType::from_nibble(((self.acc >> 8) & 0x0F) as u8)
    }

    // Gate payload: the base/limit fields are repurposed.

    /// Target offset of a call/interrupt/trap gate (the word at offset 0).
    pub fn gate_offset(&self) -> u16 {
        self.limit as u16
    }

    /// Target selector of a gate (the word at offset 2).
    pub fn gate_selector(&self) -> u16 {
        self.base as u16
    }

    /// Parameter word count of a call gate (low 5 bits of the byte at
    /// offset 4).
    pub fn gate_word_count(&self) -> u8 {
        (self.acc & 0x1F) as u8
    }
}

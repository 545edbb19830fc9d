#![forbid(unsafe_code)]

//! 80286 architectural CPU state and the protected-mode segmentation unit.
//!
//! The crate API is centered around [`state::CpuState`], which owns the
//! register file and the per-segment descriptor caches. The instruction
//! decoder/executor is an external collaborator: it drives the segmentation
//! unit through [`CpuState::load_seg`], [`CpuState::load_idt`] and the
//! per-segment bounds checks, and receives faults as [`Exception`] values to
//! vector through the IDT itself.
//!
//! Descriptor and TSS fetches go through the [`mem::MemAccess`] trait so the
//! unit works against the kestrel physical bus or a flat test memory alike.

pub mod descriptor;
pub mod exception;
pub mod mem;
pub mod segment;
pub mod segmentation;
pub mod state;

pub use exception::Exception;
pub use mem::{FlatTestMem, MemAccess};
pub use segment::{SegRole, SegmentRegister, SegmentState, TransferKind, ADDR_INVALID};
pub use segmentation::SegId;
pub use state::{CpuModel, CpuState};

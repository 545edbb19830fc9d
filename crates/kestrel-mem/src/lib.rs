#![forbid(unsafe_code)]

//! Block-paged guest address router.
//!
//! A [`Bus`] owns an array of uniformly sized [`Block`]s covering
//! `2^addr_width` bytes and routes every access by shift-masking the address
//! into a block index and an offset. Unoccupied regions are padded with
//! `BlockKind::None` blocks, so routing never has to range-check.
//!
//! The same type serves as the memory bus and the port I/O bus of a machine;
//! only the [`BusConfig`] widths differ.
//!
//! Instrumentation (watchpoints, history recording) layers onto a block via
//! [`Bus::trap_read`]/[`Bus::trap_write`] without any cost on untrapped
//! blocks: the access path matches on the block's handler state, which is
//! `Direct` unless a trap is installed.

mod block;
mod bus;
mod snapshot;

pub use block::{Block, BlockKind, BlockKinds, TrapHook};
pub use bus::{Bus, BusConfig, MapError};
pub use snapshot::{BlockState, BusState};

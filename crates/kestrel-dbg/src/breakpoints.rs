//! Watchpoints and instruction history, built entirely on the bus trap API.
//!
//! Traps are block-granular, so the shared hooks fire for every access inside
//! a trapped block; the exact-address tables here decide what actually stops
//! the clock. All instrumentation funnels through one read hook and one write
//! hook, which keeps the bus's one-callback-per-block rule satisfiable.

use std::cell::RefCell;
use std::rc::Rc;

use kestrel_mem::{BlockKinds, Bus, TrapHook};
use tracing::debug;

use crate::Clock;

/// One watchpoint slot. Disabled entries keep their address so `be` can
/// resurrect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u32,
    pub enabled: bool,
}

/// Fixed-length ring of executed instruction addresses.
#[derive(Debug)]
pub struct History {
    buf: Vec<u32>,
    next: usize,
    filled: usize,
}

impl History {
    fn new(limit: usize) -> Self {
        Self {
            buf: vec![0; limit.max(1)],
            next: 0,
            filled: 0,
        }
    }

    fn record(&mut self, addr: u32) {
        self.buf[self.next] = addr;
        self.next = (self.next + 1) % self.buf.len();
        self.filled = self.buf.len().min(self.filled + 1);
    }

    /// Up to `count` most recent addresses, oldest first.
    pub fn tail(&self, count: usize) -> Vec<u32> {
        let n = count.min(self.filled);
        let len = self.buf.len();
        (0..n)
            .map(|i| self.buf[(self.next + len - n + i) % len])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

#[derive(Default)]
struct BreakState {
    read_bps: Vec<Option<Breakpoint>>,
    write_bps: Vec<Option<Breakpoint>>,
    /// One-shot address armed by `g addr`; cleared when it fires.
    armed: Option<u32>,
    /// Armed address whose bus trap still needs removing after a fire.
    armed_spent: Option<u32>,
    history: Option<History>,
}

impl BreakState {
    fn hit(table: &[Option<Breakpoint>], addr: u32) -> bool {
        table
            .iter()
            .flatten()
            .any(|bp| bp.enabled && bp.addr == addr)
    }
}

/// Breakpoint & history manager.
///
/// The tables live behind an `Rc<RefCell<..>>` shared with the two hooks
/// installed on the bus; the manager itself holds no borrow across bus calls,
/// so hooks firing during debugger-issued reads stay re-entrant-safe.
pub struct BreakManager {
    state: Rc<RefCell<BreakState>>,
    clock: Rc<dyn Clock>,
    read_hook: TrapHook,
    write_hook: TrapHook,
    /// Blocks trapped for history recording, for symmetric untrap.
    history_blocks: Vec<u32>,
}

impl BreakManager {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        let state = Rc::new(RefCell::new(BreakState::default()));

        let read_state = Rc::clone(&state);
        let read_clock = Rc::clone(&clock);
        let read_hook: TrapHook = Rc::new(move |addr, _value, origin| {
            let mut stop_msg = None;
            {
                let mut st = read_state.borrow_mut();
                if let Some(history) = st.history.as_mut() {
                    // Record only instruction fetches: the executor tags the
                    // fetch of each instruction's first byte with its PC.
                    if origin == Some(addr) {
                        history.record(addr);
                    }
                }
                if st.armed == Some(addr) {
                    st.armed = None;
                    st.armed_spent = Some(addr);
                    stop_msg = Some(format!("go breakpoint at {addr:06X}"));
                } else if BreakState::hit(&st.read_bps, addr) {
                    stop_msg = Some(format!("read breakpoint at {addr:06X}"));
                }
            }
            if let Some(msg) = stop_msg {
                read_clock.stop(&msg);
            }
        });

        let write_state = Rc::clone(&state);
        let write_clock = Rc::clone(&clock);
        let write_hook: TrapHook = Rc::new(move |addr, value, _origin| {
            let hit = BreakState::hit(&write_state.borrow().write_bps, addr);
            if hit {
                write_clock.stop(&format!("write breakpoint at {addr:06X} (={value:02X})"));
            }
        });

        Self {
            state,
            clock,
            read_hook,
            write_hook,
            history_blocks: Vec::new(),
        }
    }

    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    /// Inserts a watchpoint in the first free slot and traps the bus.
    /// Returns the slot index, or `None` when the block already carries a
    /// foreign trap.
    pub fn set_break(&mut self, bus: &mut Bus, addr: u32, write: bool) -> Option<usize> {
        let trapped = if write {
            bus.trap_write(addr, &self.write_hook)
        } else {
            bus.trap_read(addr, &self.read_hook)
        };
        if !trapped {
            return None;
        }

        let mut st = self.state.borrow_mut();
        let table = if write {
            &mut st.write_bps
        } else {
            &mut st.read_bps
        };
        let bp = Breakpoint {
            addr,
            enabled: true,
        };
        let index = match table.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            Some((i, slot)) => {
                *slot = Some(bp);
                i
            }
            None => {
                table.push(Some(bp));
                table.len() - 1
            }
        };
        debug!(addr = format_args!("{addr:#x}"), write, index, "breakpoint set");
        Some(index)
    }

    pub fn clear_break(&mut self, bus: &mut Bus, index: usize, write: bool) -> bool {
        let mut st = self.state.borrow_mut();
        let table = if write {
            &mut st.write_bps
        } else {
            &mut st.read_bps
        };
        let Some(bp) = table.get_mut(index).and_then(Option::take) else {
            return false;
        };
        drop(st);
        if write {
            bus.untrap_write(bp.addr, &self.write_hook);
        } else {
            bus.untrap_read(bp.addr, &self.read_hook);
        }
        true
    }

    pub fn clear_all(&mut self, bus: &mut Bus) {
        for write in [false, true] {
            let len = {
                let st = self.state.borrow();
                if write {
                    st.write_bps.len()
                } else {
                    st.read_bps.len()
                }
            };
            for i in 0..len {
                self.clear_break(bus, i, write);
            }
        }
    }

    pub fn enable_break(&mut self, index: usize, write: bool, enable: bool) -> bool {
        let mut st = self.state.borrow_mut();
        let table = if write {
            &mut st.write_bps
        } else {
            &mut st.read_bps
        };
        match table.get_mut(index) {
            Some(Some(bp)) => {
                bp.enabled = enable;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of both tables for listing: `(index, breakpoint, is_write)`.
    pub fn list(&self) -> Vec<(usize, Breakpoint, bool)> {
        let st = self.state.borrow();
        let mut out = Vec::new();
        for (i, bp) in st.read_bps.iter().enumerate() {
            if let Some(bp) = bp {
                out.push((i, *bp, false));
            }
        }
        for (i, bp) in st.write_bps.iter().enumerate() {
            if let Some(bp) = bp {
                out.push((i, *bp, true));
            }
        }
        out
    }

    /// Arms the one-shot `g addr` stop.
    pub fn arm(&mut self, bus: &mut Bus, addr: u32) -> bool {
        if !bus.trap_read(addr, &self.read_hook) {
            return false;
        }
        self.state.borrow_mut().armed = Some(addr);
        true
    }

    /// Removes the bus trap left behind by a fired one-shot. Called at each
    /// command dispatch; the hook itself cannot touch the bus.
    pub fn sweep_armed(&mut self, bus: &mut Bus) {
        let spent = self.state.borrow_mut().armed_spent.take();
        if let Some(addr) = spent {
            bus.untrap_read(addr, &self.read_hook);
        }
    }

    pub fn history_enabled(&self) -> bool {
        self.state.borrow().history.is_some()
    }

    /// Enables or disables instruction history. Enabling traps every RAM and
    /// ROM block so the shared read hook observes all fetches.
    pub fn enable_history(&mut self, bus: &mut Bus, limit: usize, enable: bool) -> bool {
        if enable == self.history_enabled() {
            return false;
        }
        if enable {
            let mut blocks = Vec::new();
            bus.enum_blocks(BlockKinds::RAM | BlockKinds::ROM, |b| blocks.push(b.addr()));
            for &addr in &blocks {
                bus.trap_read(addr, &self.read_hook);
            }
            self.history_blocks = blocks;
            self.state.borrow_mut().history = Some(History::new(limit));
        } else {
            for &addr in &self.history_blocks {
                bus.untrap_read(addr, &self.read_hook);
            }
            self.history_blocks.clear();
            self.state.borrow_mut().history = None;
        }
        true
    }

    /// Most recent `count` fetched addresses, oldest first.
    pub fn history_tail(&self, count: usize) -> Vec<u32> {
        self.state
            .borrow()
            .history
            .as_ref()
            .map(|h| h.tail(count))
            .unwrap_or_default()
    }
}

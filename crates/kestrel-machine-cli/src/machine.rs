use std::io::Write;
use std::rc::Rc;

use anyhow::{Context, Result};
use kestrel_cpu_core::{CpuModel, CpuState};
use kestrel_dbg::{dasm, Clock, Debugger, DebuggerConfig, MonitorClock};
use kestrel_mem::{BlockKind, Bus, BusConfig};
use tracing::info;

/// How many instructions a `g` may execute before the monitor takes the
/// console back even without a breakpoint hit.
const RUN_BUDGET: u64 = 1_000_000;

pub struct MachineConfig {
    pub ram_kib: u32,
    pub rom_addr: u32,
    pub rom_image: Option<Vec<u8>>,
    pub debugger: DebuggerConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_kib: 640,
            rom_addr: 0xF0000,
            rom_image: None,
            debugger: DebuggerConfig::default(),
        }
    }
}

/// A minimal 286 machine: the physical bus, the port I/O bus, the CPU state
/// and the monitor, glued together by a cooperative clock.
///
/// The instruction executor proper is out of scope here; `step` is a
/// fetch-and-advance driver that exercises the fetch path (and with it the
/// monitor's traps and history) using real instruction lengths.
pub struct Machine {
    pub cpu: CpuState,
    pub bus: Bus,
    pub io: Bus,
    pub dbg: Debugger,
    clock: Rc<MonitorClock>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self> {
        let mut bus = Bus::new(BusConfig {
            addr_width: 24,
            data_width: 8,
            block_size: 4096,
        })
        .context("memory bus configuration")?;
        let io = Bus::new(BusConfig {
            addr_width: 16,
            data_width: 8,
            block_size: 1024,
        })
        .context("io bus configuration")?;

        let ram_bytes = config
            .ram_kib
            .checked_mul(1024)
            .context("RAM size overflow")?;
        bus.add_blocks(0, ram_bytes, BlockKind::Ram)
            .context("mapping RAM")?;

        if let Some(image) = &config.rom_image {
            bus.add_block_image(config.rom_addr, image.len() as u32, BlockKind::Rom, image)
                .context("mapping ROM image")?;
            info!(
                addr = format_args!("{:#x}", config.rom_addr),
                len = image.len(),
                "ROM mapped"
            );
        }

        let clock = Rc::new(MonitorClock::new());
        let dbg = Debugger::new(
            config.debugger,
            Rc::clone(&clock) as Rc<dyn Clock>,
            bus.addr_width(),
        );

        Ok(Self {
            cpu: CpuState::new(CpuModel::C286),
            bus,
            io,
            dbg,
            clock,
        })
    }

    /// Fetches one instruction at CS:IP through the trapping read path
    /// (tagged with the PC so history records it) and advances IP past it.
    pub fn step(&mut self) {
        let pc = self.cpu.pc_linear();

        let mut bytes = [0u8; dasm::MAX_OP_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.bus.read_direct(pc.wrapping_add(i as u32)) as u8;
        }
        let len = dasm::disassemble(&bytes, pc).len as u32;

        // Consume the bytes through the trap path in ascending order; a read
        // breakpoint inside the instruction fires on the first match.
        for i in 0..len {
            self.bus.read_data_from(pc.wrapping_add(i), pc);
        }

        self.cpu.ip = self.cpu.ip.wrapping_add(len as u16);
        match bytes[0] {
            0xF4 => {
                self.cpu.halted = true;
                self.clock.stop("HLT");
            }
            // IN AL,imm8 / OUT imm8,AL keep the port bus honest even under
            // the fetch-only driver.
            0xE4 => {
                let v = self.io.read_data(u32::from(bytes[1]));
                self.cpu.ax = (self.cpu.ax & 0xFF00) | (v as u16 & 0xFF);
            }
            0xE6 => {
                self.io
                    .write_data(u32::from(bytes[1]), u32::from(self.cpu.ax & 0xFF));
            }
            _ => {}
        }
    }

    /// Drains pending monitor run/step requests. Called after every command
    /// line; this is the single place instructions actually "execute".
    pub fn run_pending(&mut self, out: &mut dyn Write) -> Result<()> {
        let steps = self.clock.take_steps();
        for _ in 0..steps {
            self.step();
            if let Some(msg) = self.clock.take_stop() {
                writeln!(out, "{msg}")?;
                break;
            }
        }

        if self.clock.running() {
            let mut budget = RUN_BUDGET;
            while self.clock.running() {
                self.step();
                budget -= 1;
                if budget == 0 {
                    self.clock.stop("run budget exhausted");
                }
            }
            if let Some(msg) = self.clock.take_stop() {
                writeln!(out, "{msg}")?;
            }
        }
        Ok(())
    }

    /// One monitor command line plus whatever execution it requested.
    pub fn exec(&mut self, line: &str, out: &mut dyn Write) -> Result<()> {
        self.dbg
            .exec_line(&mut self.cpu, &mut self.bus, line, out)?;
        self.run_pending(out)
    }
}

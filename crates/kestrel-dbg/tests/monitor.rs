//! End-to-end monitor flows against a real bus and CPU state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kestrel_cpu_core::{CpuModel, CpuState};
use kestrel_dbg::{dasm, Clock, Debugger, DebuggerConfig};
use kestrel_mem::{BlockKind, Bus, BusConfig};
use pretty_assertions::assert_eq;

#[derive(Default)]
struct TestClock {
    running: Cell<bool>,
    steps: Cell<u32>,
    stops: RefCell<Vec<String>>,
}

impl Clock for TestClock {
    fn start(&self) {
        self.running.set(true);
    }

    fn stop(&self, msg: &str) {
        self.running.set(false);
        self.stops.borrow_mut().push(msg.to_owned());
    }

    fn on_step(&self, n: u32) {
        self.steps.set(self.steps.get() + n);
    }

    fn running(&self) -> bool {
        self.running.get()
    }
}

struct Fixture {
    cpu: CpuState,
    bus: Bus,
    dbg: Debugger,
    clock: Rc<TestClock>,
}

impl Fixture {
    fn new() -> Self {
        let mut bus = Bus::new(BusConfig {
            addr_width: 20,
            data_width: 8,
            block_size: 1024,
        })
        .unwrap();
        bus.add_blocks(0, 0x8000, BlockKind::Ram).unwrap();

        let clock = Rc::new(TestClock::default());
        let dbg = Debugger::new(
            DebuggerConfig::default(),
            Rc::clone(&clock) as Rc<dyn Clock>,
            bus.addr_width(),
        );
        let mut cpu = CpuState::new(CpuModel::C286);
        cpu.segs.cs.load_real(0);
        cpu.ip = 0x100;
        Self {
            cpu,
            bus,
            dbg,
            clock,
        }
    }

    fn exec(&mut self, line: &str) -> String {
        let mut out = Vec::new();
        self.dbg
            .exec_line(&mut self.cpu, &mut self.bus, line, &mut out)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    /// Fetch-and-advance stub executor, the way the embedding machine loop
    /// drives the core.
    fn step(&mut self) {
        let pc = self.cpu.pc_linear();
        let mut bytes = [0u8; dasm::MAX_OP_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.bus.read_direct(pc.wrapping_add(i as u32)) as u8;
        }
        let len = dasm::disassemble(&bytes, pc).len as u32;
        for i in 0..len {
            self.bus.read_data_from(pc.wrapping_add(i), pc);
        }
        self.cpu.ip = self.cpu.ip.wrapping_add(len as u16);
    }

    fn drain_steps(&mut self) {
        for _ in 0..self.clock.steps.replace(0) {
            self.step();
        }
    }
}

#[test]
fn print_evaluates_expressions() {
    let mut f = Fixture::new();
    assert!(f.exec("p {3+4}*2").contains("(14.)"));
    assert!(f.exec("p 0xff & 0xf0").contains("f0"));
    assert!(f.exec("p 10.").contains("(10.)"));
    // Registers resolve.
    f.cpu.ax = 0x1234;
    assert!(f.exec("p ax+1").contains("1235"));
    // Parse errors diagnose without touching the machine.
    assert!(f.exec("p {3+").contains("unbalanced"));
}

#[test]
fn edit_then_dump() {
    let mut f = Fixture::new();
    f.exec("e 2050 ab cd ef");
    let dump = f.exec("db 2050 3");
    assert!(dump.contains("002050"), "{dump}");
    assert!(dump.contains("AB CD EF"), "{dump}");

    // Dump with no argument continues from the previous cursor.
    let next = f.exec("db");
    assert!(next.starts_with("002053"), "{next}");
}

#[test]
fn word_dump_composes_little_endian() {
    let mut f = Fixture::new();
    f.exec("e 400 34 12 78 56");
    let dump = f.exec("dw 400 2");
    assert!(dump.contains("1234 5678"), "{dump}");
}

#[test]
fn register_show_and_set() {
    let mut f = Fixture::new();
    let regs = f.exec("r");
    assert!(regs.contains("AX=0000"), "{regs}");
    f.exec("r ax=beef");
    assert_eq!(f.cpu.ax, 0xBEEF);
    let regs = f.exec("r");
    assert!(regs.contains("AX=BEEF"), "{regs}");
    assert!(f.exec("ra").contains("GDT="));
    assert!(f.exec("r xx=1").contains("unknown register"));
}

#[test]
fn seg_off_addresses_resolve_in_real_mode() {
    let mut f = Fixture::new();
    f.exec("e &200:10 5a");
    assert_eq!(f.bus.read_direct(0x2010), 0x5A);
}

#[test]
fn breakpoint_lifecycle_through_commands() {
    let mut f = Fixture::new();
    assert!(f.exec("br 2050").contains("breakpoint 0 set at 002050"));
    assert!(f.exec("bw 2060").contains("breakpoint 0 set at 002060"));
    let list = f.exec("bl");
    assert!(list.contains("0: read  002050 enabled"), "{list}");
    assert!(list.contains("0: write 002060 enabled"), "{list}");

    f.clock.start();
    f.bus.write_data(0x2060, 0x11);
    assert!(!f.clock.running());
    assert!(f.clock.stops.borrow()[0].contains("002060"));

    f.exec("bd 0");
    f.clock.start();
    f.bus.read_data(0x2050);
    assert!(f.clock.running());
    f.exec("be 0");
    f.bus.read_data(0x2050);
    assert!(!f.clock.running());

    f.exec("bc *");
    assert!(f.exec("bl").contains("no breakpoints"));
}

#[test]
fn go_arms_a_one_shot_breakpoint() {
    let mut f = Fixture::new();
    assert!(f.exec("g 300").contains("running"));
    assert!(f.clock.running());

    f.bus.read_data_from(0x300, 0x300);
    assert!(!f.clock.running());
    assert!(f.clock.stops.borrow()[0].contains("go breakpoint"));

    // The next command sweeps the spent trap; the address is plain again.
    f.exec("r");
    f.clock.start();
    f.bus.read_data(0x300);
    assert!(f.clock.running());
}

#[test]
fn halt_command_stops_the_clock() {
    let mut f = Fixture::new();
    f.clock.start();
    assert!(f.exec("h").contains("stopped"));
    assert!(!f.clock.running());
}

#[test]
fn step_requests_reach_the_clock() {
    let mut f = Fixture::new();
    f.exec("t 3");
    assert_eq!(f.clock.steps.get(), 3);
}

#[test]
fn history_round_trip_lists_stepped_pcs() {
    let mut f = Fixture::new();
    // NOP; NOP; INC AX; INC BX; HLT at 0:0100.
    f.exec("e 100 90 90 40 43 f4");
    assert!(f.exec("sh on").contains("history on"));

    f.exec("t 5");
    f.drain_steps();

    let out = f.exec("dh 5");
    let addrs: Vec<&str> = out
        .lines()
        .map(|l| l.split(':').next().unwrap())
        .collect();
    assert_eq!(
        addrs,
        vec!["000100", "000101", "000102", "000103", "000104"]
    );
    assert!(out.contains("NOP"), "{out}");
    assert!(out.contains("INC AX"), "{out}");
    assert!(out.contains("HLT"), "{out}");

    assert!(f.exec("sh off").contains("history off"));
    assert!(f.exec("dh 5").contains("history disabled"));
}

#[test]
fn unassemble_walks_instruction_lengths() {
    let mut f = Fixture::new();
    f.exec("e 200 b8 34 12 cd 21 c3");
    let out = f.exec("u 200 3");
    let lines: Vec<&str> = out.lines().collect();
    assert!(lines[0].starts_with("000200: B8 34 12"), "{out}");
    assert!(lines[0].ends_with("MOV AX,1234"), "{out}");
    assert!(lines[1].starts_with("000203: CD 21"), "{out}");
    assert!(lines[2].contains("RET"), "{out}");

    // Continuation from the cursor.
    f.exec("e 206 90");
    let next = f.exec("u");
    assert!(next.starts_with("000206: 90"), "{next}");
}

#[test]
fn help_lists_every_command() {
    let mut f = Fixture::new();
    let help = f.exec("?");
    for cmd in ["bl", "br|bw", "db|dw|dd", "dh", "e addr", "g [", "p expr", "sh on|off", "u ["] {
        assert!(help.contains(cmd), "missing {cmd} in {help}");
    }
    assert!(f.exec("zz").contains("unknown command"));
}

#[test]
fn variables_participate_in_expressions() {
    let mut f = Fixture::new();
    f.dbg.set_var("base", 0x2000, None);
    assert!(f.exec("p base+50").contains("2050"));
}

#[test]
fn session_state_round_trips() {
    let mut f = Fixture::new();
    f.dbg.set_var("mark", 7, Some("bx+1".into()));
    f.exec("br 2050");
    f.exec("bd 0");
    let state = f.dbg.save_state();

    let mut g = Fixture::new();
    g.dbg.restore_state(&mut g.bus, &state);
    assert_eq!(g.dbg.var("mark"), Some(7));
    let list = g.exec("bl");
    assert!(list.contains("002050 disabled"), "{list}");

    // Restored but disabled: does not fire.
    g.clock.start();
    g.bus.read_data(0x2050);
    assert!(g.clock.running());
}

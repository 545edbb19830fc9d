//! Line-oriented monitor commands.
//!
//! The processor owns the session state (default base, dump/unassemble
//! cursors, variables) and borrows the CPU and bus per line. Output goes to
//! a caller-supplied sink so tests can capture it.

use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use kestrel_cpu_core::{CpuState, SegId};
use kestrel_mem::Bus;
use serde::{Deserialize, Serialize};

use crate::breakpoints::BreakManager;
use crate::expr::{to_base_str, ExprError, ExprEval, GroupStyle, SymbolSource};
use crate::{dasm, Clock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerConfig {
    pub default_base: u32,
    /// Result width of expressions; 0 derives it from the bus address width.
    pub default_bits: u32,
    pub history_limit: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            default_base: 16,
            default_bits: 0,
            history_limit: 100_000,
        }
    }
}

/// A monitor variable: a value plus the optional expression that computes it,
/// kept so a later `restore` can re-fix the value up in context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub value: i64,
    pub fixup: Option<String>,
}

/// Serialized monitor session: variables and breakpoint tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerState {
    pub vars: HashMap<String, Variable>,
    /// `(addr, enabled, is_write)`
    pub breakpoints: Vec<(u32, bool, bool)>,
}

struct Symbols<'a> {
    cpu: &'a CpuState,
    vars: &'a HashMap<String, Variable>,
}

impl SymbolSource for Symbols<'_> {
    fn resolve(&self, name: &str) -> Option<i64> {
        if let Some(v) = self.cpu.reg(name) {
            return Some(i64::from(v));
        }
        self.vars.get(name).map(|v| v.value)
    }
}

/// The interactive monitor.
pub struct Debugger {
    pub breaks: BreakManager,
    vars: HashMap<String, Variable>,
    default_base: u32,
    default_bits: u32,
    group: GroupStyle,
    history_limit: usize,
    /// Cursor for consecutive `d` commands.
    addr_prev: u32,
    /// Cursor for consecutive `u` commands.
    dasm_prev: u32,
}

impl Debugger {
    pub fn new(cfg: DebuggerConfig, clock: Rc<dyn Clock>, bus_addr_width: u32) -> Self {
        Self {
            breaks: BreakManager::new(clock),
            vars: HashMap::new(),
            default_base: cfg.default_base,
            default_bits: if cfg.default_bits == 0 {
                bus_addr_width
            } else {
                cfg.default_bits
            },
            group: GroupStyle::Brace,
            history_limit: cfg.history_limit,
            addr_prev: 0,
            dasm_prev: 0,
        }
    }

    pub fn set_group_style(&mut self, group: GroupStyle) {
        self.group = group;
    }

    /// Evaluates an expression against the CPU's registers and the session
    /// variables.
    pub fn parse_expression(&self, cpu: &CpuState, text: &str) -> Result<i64, ExprError> {
        let symbols = Symbols {
            cpu,
            vars: &self.vars,
        };
        ExprEval {
            symbols: &symbols,
            default_base: self.default_base,
            default_bits: self.default_bits,
            group: self.group,
        }
        .parse(text)
    }

    pub fn set_var(&mut self, name: &str, value: i64, fixup: Option<String>) {
        self.vars
            .insert(name.to_ascii_uppercase(), Variable { value, fixup });
    }

    pub fn var(&self, name: &str) -> Option<i64> {
        self.vars.get(&name.to_ascii_uppercase()).map(|v| v.value)
    }

    pub fn save_state(&self) -> DebuggerState {
        DebuggerState {
            vars: self.vars.clone(),
            breakpoints: self
                .breaks
                .list()
                .into_iter()
                .map(|(_, bp, write)| (bp.addr, bp.enabled, write))
                .collect(),
        }
    }

    pub fn restore_state(&mut self, bus: &mut Bus, state: &DebuggerState) {
        self.vars = state.vars.clone();
        self.breaks.clear_all(bus);
        for &(addr, enabled, write) in &state.breakpoints {
            if let Some(i) = self.breaks.set_break(bus, addr, write) {
                if !enabled {
                    self.breaks.enable_break(i, write, false);
                }
            }
        }
    }

    /// Parses one of the monitor's address forms into a linear address:
    /// `&seg:off` (real), `#sel:off` (protected), `%lin`, `%%phys`, a bare
    /// `seg:off` resolved per the current CPU mode, or a bare expression.
    pub fn parse_addr(
        &self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        text: &str,
    ) -> Result<u32, String> {
        let (kind, rest) = if let Some(r) = text.strip_prefix("%%") {
            ('p', r)
        } else if let Some(r) = text.strip_prefix('%') {
            ('l', r)
        } else if let Some(r) = text.strip_prefix('#') {
            ('#', r)
        } else if let Some(r) = text.strip_prefix('&') {
            ('&', r)
        } else {
            (' ', text)
        };

        let eval = |s: &str, cpu: &CpuState| {
            self.parse_expression(cpu, s)
                .map_err(|e| format!("{e}"))
                .map(|v| v as u32)
        };

        let linear = match rest.split_once(':') {
            Some((seg_txt, off_txt)) => {
                let seg = eval(seg_txt, cpu)?;
                let off = eval(off_txt, cpu)?;
                let protected = match kind {
                    '#' => true,
                    '&' => false,
                    _ => cpu.protected(),
                };
                if protected {
                    let base = cpu
                        .probe_seg(bus, SegId::Probe, seg as u16)
                        .ok_or_else(|| format!("invalid selector {seg:04X}"))?;
                    base.wrapping_add(off)
                } else {
                    ((seg & 0xFFFF) << 4).wrapping_add(off)
                }
            }
            None => eval(rest, cpu)?,
        };
        Ok(linear & bus.addr_limit())
    }

    /// Executes one command line. Parse problems print a diagnostic and
    /// never disturb the machine.
    pub fn exec_line(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        line: &str,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        self.breaks.sweep_armed(bus);

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(());
        };
        let args = &tokens[1..];

        match cmd.to_ascii_lowercase().as_str() {
            "bl" => self.cmd_break_list(out),
            "br" => self.cmd_break_set(cpu, bus, args, false, out),
            "bw" => self.cmd_break_set(cpu, bus, args, true, out),
            "bc" => self.cmd_break_change(bus, args, Change::Clear, out),
            "bd" => self.cmd_break_change(bus, args, Change::Disable, out),
            "be" => self.cmd_break_change(bus, args, Change::Enable, out),
            "db" => self.cmd_dump(cpu, bus, args, 1, false, out),
            "dw" => self.cmd_dump(cpu, bus, args, 2, false, out),
            "dd" => self.cmd_dump(cpu, bus, args, 4, false, out),
            "dby" => self.cmd_dump(cpu, bus, args, 1, true, out),
            "dwy" => self.cmd_dump(cpu, bus, args, 2, true, out),
            "ddy" => self.cmd_dump(cpu, bus, args, 4, true, out),
            "dh" => self.cmd_dump_history(cpu, bus, args, out),
            "e" => self.cmd_edit(cpu, bus, args, out),
            "g" => self.cmd_go(cpu, bus, args, out),
            "h" => {
                self.breaks.clock().stop("stopped by request");
                writeln!(out, "stopped")
            }
            "p" => self.cmd_print(cpu, args, out),
            "r" | "ra" => self.cmd_registers(cpu, args, cmd.eq_ignore_ascii_case("ra"), out),
            "sh" => self.cmd_history_toggle(bus, args, out),
            "t" => self.cmd_step(cpu, args, out),
            "u" => self.cmd_unassemble(cpu, bus, args, out),
            "?" => self.cmd_help(out),
            other => writeln!(out, "unknown command: {other} (? for help)"),
        }
    }

    fn cmd_break_list(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let list = self.breaks.list();
        if list.is_empty() {
            return writeln!(out, "no breakpoints");
        }
        for (i, bp, write) in list {
            writeln!(
                out,
                "{i}: {} {:06X} {}",
                if write { "write" } else { "read " },
                bp.addr,
                if bp.enabled { "enabled" } else { "disabled" },
            )?;
        }
        Ok(())
    }

    fn cmd_break_set(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        write: bool,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let Some(arg) = args.first() else {
            return writeln!(out, "usage: b{} addr", if write { 'w' } else { 'r' });
        };
        let addr = match self.parse_addr(cpu, bus, arg) {
            Ok(a) => a,
            Err(e) => return writeln!(out, "{e}"),
        };
        match self.breaks.set_break(bus, addr, write) {
            Some(i) => writeln!(out, "breakpoint {i} set at {addr:06X}"),
            None => writeln!(out, "cannot trap {addr:06X} (block already instrumented)"),
        }
    }

    fn cmd_break_change(
        &mut self,
        bus: &mut Bus,
        args: &[&str],
        change: Change,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let Some(&arg) = args.first() else {
            return writeln!(out, "usage: bc|bd|be index|*");
        };
        if arg == "*" {
            match change {
                Change::Clear => self.breaks.clear_all(bus),
                Change::Disable | Change::Enable => {
                    let enable = change == Change::Enable;
                    for (i, _, write) in self.breaks.list() {
                        self.breaks.enable_break(i, write, enable);
                    }
                }
            }
            return writeln!(out, "all breakpoints {}", change.past_tense());
        }
        let Ok(index) = arg.parse::<usize>() else {
            return writeln!(out, "bad breakpoint index {arg:?}");
        };
        let ok = match change {
            Change::Clear => {
                self.breaks.clear_break(bus, index, false)
                    || self.breaks.clear_break(bus, index, true)
            }
            Change::Disable => {
                self.breaks.enable_break(index, false, false)
                    || self.breaks.enable_break(index, true, false)
            }
            Change::Enable => {
                self.breaks.enable_break(index, false, true)
                    || self.breaks.enable_break(index, true, true)
            }
        };
        if ok {
            writeln!(out, "breakpoint {index} {}", change.past_tense())
        } else {
            writeln!(out, "no breakpoint {index}")
        }
    }

    fn cmd_dump(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        item_size: u32,
        binary: bool,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let addr = match args.first() {
            Some(a) => match self.parse_addr(cpu, bus, a) {
                Ok(a) => a,
                Err(e) => return writeln!(out, "{e}"),
            },
            None => self.addr_prev,
        };
        let items = match args.get(1) {
            Some(n) => match self.parse_expression(cpu, n) {
                Ok(v) => (v.max(1) as u32).min(0x1000),
                Err(e) => return writeln!(out, "{e}"),
            },
            None => 128 / item_size,
        };

        let per_line = 16 / item_size;
        let mut cursor = addr;
        let mut remaining = items;
        while remaining > 0 {
            let line_items = remaining.min(per_line);
            write!(out, "{cursor:06X} ")?;
            let mut ascii = String::new();
            for i in 0..line_items {
                let mut value = 0u32;
                for b in 0..item_size {
                    let byte = bus.read_direct(cursor + i * item_size + b);
                    value |= byte << (8 * b);
                    ascii.push(printable(byte as u8));
                }
                if binary {
                    write!(out, " {value:0width$b}", width = (item_size * 8) as usize)?;
                } else {
                    write!(out, " {value:0width$X}", width = (item_size * 2) as usize)?;
                }
            }
            if item_size == 1 && !binary {
                let pad = (per_line - line_items) * 3;
                write!(out, "{:pad$}  {ascii}", "", pad = pad as usize)?;
            }
            writeln!(out)?;
            cursor = cursor.wrapping_add(line_items * item_size) & bus.addr_limit();
            remaining -= line_items;
        }
        self.addr_prev = cursor;
        Ok(())
    }

    fn cmd_dump_history(
        &mut self,
        _cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if !self.breaks.history_enabled() {
            return writeln!(out, "history disabled (sh on)");
        }
        let count = args
            .first()
            .and_then(|a| a.parse::<usize>().ok())
            .unwrap_or(16);
        let tail = self.breaks.history_tail(count);
        if tail.is_empty() {
            return writeln!(out, "history empty");
        }
        for addr in tail {
            let (_, line) = self.dasm_line(bus, addr);
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    fn cmd_edit(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let Some(addr_txt) = args.first() else {
            return writeln!(out, "usage: e addr value...");
        };
        let addr = match self.parse_addr(cpu, bus, addr_txt) {
            Ok(a) => a,
            Err(e) => return writeln!(out, "{e}"),
        };
        for (i, v) in args[1..].iter().enumerate() {
            match self.parse_expression(cpu, v) {
                Ok(value) => bus.write_direct(addr.wrapping_add(i as u32), value as u32),
                Err(e) => return writeln!(out, "{e}"),
            }
        }
        writeln!(out, "{} byte(s) written at {addr:06X}", args.len() - 1)
    }

    fn cmd_go(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if let Some(arg) = args.first() {
            let addr = match self.parse_addr(cpu, bus, arg) {
                Ok(a) => a,
                Err(e) => return writeln!(out, "{e}"),
            };
            if !self.breaks.arm(bus, addr) {
                return writeln!(out, "cannot trap {addr:06X}");
            }
        }
        self.breaks.clock().start();
        writeln!(out, "running")
    }

    fn cmd_print(&mut self, cpu: &CpuState, args: &[&str], out: &mut dyn Write) -> io::Result<()> {
        if args.is_empty() {
            return writeln!(out, "usage: p expr");
        }
        let text = args.join(" ");
        match self.parse_expression(cpu, &text) {
            Ok(v) => writeln!(
                out,
                "{} = {} ({v}.)",
                text,
                to_base_str(v, self.default_base, self.default_bits)
            ),
            Err(e) => writeln!(out, "{e}"),
        }
    }

    fn cmd_registers(
        &mut self,
        cpu: &mut CpuState,
        args: &[&str],
        detail: bool,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if let Some(assign) = args.first() {
            let Some((name, expr)) = assign.split_once('=') else {
                return writeln!(out, "usage: r [reg=expr]");
            };
            let value = match self.parse_expression(cpu, expr) {
                Ok(v) => v as u16,
                Err(e) => return writeln!(out, "{e}"),
            };
            if !cpu.set_reg(name, value) {
                return writeln!(out, "unknown register {name:?}");
            }
        }
        writeln!(out, "{}", cpu.regs_to_string(detail))
    }

    fn cmd_history_toggle(
        &mut self,
        bus: &mut Bus,
        args: &[&str],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let enable = match args.first().copied() {
            Some("on") => true,
            Some("off") => false,
            _ => return writeln!(out, "usage: sh on|off"),
        };
        if self.breaks.enable_history(bus, self.history_limit, enable) {
            writeln!(out, "history {}", if enable { "on" } else { "off" })
        } else {
            writeln!(out, "history already {}", if enable { "on" } else { "off" })
        }
    }

    fn cmd_step(&mut self, cpu: &CpuState, args: &[&str], out: &mut dyn Write) -> io::Result<()> {
        let n = match args.first() {
            Some(a) => match self.parse_expression(cpu, a) {
                Ok(v) => v.max(1) as u32,
                Err(e) => return writeln!(out, "{e}"),
            },
            None => 1,
        };
        self.breaks.clock().on_step(n);
        writeln!(out, "stepping {n}")
    }

    fn cmd_unassemble(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut Bus,
        args: &[&str],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let mut addr = match args.first() {
            Some(a) => match self.parse_addr(cpu, bus, a) {
                Ok(a) => a,
                Err(e) => return writeln!(out, "{e}"),
            },
            None => self.dasm_prev,
        };
        let count = args
            .get(1)
            .and_then(|a| self.parse_expression(cpu, a).ok())
            .unwrap_or(8)
            .max(1);
        for _ in 0..count {
            let (next, line) = self.dasm_line(bus, addr);
            writeln!(out, "{line}")?;
            addr = next;
        }
        self.dasm_prev = addr;
        Ok(())
    }

    fn dasm_line(&self, bus: &mut Bus, addr: u32) -> (u32, String) {
        let mut bytes = [0u8; dasm::MAX_OP_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = bus.read_direct(addr.wrapping_add(i as u32)) as u8;
        }
        let d = dasm::disassemble(&bytes, addr);
        let hex = bytes[..d.len]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let line = format!("{addr:06X}: {hex:<21}  {}", d.text);
        (addr.wrapping_add(d.len as u32), line)
    }

    fn cmd_help(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "\
bc|bd|be i|*     clear / disable / enable breakpoint
bl               list breakpoints
br|bw addr       set read / write breakpoint
db|dw|dd [a] [n] dump bytes / words / dwords ('y' suffix: binary)
dh [n]           dump instruction history
e addr v...      edit memory
g [addr]         run (optionally until addr is read)
h                halt
p expr           print expression
r[a] [reg=expr]  show (all) registers; set register
sh on|off        toggle instruction history
t [n]            step n instructions
u [addr] [n]     unassemble
?                this list"
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Clear,
    Disable,
    Enable,
}

impl Change {
    fn past_tense(self) -> &'static str {
        match self {
            Change::Clear => "cleared",
            Change::Disable => "disabled",
            Change::Enable => "enabled",
        }
    }
}

fn printable(byte: u8) -> char {
    if (0x20..0x7F).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}

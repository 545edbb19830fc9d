#![forbid(unsafe_code)]

//! Native monitor shell: builds a [`machine::Machine`] and feeds it monitor
//! command lines from a script, a `--cmd` string, or interactive stdin.

mod machine;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use machine::{Machine, MachineConfig};

#[derive(Debug, Parser)]
#[command(about = "Interactive monitor for the kestrel 286 core")]
struct Args {
    /// Guest RAM size in KiB.
    #[arg(long, default_value_t = 640)]
    ram: u32,

    /// ROM image to map (raw binary).
    #[arg(long)]
    rom: Option<PathBuf>,

    /// Physical address the ROM image is mapped at.
    #[arg(long, default_value_t = 0xF0000, value_parser = parse_hexish)]
    rom_addr: u32,

    /// Monitor commands to run before going interactive, ';'-separated.
    #[arg(long)]
    cmd: Option<String>,

    /// Script of monitor commands, one per line; exits when done.
    #[arg(long)]
    script: Option<PathBuf>,
}

fn parse_hexish(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let rom_image = match &args.rom {
        Some(path) => Some(
            fs::read(path).with_context(|| format!("failed to read ROM {}", path.display()))?,
        ),
        None => None,
    };

    let mut machine = Machine::new(MachineConfig {
        ram_kib: args.ram,
        rom_addr: args.rom_addr,
        rom_image,
        ..MachineConfig::default()
    })?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(cmds) = &args.cmd {
        for line in cmds.split(';') {
            machine.exec(line, &mut out)?;
        }
        if args.script.is_none() {
            return Ok(());
        }
    }

    if let Some(path) = &args.script {
        let script = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            writeln!(out, "> {line}")?;
            machine.exec(line, &mut out)?;
        }
        return Ok(());
    }

    let stdin = io::stdin();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line == "q" || line == "quit" {
            break;
        }
        machine.exec(line, &mut out)?;
    }
    Ok(())
}

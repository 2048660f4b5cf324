//! Line-oriented octal monitor over an eleven34 machine.
//!
//! One-letter commands, octal arguments, fixed-width octal output. The
//! monitor runs against any `BufRead`/`Write` pair, so sessions are
//! scriptable; the `eleven34` binary wires it to stdin/stdout.

// Octal arguments are range-checked before narrowing.
#![allow(clippy::cast_possible_truncation)]

use std::io::{self, BufRead, Write};

use env_logger as _;
use log::debug;

use eleven34_core::{System, Trap};

const SP: usize = 6;
const PC: usize = 7;

/// Default boot address: the disk loader in the boot ROM.
const BOOT_PC: u16 = 0o173000;
/// Kernel stack set up by the boot command.
const BOOT_SP: u16 = 0o700;

/// An octal command argument.
enum Octal {
    /// No token present.
    Empty,
    /// Present but unparseable or out of range.
    Malformed,
    /// Parsed and in range.
    Value(u32),
}

fn parse_octal(token: Option<&str>, max: u32) -> Octal {
    let Some(token) = token else {
        return Octal::Empty;
    };
    match u32::from_str_radix(token, 8) {
        Ok(value) if value <= max => Octal::Value(value),
        _ => Octal::Malformed,
    }
}

/// The monitor: owns the machine and a command stream.
pub struct Monitor<R, W> {
    system: System,
    input: R,
    output: W,
    /// Rolling start address for the memory-dump command.
    saved_address: u32,
}

impl<R: BufRead, W: Write> Monitor<R, W> {
    /// Creates a monitor over `system`, reading commands from `input`
    /// and reporting on `output`.
    pub fn new(system: System, input: R, output: W) -> Self {
        Self {
            system,
            input,
            output,
            saved_address: 0,
        }
    }

    /// The machine under the monitor.
    #[must_use]
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Command loop: prompt, read, dispatch. Returns on `q` or end of
    /// input.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures on either stream.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            write!(self.output, "-> ")?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let mut tokens = line.split_whitespace();
            let Some(command) = tokens.next() else {
                continue;
            };
            debug!("command: {command}");
            match command {
                "?" => self.help()?,
                "b" => self.boot(tokens.next())?,
                "c" => self.dump_cpu()?,
                "d" => self.dump_memory(tokens.next(), tokens.next())?,
                "g" => self.go(tokens.next())?,
                "h" => self.halt()?,
                "q" => return Ok(()),
                "s" => self.step(tokens.next())?,
                "x" => self.bus_reset()?,
                "z" => self.status()?,
                _ => self.grok()?,
            }
        }
    }

    fn grok(&mut self) -> io::Result<()> {
        writeln!(self.output, "Can't Grok.")
    }

    fn help(&mut self) -> io::Result<()> {
        writeln!(self.output, "?                print this help")?;
        writeln!(self.output, "b [addr]         boot")?;
        writeln!(self.output, "c                processor dump")?;
        writeln!(self.output, "d [addr] [addr]  memory dump")?;
        writeln!(self.output, "g [addr]         go")?;
        writeln!(self.output, "h                halt")?;
        writeln!(self.output, "q                quit")?;
        writeln!(self.output, "s [addr]         step and dump")?;
        writeln!(self.output, "x                bus reset")?;
        writeln!(self.output, "z                device status")
    }

    /// Boot: bus reset, kernel stack and PSW, PC to the loader (or the
    /// given address), then start.
    fn boot(&mut self, arg: Option<&str>) -> io::Result<()> {
        let addr = match parse_octal(arg, 0o177777) {
            Octal::Empty => u32::from(BOOT_PC),
            Octal::Malformed => return self.grok(),
            Octal::Value(value) => value,
        };
        if !self.system.cpu().is_executing() {
            self.system.bus().reset();
            self.system.cpu().set_psw(0o340);
            self.system.cpu().set_register(SP, BOOT_SP);
            self.system.cpu().set_register(PC, addr as u16);
            if self.system.cpu().start_execution(false) {
                return Ok(());
            }
        }
        writeln!(self.output, "** boot failed **")
    }

    fn go(&mut self, arg: Option<&str>) -> io::Result<()> {
        let addr = match parse_octal(arg, 0o177777) {
            Octal::Empty => None,
            Octal::Malformed => return self.grok(),
            Octal::Value(value) => Some(value as u16),
        };
        if !self.system.cpu().is_executing() {
            if let Some(addr) = addr {
                self.system.cpu().set_register(PC, addr);
            }
            if self.system.cpu().start_execution(false) {
                return Ok(());
            }
        }
        writeln!(self.output, "** go failed **")
    }

    fn halt(&mut self) -> io::Result<()> {
        if self.system.cpu().is_executing() && self.system.cpu().stop_execution() {
            return Ok(());
        }
        writeln!(self.output, "** halt failed **")
    }

    fn step(&mut self, arg: Option<&str>) -> io::Result<()> {
        let addr = match parse_octal(arg, 0o177777) {
            Octal::Empty => None,
            Octal::Malformed => return self.grok(),
            Octal::Value(value) => Some(value as u16),
        };
        if !self.system.cpu().is_executing() {
            if let Some(addr) = addr {
                self.system.cpu().set_register(PC, addr);
            }
            if self.system.cpu().start_execution(true) {
                // The step is brief; settle before dumping state.
                while self.system.cpu().is_executing() {
                    std::thread::yield_now();
                }
                return self.dump_cpu();
            }
        }
        writeln!(self.output, "** step failed **")
    }

    fn bus_reset(&mut self) -> io::Result<()> {
        if !self.system.cpu().is_executing() {
            self.system.bus().reset();
            return Ok(());
        }
        writeln!(self.output, "** reset failed **")
    }

    fn status(&mut self) -> io::Result<()> {
        for info in self.system.bus().device_table() {
            writeln!(
                self.output,
                "{:<10} {:06o} {:>3} {}",
                info.name,
                info.base,
                info.size,
                if info.standard { "standard" } else { "" }
            )?;
        }
        Ok(())
    }

    fn dump_cpu(&mut self) -> io::Result<()> {
        let cpu = self.system.cpu();
        let running = if cpu.is_executing() {
            "running"
        } else {
            "stopped"
        };
        let psw = cpu.psw();
        writeln!(self.output, "CPU={running} PSW={}", decode_psw(psw))?;
        let regs = cpu.registers();
        for (index, value) in regs.iter().enumerate() {
            write!(self.output, "R{index}={value:06o} ")?;
            if index == 3 {
                writeln!(self.output)?;
            }
        }
        writeln!(self.output)?;
        let stacks = cpu.stack_shadows();
        for (mode, value) in stacks.iter().enumerate() {
            write!(self.output, "SP{mode}={value:06o} ")?;
        }
        writeln!(self.output)?;
        writeln!(
            self.output,
            "MMR0={:06o} MMR2={:06o}",
            self.system.mmu().mmr0(),
            self.system.mmu().mmr2()
        )
    }

    /// Octal memory dump, eight words per row, `XXXXXX` where the bus
    /// times out. The next dump continues where this one stopped.
    fn dump_memory(&mut self, first: Option<&str>, second: Option<&str>) -> io::Result<()> {
        let mut start = match parse_octal(first, 0o777777) {
            Octal::Empty => self.saved_address,
            Octal::Malformed => return self.grok(),
            Octal::Value(value) => value,
        } & !1;
        let end = match parse_octal(second, 0o777777) {
            Octal::Empty => (start + 14).min(0o777776),
            Octal::Malformed => return self.grok(),
            Octal::Value(value) => value,
        } & !1;
        if end < start {
            return self.grok();
        }
        self.saved_address = if end + 2 > 0o777776 { 0 } else { end + 2 };
        let mut column = 0;
        while start <= end {
            if column == 0 {
                write!(self.output, "{start:06o} ")?;
            }
            match self.system.bus().read(start) {
                Ok(data) => write!(self.output, "{data:06o} ")?,
                Err(Trap::BusTimeout) => write!(self.output, "XXXXXX ")?,
                Err(_) => write!(self.output, "?????? ")?,
            }
            column += 1;
            if column == 8 {
                column = 0;
                writeln!(self.output)?;
            }
            start += 2;
        }
        if column > 0 {
            writeln!(self.output)?;
        }
        Ok(())
    }
}

/// Renders a PSW as octal plus decoded mode, priority, and condition
/// fields.
#[must_use]
pub fn decode_psw(psw: u16) -> String {
    let mode = |bits: u16| match bits {
        0 => "K",
        3 => "U",
        _ => "invalid",
    };
    let mut codes = String::new();
    for (bit, letter) in [(0o20, 'T'), (0o10, 'N'), (0o4, 'Z'), (0o2, 'V'), (0o1, 'C')] {
        if psw & bit != 0 {
            codes.push(letter);
        }
    }
    format!(
        "{psw:06o} [CM={} PM={} PR={} CC={codes}]",
        mode((psw >> 14) & 0o3),
        mode((psw >> 12) & 0o3),
        (psw >> 5) & 0o7
    )
}

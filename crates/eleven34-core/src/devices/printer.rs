//! LP11-style line printer.
//!
//! Two registers: a control/status word and a write-only data buffer.
//! Output appends to a host file assigned at run time; with no file
//! assigned the controller shows the error bit. A short delay separates
//! accepting a character from going ready again.

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::bus::Bus;
use crate::device::Device;
use crate::lock;
use crate::trap::Trap;

/// Base bus address of the register pair.
pub const PRINTER_ADDRESS: u32 = 0o777514;
/// Register pair size in words.
pub const PRINTER_WORDS: u16 = 2;
/// Interrupt vector.
pub const PRINTER_VECTOR: u16 = 0o200;
/// Bus-request level.
pub const PRINTER_LEVEL: u8 = 4;

/// Error bit: no output file, or the last write failed.
pub const PRINTER_ERR: u16 = 0o100000;
/// Ready bit.
pub const PRINTER_READY: u16 = 0o200;
/// Interrupt-enable bit.
pub const PRINTER_IE: u16 = 0o100;

/// Instructions until the printer goes ready again after a character.
const PRINT_DELAY: i64 = 500;

struct PrinterState {
    csr: u16,
    file: Option<File>,
}

/// The printer device.
pub struct Printer {
    bus: Arc<Bus>,
    this: Weak<Self>,
    state: Mutex<PrinterState>,
}

impl Printer {
    /// Creates the printer, unassigned, and binds its registers on the
    /// bus.
    #[must_use]
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        let printer = Arc::new_cyclic(|this| Self {
            bus: bus.clone(),
            this: this.clone(),
            state: Mutex::new(PrinterState {
                csr: PRINTER_ERR,
                file: None,
            }),
        });
        bus.register_device(printer.clone(), PRINTER_ADDRESS, PRINTER_WORDS, "LP11", false);
        printer
    }

    /// Assigns (or replaces) the output file, opened for append, and
    /// clears the error state.
    ///
    /// # Errors
    ///
    /// Propagates the open failure; the printer stays in error state.
    pub fn assign<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut state = lock(&self.state);
        state.file = None;
        state.csr = PRINTER_ERR;
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        state.file = Some(file);
        state.csr = PRINTER_READY;
        Ok(())
    }

    fn request_interrupt(&self) {
        if let Some(me) = self.this.upgrade() {
            if let Err(err) = self.bus.schedule_interrupt(me, PRINTER_LEVEL, PRINTER_VECTOR) {
                error!("printer dropped an interrupt: {err}");
            }
        }
    }

    fn schedule_ready(&self) {
        if let Some(me) = self.this.upgrade() {
            if let Err(err) = self.bus.schedule_event(me, PRINT_DELAY, 0) {
                error!("printer stuck busy: {err}");
            }
        }
    }
}

impl Device for Printer {
    fn reset(&self) {
        let mut state = lock(&self.state);
        state.csr = if state.file.is_some() {
            PRINTER_READY
        } else {
            PRINTER_ERR
        };
    }

    fn read(&self, addr: u32) -> Result<u16, Trap> {
        match addr - PRINTER_ADDRESS {
            0 => Ok(lock(&self.state).csr),
            // The data buffer always reads back as zero.
            2 => Ok(0),
            _ => Err(Trap::BusTimeout),
        }
    }

    fn write(&self, addr: u32, data: u16) -> Result<(), Trap> {
        let mut wake = false;
        {
            let mut state = lock(&self.state);
            match addr - PRINTER_ADDRESS {
                0 => {
                    if state.csr & PRINTER_IE == 0
                        && data & PRINTER_IE != 0
                        && state.csr & (PRINTER_READY | PRINTER_ERR) != 0
                    {
                        wake = true;
                    }
                    state.csr = (state.csr & !PRINTER_IE) | (data & PRINTER_IE);
                }
                2 => {
                    if state.csr & PRINTER_READY != 0 {
                        let byte = [(data & 0o177) as u8];
                        let failed = match state.file.as_mut() {
                            Some(file) => {
                                file.write_all(&byte).and_then(|()| file.flush()).is_err()
                            }
                            None => true,
                        };
                        if failed {
                            state.file = None;
                            state.csr |= PRINTER_ERR;
                        } else {
                            state.csr &= !PRINTER_READY;
                        }
                        wake = true;
                    }
                }
                _ => return Err(Trap::BusTimeout),
            }
        }
        if wake {
            self.schedule_ready();
        }
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        if addr & 1 != 0 {
            return Ok(());
        }
        self.write(addr, u16::from(data))
    }

    /// Delay expiry: recompute ready/error from the file state and
    /// interrupt if enabled.
    fn event_service(&self, _data: u16) {
        let fire = {
            let mut state = lock(&self.state);
            state.csr &= !(PRINTER_READY | PRINTER_ERR);
            if state.file.is_some() {
                state.csr |= PRINTER_READY;
            } else {
                state.csr |= PRINTER_ERR;
            }
            state.csr & PRINTER_IE != 0
        };
        if fire {
            self.request_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Printer, PRINTER_ADDRESS, PRINTER_ERR, PRINTER_IE, PRINTER_READY, PRINTER_VECTOR};
    use crate::bus::Bus;
    use std::io::Read;

    #[test]
    fn unassigned_printer_shows_the_error_bit() {
        let bus = Bus::new(0o1000);
        let _printer = Printer::new(&bus);
        assert_eq!(bus.read(PRINTER_ADDRESS).unwrap(), PRINTER_ERR);
    }

    #[test]
    fn characters_append_to_the_assigned_file() {
        let bus = Bus::new(0o1000);
        let printer = Printer::new(&bus);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listing.txt");
        printer.assign(&path).unwrap();
        assert_eq!(bus.read(PRINTER_ADDRESS).unwrap(), PRINTER_READY);

        for &byte in b"ok" {
            bus.write(PRINTER_ADDRESS + 2, u16::from(byte)).unwrap();
            assert_eq!(bus.read(PRINTER_ADDRESS).unwrap() & PRINTER_READY, 0);
            bus.run_events(500);
        }
        let mut written = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut written)
            .unwrap();
        assert_eq!(written, "ok");
    }

    #[test]
    fn ready_interrupt_fires_after_the_delay_when_enabled() {
        let bus = Bus::new(0o1000);
        let printer = Printer::new(&bus);
        let dir = tempfile::tempdir().unwrap();
        printer.assign(dir.path().join("out")).unwrap();
        bus.write(PRINTER_ADDRESS, PRINTER_IE).unwrap();
        bus.run_events(500);
        let pending = bus.run_interrupts(0).unwrap();
        assert_eq!(pending.vector, PRINTER_VECTOR);
    }

    #[test]
    fn failed_assignment_leaves_the_printer_in_error_state() {
        let bus = Bus::new(0o1000);
        let printer = Printer::new(&bus);
        let dir = tempfile::tempdir().unwrap();
        printer.assign(dir.path().join("out")).unwrap();
        // A directory is not openable for append; the old file is gone
        // either way.
        assert!(printer.assign(dir.path()).is_err());
        assert_eq!(bus.read(PRINTER_ADDRESS).unwrap(), PRINTER_ERR);
        // Not ready, so the character is discarded without an event.
        bus.write(PRINTER_ADDRESS + 2, u16::from(b'x')).unwrap();
        assert_eq!(bus.read(PRINTER_ADDRESS).unwrap(), PRINTER_ERR);
    }
}

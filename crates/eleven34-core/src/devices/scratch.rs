//! Diagnostic scratch registers: eight read/write words in the I/O page
//! with no side effects, handy for exercising the bus from test programs.

use std::sync::{Arc, Mutex};

use crate::bus::Bus;
use crate::device::{merge_byte, Device};
use crate::lock;
use crate::trap::Trap;

/// Base bus address of the register file.
pub const SCRATCH_ADDRESS: u32 = 0o760100;
/// Register file size in words.
pub const SCRATCH_WORDS: u16 = 8;

/// The scratch register file.
pub struct Scratch {
    words: Mutex<[u16; SCRATCH_WORDS as usize]>,
}

impl Scratch {
    /// Creates the register file, zeroed, and binds it on the bus.
    #[must_use]
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        let scratch = Arc::new(Self {
            words: Mutex::new([0; SCRATCH_WORDS as usize]),
        });
        bus.register_device(scratch.clone(), SCRATCH_ADDRESS, SCRATCH_WORDS, "SCRATCH", false);
        scratch
    }

    fn index(addr: u32) -> usize {
        ((addr - SCRATCH_ADDRESS) >> 1) as usize % (SCRATCH_WORDS as usize)
    }
}

impl Device for Scratch {
    fn reset(&self) {
        *lock(&self.words) = [0; SCRATCH_WORDS as usize];
    }

    fn read(&self, addr: u32) -> Result<u16, Trap> {
        Ok(lock(&self.words)[Self::index(addr)])
    }

    fn write(&self, addr: u32, data: u16) -> Result<(), Trap> {
        lock(&self.words)[Self::index(addr)] = data;
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        let mut words = lock(&self.words);
        let index = Self::index(addr);
        words[index] = merge_byte(words[index], addr, data);
        Ok(())
    }
}

//! Boot ROM.
//!
//! A 256-word read-only window holding hand-assembled bootstrap loaders,
//! selected by address bits 7-8 and repeating through each 64-word bank.
//! Word writes are ignored, as writes to ROM are.

use std::sync::Arc;

use crate::bus::Bus;
use crate::device::Device;
use crate::trap::Trap;

/// Default base address of the ROM window.
pub const BOOT_ADDRESS: u32 = 0o773000;
/// Window size in words.
pub const BOOT_WORDS: u16 = 256;

/// Bootstrap for an RL-family disk: seek to the start, read the home
/// block into low memory, and jump to it.
const RL_LOADER: [u16; 33] = [
    0o012737, // mov #10,@#174400
    0o000010,
    0o174400,
    0o105737, // tstb @#174400
    0o174400,
    0o100375, // bpl .-4
    0o013700, // mov @#174406,r0
    0o174406,
    0o042700, // bic #177,r0
    0o000177,
    0o052700, // bis #1,r0
    0o000001,
    0o010037, // mov r0,@#174404
    0o174404,
    0o012737, // mov #6,@#174400
    0o000006,
    0o174400,
    0o105737, // tstb @#174400
    0o174400,
    0o100375, // bpl .-4
    0o012700, // mov #174406,r0
    0o174406,
    0o012710, // mov #177400,(r0)
    0o177400,
    0o005040, // clr -(r0)
    0o005040, // clr -(r0)
    0o012740, // mov #14,-(r0)
    0o000014,
    0o105737, // tstb @#174400
    0o174400,
    0o100375, // bpl .-4
    0o005000, // clr r0
    0o000110, // jmp (r0)
];

/// Bootstrap for a TM-family tape: rewind, read the first record, jump
/// to zero.
const TM_LOADER: [u16; 11] = [
    0o012700, // mov #172526,r0
    0o172526,
    0o010040, // mov r0,-(r0)
    0o012740, // mov #60003,-(r0)
    0o060003,
    0o012700, // mov #172522,r0
    0o172522,
    0o105710, // tstb (r0)
    0o100376, // bpl .-2
    0o005000, // clr r0
    0o000110, // jmp (r0)
];

/// The ROM device. Stateless; all content is baked in.
pub struct BootRom;

impl BootRom {
    /// Creates the ROM and binds its window on the bus.
    #[must_use]
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        let rom = Arc::new(Self);
        bus.register_device(rom.clone(), BOOT_ADDRESS, BOOT_WORDS, "BOOTROMS", false);
        rom
    }
}

impl Device for BootRom {
    fn reset(&self) {}

    fn read(&self, addr: u32) -> Result<u16, Trap> {
        let offset = ((addr - BOOT_ADDRESS) & 0o177) >> 1;
        let bank = ((addr - BOOT_ADDRESS) & 0o600) >> 7;
        let word = match bank {
            0 => RL_LOADER[offset as usize % RL_LOADER.len()],
            1 => TM_LOADER[offset as usize % TM_LOADER.len()],
            _ => 0,
        };
        Ok(word)
    }

    fn write(&self, _addr: u32, _data: u16) -> Result<(), Trap> {
        Ok(())
    }

    fn write_byte(&self, _addr: u32, _data: u8) -> Result<(), Trap> {
        Err(Trap::Unimplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::{BootRom, BOOT_ADDRESS, RL_LOADER, TM_LOADER};
    use crate::bus::Bus;

    #[test]
    fn bank_zero_serves_the_disk_loader_and_repeats() {
        let bus = Bus::new(0o1000);
        let _rom = BootRom::new(&bus);
        assert_eq!(bus.read(BOOT_ADDRESS).unwrap(), 0o012737);
        assert_eq!(bus.read(BOOT_ADDRESS + 2).unwrap(), 0o000010);
        // 64-word bank wraps over the 33-word loader.
        let wrapped = BOOT_ADDRESS + 2 * u32::try_from(RL_LOADER.len()).unwrap();
        assert_eq!(bus.read(wrapped).unwrap(), RL_LOADER[0]);
    }

    #[test]
    fn bank_one_serves_the_tape_loader() {
        let bus = Bus::new(0o1000);
        let _rom = BootRom::new(&bus);
        assert_eq!(bus.read(BOOT_ADDRESS + 0o200).unwrap(), TM_LOADER[0]);
        assert_eq!(bus.read(BOOT_ADDRESS + 0o600).unwrap(), 0);
    }

    #[test]
    fn word_writes_are_ignored() {
        let bus = Bus::new(0o1000);
        let _rom = BootRom::new(&bus);
        bus.write(BOOT_ADDRESS, 0o123456).unwrap();
        assert_eq!(bus.read(BOOT_ADDRESS).unwrap(), 0o012737);
    }
}

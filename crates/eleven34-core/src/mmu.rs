//! KT11-style paged memory management.
//!
//! Translation maps a 16-bit logical address plus an access-mode context
//! into an 18-bit physical bus address through per-page descriptor and
//! relocation register pairs, one 8-entry set each for kernel and user
//! mode. A disallowed translation reconstructs the cause into MMR0 and
//! raises [`Trap::Segmentation`]; once a fault is latched, neither MMR0's
//! fault fields nor the MMR2 fetch capture update again until the abort
//! bits are cleared ("first fault wins").
//!
//! The MMU is itself a bus device: MMR0/MMR1/MMR2 and the four register
//! files are memory mapped at the architecture's fixed addresses.

// 16-bit register arithmetic trips the cast lints constantly.
#![allow(clippy::cast_possible_truncation)]

use std::sync::{Arc, Mutex};

use log::trace;

use crate::bus::Bus;
use crate::device::{merge_byte, Device};
use crate::lock;
use crate::trap::Trap;

/// Base address of the MMR0/MMR1/MMR2 status block.
pub const MMR_BASE: u32 = 0o777572;
/// MMR0: enable bit and fault-reconstruction fields.
pub const MMR0_ADDRESS: u32 = 0o777572;
/// MMR1: unimplemented, reads zero.
pub const MMR1_ADDRESS: u32 = 0o777574;
/// MMR2: logical fetch-address capture.
pub const MMR2_ADDRESS: u32 = 0o777576;
/// Kernel page descriptor registers (8 words).
pub const KERNEL_DESCRIPTOR_BASE: u32 = 0o772300;
/// Kernel page address (relocation) registers (8 words).
pub const KERNEL_ADDRESS_BASE: u32 = 0o772340;
/// User page descriptor registers (8 words).
pub const USER_DESCRIPTOR_BASE: u32 = 0o777600;
/// User page address (relocation) registers (8 words).
pub const USER_ADDRESS_BASE: u32 = 0o777640;

/// MMR0 enable bit: translation is active when set.
pub const MMR0_ENABLE: u16 = 0o1;
/// MMR0 abort bit: page not resident.
pub const MMR0_ABORT_NONRESIDENT: u16 = 0o100000;
/// MMR0 abort bit: page length violation.
pub const MMR0_ABORT_LENGTH: u16 = 0o40000;
/// MMR0 abort bit: write to a read-only page.
pub const MMR0_ABORT_READONLY: u16 = 0o20000;
/// Mask of all three MMR0 abort bits.
pub const MMR0_ABORT_MASK: u16 = 0o160000;

/// Descriptor bit: page is resident.
pub const PDR_RESIDENT: u16 = 0o2;
/// Descriptor bit: page is writable.
pub const PDR_WRITABLE: u16 = 0o4;
/// Descriptor bit: page expands downward.
pub const PDR_EXPAND_DOWN: u16 = 0o10;
/// Descriptor bit: page has been written.
pub const PDR_WRITTEN: u16 = 0o100;

// MMR0 fault fields cleared before latching a new cause: mode (bits 6-5),
// page (bits 3-1).
const MMR0_FAULT_FIELDS: u16 = 0o156;
// Writable MMR0 bits: abort bits plus the implemented low field.
const MMR0_WRITE_MASK: u16 = 0o160157;
// Writable descriptor bits; the written bit always clears on a write.
const PDR_WRITE_MASK: u16 = 0o77416;
const PDR_CLEAR_MASK: u16 = 0o77516;

/// Direction of a translated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read or instruction fetch.
    Read,
    /// Data write.
    Write,
}

/// Which mode field of the supplied PSW selects the page set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Current-mode field (PSW bits 15-14).
    Current,
    /// Previous-mode field (PSW bits 13-12), for MFPI/MTPI.
    Previous,
    /// Forced kernel context, for vector reads.
    Kernel,
}

struct MmuState {
    mmr0: u16,
    mmr2: u16,
    kernel_descriptors: [u16; 8],
    kernel_addresses: [u16; 8],
    user_descriptors: [u16; 8],
    user_addresses: [u16; 8],
}

impl MmuState {
    const fn new() -> Self {
        Self {
            mmr0: 0,
            mmr2: 0,
            kernel_descriptors: [0; 8],
            kernel_addresses: [0; 8],
            user_descriptors: [0; 8],
            user_addresses: [0; 8],
        }
    }

    fn fault_latched(&self) -> bool {
        self.mmr0 & MMR0_ABORT_MASK != 0
    }

    /// Records a fault cause unless one is already latched. `abort` is the
    /// primary failing check; `extra` carries the secondary condition bits
    /// the hardware reconstructs alongside a length abort.
    fn latch_fault(&mut self, abort: u16, extra: u16, mode_bits: u16, page: u16) {
        if self.fault_latched() {
            return;
        }
        self.mmr0 &= !MMR0_FAULT_FIELDS;
        self.mmr0 |= abort | extra | mode_bits | (page << 1);
    }
}

/// The memory management unit.
pub struct Mmu {
    state: Mutex<MmuState>,
}

impl Mmu {
    /// Creates the MMU and binds its five register ranges on `bus`.
    #[must_use]
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        let mmu = Arc::new(Self {
            state: Mutex::new(MmuState::new()),
        });
        let device: Arc<dyn Device> = mmu.clone();
        bus.register_device(device.clone(), MMR_BASE, 3, "MMR", true);
        bus.register_device(device.clone(), KERNEL_DESCRIPTOR_BASE, 8, "KISD", true);
        bus.register_device(device.clone(), KERNEL_ADDRESS_BASE, 8, "KISA", true);
        bus.register_device(device.clone(), USER_DESCRIPTOR_BASE, 8, "UISD", true);
        bus.register_device(device, USER_ADDRESS_BASE, 8, "UISA", true);
        mmu
    }

    /// Captures the logical address of the instruction about to be fetched
    /// into MMR2, unless a fault is latched.
    pub fn record_fetch(&self, pc: u16) {
        let mut state = lock(&self.state);
        if !state.fault_latched() {
            state.mmr2 = pc;
        }
    }

    /// Translates logical `addr` into a physical bus address.
    ///
    /// With the MMU disabled this is the identity transform, except that
    /// references into the top 4K of the logical space are offset into the
    /// physical I/O page. With it enabled, the page selected by `space` and
    /// the mode fields of `psw` is checked in fixed order: length limit
    /// (honoring the expansion direction), then the resident bit, then
    /// (writes only) the write-permission bit. The first failing check is
    /// reconstructed into MMR0. A successful write sets the page's written
    /// bit.
    ///
    /// # Errors
    ///
    /// [`Trap::Segmentation`] when the translation is disallowed.
    pub fn map(&self, addr: u16, access: Access, space: Space, psw: u16) -> Result<u32, Trap> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.mmr0 & MMR0_ENABLE == 0 {
            let physical = if addr >= 0o160000 {
                u32::from(addr) + 0o600000
            } else {
                u32::from(addr)
            };
            return Ok(physical);
        }

        let page = usize::from(addr >> 13) & 0o7;
        let block = (addr >> 6) & 0o177;
        let mode = match space {
            Space::Kernel => 0,
            Space::Current => (psw >> 14) & 0o3,
            Space::Previous => (psw >> 12) & 0o3,
        };

        let (descriptor, relocation, mode_bits) = match mode {
            0 => (
                state.kernel_descriptors[page],
                u32::from(state.kernel_addresses[page]) << 6,
                0,
            ),
            3 => (
                state.user_descriptors[page],
                u32::from(state.user_addresses[page]) << 6,
                0o140,
            ),
            invalid => {
                let mode_bits = invalid << 5;
                let page = page as u16;
                state.latch_fault(MMR0_ABORT_NONRESIDENT, 0, mode_bits, page);
                trace!("map abort: invalid mode {invalid} page {page}");
                return Err(Trap::Segmentation);
            }
        };
        let limit = (descriptor >> 8) & 0o177;
        let out_of_bounds = if descriptor & PDR_EXPAND_DOWN != 0 {
            block < limit
        } else {
            block > limit
        };

        let is_write = access == Access::Write;
        if out_of_bounds {
            let mut extra = 0;
            if descriptor & PDR_RESIDENT == 0 {
                extra |= MMR0_ABORT_NONRESIDENT;
            }
            if is_write && descriptor & PDR_WRITABLE == 0 {
                extra |= MMR0_ABORT_READONLY;
            }
            state.latch_fault(MMR0_ABORT_LENGTH, extra, mode_bits, page as u16);
            return Err(Trap::Segmentation);
        }

        if descriptor & PDR_RESIDENT == 0 {
            let extra = if is_write && descriptor & PDR_WRITABLE == 0 {
                MMR0_ABORT_READONLY
            } else {
                0
            };
            state.latch_fault(MMR0_ABORT_NONRESIDENT, extra, mode_bits, page as u16);
            return Err(Trap::Segmentation);
        }

        if is_write {
            if descriptor & PDR_WRITABLE == 0 {
                state.latch_fault(MMR0_ABORT_READONLY, 0, mode_bits, page as u16);
                return Err(Trap::Segmentation);
            }
            if mode == 0 {
                state.kernel_descriptors[page] |= PDR_WRITTEN;
            } else {
                state.user_descriptors[page] |= PDR_WRITTEN;
            }
        }

        Ok(relocation + u32::from(addr & 0o17777))
    }

    /// Current MMR0 value, for control surfaces that bypass the bus.
    #[must_use]
    pub fn mmr0(&self) -> u16 {
        lock(&self.state).mmr0
    }

    /// Current MMR2 value.
    #[must_use]
    pub fn mmr2(&self) -> u16 {
        lock(&self.state).mmr2
    }
}

impl Device for Mmu {
    fn reset(&self) {
        lock(&self.state).mmr0 = 0;
    }

    fn read(&self, addr: u32) -> Result<u16, Trap> {
        let state = lock(&self.state);
        let index = (addr as usize & 0o16) >> 1;
        match addr & 0o777760 {
            KERNEL_DESCRIPTOR_BASE => Ok(state.kernel_descriptors[index]),
            KERNEL_ADDRESS_BASE => Ok(state.kernel_addresses[index]),
            USER_DESCRIPTOR_BASE => Ok(state.user_descriptors[index]),
            USER_ADDRESS_BASE => Ok(state.user_addresses[index]),
            _ => match addr {
                MMR0_ADDRESS => Ok(state.mmr0),
                MMR1_ADDRESS => Ok(0),
                MMR2_ADDRESS => Ok(state.mmr2),
                _ => Err(Trap::BusTimeout),
            },
        }
    }

    fn write(&self, addr: u32, data: u16) -> Result<(), Trap> {
        let mut state = lock(&self.state);
        let index = (addr as usize & 0o16) >> 1;
        match addr & 0o777760 {
            KERNEL_DESCRIPTOR_BASE => {
                state.kernel_descriptors[index] &= !PDR_CLEAR_MASK;
                state.kernel_descriptors[index] |= data & PDR_WRITE_MASK;
            }
            KERNEL_ADDRESS_BASE => {
                state.kernel_addresses[index] = data & 0o7777;
                state.kernel_descriptors[index] &= !PDR_WRITTEN;
            }
            USER_DESCRIPTOR_BASE => {
                state.user_descriptors[index] &= !PDR_CLEAR_MASK;
                state.user_descriptors[index] |= data & PDR_WRITE_MASK;
            }
            USER_ADDRESS_BASE => {
                state.user_addresses[index] = data & 0o7777;
                state.user_descriptors[index] &= !PDR_WRITTEN;
            }
            _ => match addr {
                MMR0_ADDRESS => {
                    state.mmr0 &= !MMR0_WRITE_MASK;
                    state.mmr0 |= data & MMR0_WRITE_MASK;
                }
                // MMR1/MMR2 accept writes without effect.
                MMR1_ADDRESS | MMR2_ADDRESS => {}
                _ => return Err(Trap::BusTimeout),
            },
        }
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        let word_addr = addr & !1;
        let word = self.read(word_addr)?;
        self.write(word_addr, merge_byte(word, addr, data))
    }
}

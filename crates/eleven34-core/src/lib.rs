//! Core emulation crate for the eleven34 machine: a 16-bit minicomputer
//! with memory-mapped I/O, an optional relocating MMU, and a small set of
//! standard peripherals.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Trap taxonomy: vectored faults and processor control signals.
pub mod trap;
pub use trap::Trap;

/// The bus device contract.
pub mod device;
pub use device::{merge_byte, Device};

/// Address routing, main memory, and the event/interrupt tables.
pub mod bus;
pub use bus::{
    Bus, DeviceInfo, PendingInterrupt, ScheduleError, DEFAULT_MEMORY_WORDS, TABLE_SLOTS,
};

/// Memory management: relocation, protection, and fault status.
pub mod mmu;
pub use mmu::{Access, Mmu, Space, MMR0_ENABLE};

/// The processor.
pub mod cpu;
pub use cpu::{Cpu, CpuConfig, PSW_ADDRESS};

/// Standard peripherals.
pub mod devices;

/// Whole-machine assembly.
pub mod system;
pub use system::{System, SystemConfig, DEFAULT_CONSOLE_PORT};

/// Locks a mutex, absorbing poisoning: a panicked holder leaves device
/// registers in a sane-enough state for a running machine to continue.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;

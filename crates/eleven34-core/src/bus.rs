//! Address router, main memory, and the deferred-event / pending-interrupt
//! scheduler.
//!
//! The bus owns the memory array and an ordered directory of address-range
//! bindings; reads and writes inside configured memory go straight to the
//! array, everything else is scanned against the directory with the first
//! containing range winning. Two fixed-capacity slot tables hold delayed
//! device events (counted down in units of executed instructions) and
//! pending prioritized interrupts.

use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

use crate::device::{merge_byte, Device};
use crate::lock;
use crate::trap::Trap;

/// Default main memory size in 16-bit words (124 KW).
pub const DEFAULT_MEMORY_WORDS: usize = 124 * 1024;

/// Capacity of each scheduling table.
pub const TABLE_SLOTS: usize = 10;

/// One directory binding: a device claims `size` 16-bit registers starting
/// at physical address `base` (byte span `size * 2`).
#[derive(Clone)]
struct Binding {
    device: Arc<dyn Device>,
    base: u32,
    size: u16,
    name: String,
    standard: bool,
}

impl Binding {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + u32::from(self.size) * 2
    }
}

/// A row of the control surface's device table: the non-device half of a
/// directory binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Base physical address of the claimed range.
    pub base: u32,
    /// Number of 16-bit registers in the range.
    pub size: u16,
    /// Registration name.
    pub name: String,
    /// `true` for the standard (always-present) system devices.
    pub standard: bool,
}

struct EventSlot {
    device: Arc<dyn Device>,
    remaining: i64,
    data: u16,
}

struct InterruptSlot {
    device: Arc<dyn Device>,
    level: u8,
    vector: u16,
}

#[derive(Default)]
struct Tables {
    events: [Option<EventSlot>; TABLE_SLOTS],
    interrupts: [Option<InterruptSlot>; TABLE_SLOTS],
}

/// A pending interrupt removed from the table, ready to be serviced.
pub struct PendingInterrupt {
    /// The interrupting device; its `interrupt_service` callback runs after
    /// the CPU vectors.
    pub device: Arc<dyn Device>,
    /// Bus-request priority level.
    pub level: u8,
    /// Kernel-space vector address.
    pub vector: u16,
}

/// Structural scheduler failure: a slot table had no free entry.
///
/// Distinct from [`Trap`] on purpose; dropping a scheduled event or
/// interrupt corrupts subsequent device behavior, so exhaustion propagates
/// to the caller instead of being logged away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ScheduleError {
    /// No free slot in the delayed-event table.
    #[error("event table full ({TABLE_SLOTS} slots)")]
    EventTableFull,
    /// No free slot in the pending-interrupt table.
    #[error("interrupt table full ({TABLE_SLOTS} slots)")]
    InterruptTableFull,
}

/// The shared address/interrupt bus.
pub struct Bus {
    memory: Mutex<Vec<u16>>,
    directory: Mutex<Vec<Binding>>,
    tables: Mutex<Tables>,
}

impl Bus {
    /// Creates a bus owning `memory_words` words of main memory.
    ///
    /// Memory powers up holding the word-index pattern (word `i` reads
    /// `i & 0o177777`), which diagnostic dumps rely on; [`Bus::reset`]
    /// leaves memory contents alone.
    #[must_use]
    pub fn new(memory_words: usize) -> Arc<Self> {
        let mut memory = Vec::with_capacity(memory_words);
        for word in 0..memory_words {
            memory.push(word as u16);
        }
        Arc::new(Self {
            memory: Mutex::new(memory),
            directory: Mutex::new(Vec::new()),
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Size of main memory in 16-bit words.
    #[must_use]
    pub fn memory_words(&self) -> usize {
        lock(&self.memory).len()
    }

    /// Appends a binding to the device directory.
    ///
    /// Lookups scan in registration order and the first containing range
    /// wins; no overlap validation is performed.
    pub fn register_device(
        &self,
        device: Arc<dyn Device>,
        base: u32,
        size: u16,
        name: &str,
        standard: bool,
    ) {
        lock(&self.directory).push(Binding {
            device,
            base,
            size,
            name: name.to_owned(),
            standard,
        });
    }

    /// Snapshot of the directory for status displays.
    #[must_use]
    pub fn device_table(&self) -> Vec<DeviceInfo> {
        lock(&self.directory)
            .iter()
            .map(|b| DeviceInfo {
                base: b.base,
                size: b.size,
                name: b.name.clone(),
                standard: b.standard,
            })
            .collect()
    }

    /// Resets every bound device in registration order, then clears both
    /// scheduling tables. A device bound under several ranges is reset once
    /// per range; device resets are idempotent.
    pub fn reset(&self) {
        let devices: Vec<Arc<dyn Device>> =
            lock(&self.directory).iter().map(|b| b.device.clone()).collect();
        for device in devices {
            device.reset();
        }
        let mut tables = lock(&self.tables);
        tables.events = Default::default();
        tables.interrupts = Default::default();
    }

    fn lookup(&self, addr: u32) -> Result<(Arc<dyn Device>, u32), Trap> {
        let directory = lock(&self.directory);
        for binding in directory.iter() {
            if binding.contains(addr) {
                return Ok((binding.device.clone(), addr));
            }
        }
        debug!("bus timeout at {addr:06o}");
        Err(Trap::BusTimeout)
    }

    /// Reads the word at physical address `addr`.
    ///
    /// # Errors
    ///
    /// [`Trap::BusTimeout`] when the address is outside main memory and no
    /// registered device claims it, or whatever the owning device raises.
    pub fn read(&self, addr: u32) -> Result<u16, Trap> {
        {
            let memory = lock(&self.memory);
            if let Some(&word) = memory.get(addr as usize >> 1) {
                return Ok(word);
            }
        }
        let (device, addr) = self.lookup(addr)?;
        device.read(addr)
    }

    /// Writes the word at physical address `addr`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Bus::read`].
    pub fn write(&self, addr: u32, data: u16) -> Result<(), Trap> {
        {
            let mut memory = lock(&self.memory);
            let index = addr as usize >> 1;
            if let Some(word) = memory.get_mut(index) {
                *word = data;
                return Ok(());
            }
        }
        let (device, addr) = self.lookup(addr)?;
        device.write(addr, data)
    }

    /// Writes one byte at physical address `addr`, merging into the
    /// containing word for main memory.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Bus::read`], plus [`Trap::Unimplemented`] from
    /// devices without byte access.
    pub fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        {
            let mut memory = lock(&self.memory);
            let index = addr as usize >> 1;
            if let Some(word) = memory.get_mut(index) {
                *word = merge_byte(*word, addr, data);
                return Ok(());
            }
        }
        let (device, addr) = self.lookup(addr)?;
        device.write_byte(addr, data)
    }

    /// Schedules a delayed event: the device's `event_service(data)` fires
    /// once `delay` more instructions have been run past the event clock.
    /// No duplicate suppression is performed.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::EventTableFull`] when every slot is occupied.
    pub fn schedule_event(
        &self,
        device: Arc<dyn Device>,
        delay: i64,
        data: u16,
    ) -> Result<(), ScheduleError> {
        let mut tables = lock(&self.tables);
        for slot in &mut tables.events {
            if slot.is_none() {
                *slot = Some(EventSlot {
                    device,
                    remaining: delay,
                    data,
                });
                return Ok(());
            }
        }
        Err(ScheduleError::EventTableFull)
    }

    /// Clears every pending event owned by `device`.
    pub fn cancel_events(&self, device: &Arc<dyn Device>) {
        let mut tables = lock(&self.tables);
        for slot in &mut tables.events {
            if let Some(event) = slot {
                if Arc::ptr_eq(&event.device, device) {
                    *slot = None;
                }
            }
        }
    }

    /// Advances the event clock by `elapsed` instructions.
    ///
    /// Every pending slot is decremented; slots reaching zero or below are
    /// freed and fired in table-scan order. Callbacks run after the table
    /// lock is released, so a firing device may schedule again. Callers
    /// must not depend on the firing order among simultaneous expiries.
    pub fn run_events(&self, elapsed: i64) {
        let mut expired: Vec<(Arc<dyn Device>, u16)> = Vec::new();
        {
            let mut tables = lock(&self.tables);
            for slot in &mut tables.events {
                if let Some(event) = slot {
                    event.remaining -= elapsed;
                    if event.remaining <= 0 {
                        expired.push((event.device.clone(), event.data));
                        *slot = None;
                    }
                }
            }
        }
        for (device, data) in expired {
            device.event_service(data);
        }
    }

    /// Schedules a pending interrupt.
    ///
    /// Idempotent: if an identical `(device, level, vector)` triple is
    /// already pending this is a no-op. Otherwise the first free slot is
    /// taken.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::InterruptTableFull`] when every slot is occupied.
    pub fn schedule_interrupt(
        &self,
        device: Arc<dyn Device>,
        level: u8,
        vector: u16,
    ) -> Result<(), ScheduleError> {
        let mut tables = lock(&self.tables);
        for slot in tables.interrupts.iter().flatten() {
            if Arc::ptr_eq(&slot.device, &device) && slot.level == level && slot.vector == vector {
                return Ok(());
            }
        }
        for slot in &mut tables.interrupts {
            if slot.is_none() {
                *slot = Some(InterruptSlot {
                    device,
                    level,
                    vector,
                });
                return Ok(());
            }
        }
        Err(ScheduleError::InterruptTableFull)
    }

    /// Removes every pending interrupt matching the exact triple.
    pub fn cancel_interrupt(&self, device: &Arc<dyn Device>, level: u8, vector: u16) {
        let mut tables = lock(&self.tables);
        for slot in &mut tables.interrupts {
            if let Some(pending) = slot {
                if Arc::ptr_eq(&pending.device, device)
                    && pending.level == level
                    && pending.vector == vector
                {
                    *slot = None;
                }
            }
        }
    }

    /// Removes and returns the first pending interrupt (in slot order)
    /// whose level exceeds `threshold`, or `None`.
    pub fn run_interrupts(&self, threshold: u8) -> Option<PendingInterrupt> {
        let mut tables = lock(&self.tables);
        for slot in &mut tables.interrupts {
            if slot.as_ref().is_some_and(|p| p.level > threshold) {
                return slot.take().map(|p| PendingInterrupt {
                    device: p.device,
                    level: p.level,
                    vector: p.vector,
                });
            }
        }
        None
    }

    /// Non-consuming peek with the same predicate as
    /// [`Bus::run_interrupts`].
    #[must_use]
    pub fn waiting_interrupt(&self, threshold: u8) -> bool {
        let tables = lock(&self.tables);
        tables
            .interrupts
            .iter()
            .flatten()
            .any(|p| p.level > threshold)
    }
}

//! KW11-style line clock.
//!
//! One CSR word with a single writable bit, interrupt enable. The
//! execution loop calls [`LineClock::poll`] periodically; the clock
//! compares delivered ticks against wall-clock time and schedules an
//! immediate event for each tick owed, so a stalled loop catches up
//! rather than losing ticks.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::error;

use crate::bus::{Bus, ScheduleError};
use crate::device::Device;
use crate::lock;
use crate::trap::Trap;

/// CSR bus address.
pub const CLOCK_ADDRESS: u32 = 0o777546;
/// Interrupt-enable bit, the only writable bit.
pub const CLOCK_IE: u16 = 0o100;
/// Interrupt vector.
pub const CLOCK_VECTOR: u16 = 0o100;
/// Bus-request level.
pub const CLOCK_LEVEL: u8 = 6;

const HERTZ: u64 = 60;

struct ClockState {
    csr: u16,
    started: Instant,
    ticks: u64,
}

/// The line clock device. See the module docs for the tick model.
pub struct LineClock {
    bus: Arc<Bus>,
    this: Weak<Self>,
    state: Mutex<ClockState>,
}

impl LineClock {
    /// Creates the clock and binds its CSR on the bus.
    #[must_use]
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        let clock = Arc::new_cyclic(|this| Self {
            bus: bus.clone(),
            this: this.clone(),
            state: Mutex::new(ClockState {
                csr: 0,
                started: Instant::now(),
                ticks: 0,
            }),
        });
        bus.register_device(clock.clone(), CLOCK_ADDRESS, 1, "KW11L", true);
        clock
    }

    /// Schedules an immediate tick event if wall-clock time has moved
    /// past the ticks already delivered. At most one tick is owed per
    /// call.
    ///
    /// # Errors
    ///
    /// Propagates [`ScheduleError`] when the event table is full.
    pub fn poll(&self) -> Result<(), ScheduleError> {
        let Some(me) = self.this.upgrade() else {
            return Ok(());
        };
        let owed = {
            let mut state = lock(&self.state);
            let elapsed_ms = state.started.elapsed().as_millis() as u64;
            if state.ticks < HERTZ * elapsed_ms / 1000 {
                state.ticks += 1;
                true
            } else {
                false
            }
        };
        if owed {
            self.bus.schedule_event(me, 0, 0)?;
        }
        Ok(())
    }
}

impl Device for LineClock {
    fn reset(&self) {
        lock(&self.state).csr = 0;
    }

    fn read(&self, _addr: u32) -> Result<u16, Trap> {
        Ok(lock(&self.state).csr)
    }

    fn write(&self, _addr: u32, data: u16) -> Result<(), Trap> {
        let mut state = lock(&self.state);
        state.csr = (state.csr & !CLOCK_IE) | (data & CLOCK_IE);
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        let word = self.read(addr & !1)?;
        self.write(addr & !1, crate::device::merge_byte(word, addr, data))
    }

    /// A tick: if interrupts are enabled, disarm and request one. The
    /// handler re-enables by writing the CSR, which gives one interrupt
    /// per tick however late the loop polls.
    fn event_service(&self, _data: u16) {
        let fire = {
            let mut state = lock(&self.state);
            if state.csr & CLOCK_IE != 0 {
                state.csr &= !CLOCK_IE;
                true
            } else {
                false
            }
        };
        if fire {
            if let Some(me) = self.this.upgrade() {
                if let Err(err) = self.bus.schedule_interrupt(me, CLOCK_LEVEL, CLOCK_VECTOR) {
                    error!("line clock dropped a tick interrupt: {err}");
                }
            }
        }
    }
}

//! Standard peripherals: line clock, boot ROM, serial console, line
//! printer, and the diagnostic scratch registers.
//!
//! Devices that raise their own events or interrupts are built with
//! [`std::sync::Arc::new_cyclic`] so they can hand the bus an owning
//! handle to themselves from inside a callback.

pub mod boot;
pub mod clock;
pub mod console;
pub mod printer;
pub mod scratch;

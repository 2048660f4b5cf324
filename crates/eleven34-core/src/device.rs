//! The capability contract every bus-attached entity implements.

use crate::trap::Trap;

/// A bus-attached device: a peripheral controller, the boot ROM, or one of
/// the memory-mapped CPU/MMU status register blocks.
///
/// Devices are held by the bus as `Arc<dyn Device>` and use interior
/// mutability for their register state; every method takes `&self`.
/// Addresses passed in are full 18-bit physical bus addresses, so a device
/// registered under several ranges can tell them apart.
pub trait Device: Send + Sync {
    /// Reinitializes the device to power-up defaults.
    fn reset(&self);

    /// Reads one 16-bit register.
    ///
    /// # Errors
    ///
    /// [`Trap::BusTimeout`] for an unmapped sub-address.
    fn read(&self, addr: u32) -> Result<u16, Trap>;

    /// Writes one 16-bit register.
    ///
    /// # Errors
    ///
    /// [`Trap::BusTimeout`] for an unmapped sub-address.
    fn write(&self, addr: u32, data: u16) -> Result<(), Trap>;

    /// Writes one byte into a register.
    ///
    /// # Errors
    ///
    /// [`Trap::BusTimeout`] for an unmapped sub-address, or
    /// [`Trap::Unimplemented`] from devices without byte access.
    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap>;

    /// A previously scheduled delayed event fired; `data` is the opaque
    /// payload given to [`crate::bus::Bus::schedule_event`].
    fn event_service(&self, data: u16) {
        let _ = data;
    }

    /// An interrupt from this device was accepted by the CPU.
    ///
    /// Conventionally used to clear device-local interrupt-enable state;
    /// usage is device-specific and not uniform.
    fn interrupt_service(&self) {}
}

/// Merges a byte into the containing word, selecting the half by address
/// parity. The common read-modify-write step of every byte write path.
#[must_use]
pub const fn merge_byte(word: u16, addr: u32, data: u8) -> u16 {
    if addr & 1 == 0 {
        (word & 0o177400) | data as u16
    } else {
        (word & 0o377) | ((data as u16) << 8)
    }
}

#[cfg(test)]
mod tests {
    use super::merge_byte;

    #[test]
    fn even_address_replaces_the_low_byte() {
        assert_eq!(merge_byte(0o123456, 0o1000, 0o377), 0o123777);
    }

    #[test]
    fn odd_address_replaces_the_high_byte() {
        assert_eq!(merge_byte(0o123456, 0o1001, 0o377), 0o177456);
    }
}

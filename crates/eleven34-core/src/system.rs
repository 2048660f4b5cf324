//! Whole-machine assembly: bus, MMU, clock, processor, and the standard
//! peripherals, wired together in dependency order with the execution
//! thread started and parked.

use std::sync::Arc;

use log::info;

use crate::bus::{Bus, DEFAULT_MEMORY_WORDS};
use crate::cpu::{Cpu, CpuConfig};
use crate::devices::boot::BootRom;
use crate::devices::clock::LineClock;
use crate::devices::console::Console;
use crate::devices::printer::Printer;
use crate::devices::scratch::Scratch;
use crate::mmu::Mmu;

/// Default TCP port for the console.
pub const DEFAULT_CONSOLE_PORT: u16 = 2000;

/// Machine assembly parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Main memory size in words.
    pub memory_words: usize,
    /// Processor tunables.
    pub cpu: CpuConfig,
    /// TCP port the console listens on once attached.
    pub console_port: u16,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            memory_words: DEFAULT_MEMORY_WORDS,
            cpu: CpuConfig::default(),
            console_port: DEFAULT_CONSOLE_PORT,
        }
    }
}

/// A complete machine. Dropping it parks the processor; the execution
/// thread is detached and exits with the process.
pub struct System {
    config: SystemConfig,
    bus: Arc<Bus>,
    mmu: Arc<Mmu>,
    cpu: Arc<Cpu>,
    console: Option<Arc<Console>>,
    printer: Option<Arc<Printer>>,
}

impl System {
    /// Assembles the machine. The boot ROM and scratch registers are
    /// always fitted; console and printer attach on demand.
    #[must_use]
    pub fn new(config: SystemConfig) -> Self {
        let bus = Bus::new(config.memory_words);
        let mmu = Mmu::new(&bus);
        let clock = LineClock::new(&bus);
        let cpu = Cpu::new(bus.clone(), mmu.clone(), clock, config.cpu.clone());
        let _ = BootRom::new(&bus);
        let _ = Scratch::new(&bus);
        {
            let cpu = cpu.clone();
            std::thread::Builder::new()
                .name("cpu".into())
                .spawn(move || cpu.run_loop())
                .ok();
        }
        info!(
            "machine assembled with {} words of memory",
            bus.memory_words()
        );
        Self {
            config,
            bus,
            mmu,
            cpu,
            console: None,
            printer: None,
        }
    }

    /// The assembly parameters this machine was built with.
    #[must_use]
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// The bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// The memory management unit.
    #[must_use]
    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    /// The processor.
    #[must_use]
    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    /// Attaches the console on the configured port, once; later calls
    /// return the existing device.
    pub fn attach_console(&mut self) -> Arc<Console> {
        let port = self.config.console_port;
        self.console
            .get_or_insert_with(|| Console::new(&self.bus, port))
            .clone()
    }

    /// Attaches the printer, once; later calls return the existing
    /// device. Output goes nowhere until [`Printer::assign`] succeeds.
    pub fn attach_printer(&mut self) -> Arc<Printer> {
        self.printer
            .get_or_insert_with(|| Printer::new(&self.bus))
            .clone()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{System, SystemConfig};
    use crate::devices::boot::BOOT_ADDRESS;
    use crate::devices::scratch::SCRATCH_ADDRESS;

    fn small() -> System {
        System::new(SystemConfig {
            memory_words: 0o10000,
            ..SystemConfig::default()
        })
    }

    #[test]
    fn standard_devices_answer_on_their_addresses() {
        let system = small();
        assert!(system.bus().read(BOOT_ADDRESS).is_ok());
        assert!(system.bus().read(SCRATCH_ADDRESS).is_ok());
        assert!(system.bus().read(0o777546).is_ok());
        assert!(system.bus().read(0o777776).is_ok());
        assert!(system.bus().read(0o777572).is_ok());
    }

    #[test]
    fn processor_powers_up_parked() {
        let system = small();
        assert!(!system.cpu().is_executing());
        assert_eq!(system.cpu().psw(), 0o340);
    }

    #[test]
    fn attaching_twice_returns_the_same_device() {
        let mut system = small();
        let first = system.attach_printer();
        let second = system.attach_printer();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }
}

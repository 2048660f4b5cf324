//! The processor: register file, PSW, instruction loop, and trap dispatch.
//!
//! The execution loop lives on its own thread and is paced by the bus's
//! event and interrupt tables. A control actor talks to it through a
//! condition-variable handshake: start/stop requests are advisory, observed
//! only at instruction boundaries or inside the WAIT spin, and acknowledged
//! within a bounded retry window.
//!
//! Every memory reference goes through the logical-access layer here, which
//! enforces the odd-address check, asks the MMU for a translation, and
//! short-circuits the processor's own PSW address against the held machine
//! state (external actors reach the PSW through the registered one-word
//! bus device this module also provides).

#![allow(clippy::cast_possible_truncation)]

mod exec;
mod operand;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::bus::{Bus, ScheduleError};
use crate::device::{merge_byte, Device};
use crate::devices::clock::LineClock;
use crate::lock;
use crate::mmu::{Access, Mmu, Space};
use crate::trap::Trap;

/// Physical bus address of the memory-mapped PSW (one word).
pub const PSW_ADDRESS: u32 = 0o777776;

/// Condition code: carry.
pub const PSW_C: u16 = 0o1;
/// Condition code: overflow.
pub const PSW_V: u16 = 0o2;
/// Condition code: zero.
pub const PSW_Z: u16 = 0o4;
/// Condition code: negative.
pub const PSW_N: u16 = 0o10;
/// Trace-trap bit.
pub const PSW_T: u16 = 0o20;

/// Kernel stack-limit low-water mark.
pub const STACK_LIMIT: u16 = 0o400;

pub(crate) const SP: usize = 6;
pub(crate) const PC: usize = 7;
const R5: usize = 5;

/// Tunables for the execution loop and the control handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Instructions between clock polls, event-clock advances, and
    /// interrupt drains. Zero polls after every instruction, which the
    /// processor trap diagnostics require.
    pub poll_interval: u32,
    /// Sleep between WAIT-spin rounds when no interrupt qualifies.
    pub wait_sleep: Duration,
    /// Acknowledgment wait per handshake retry.
    pub sync_interval: Duration,
    /// Handshake retries before start/stop reports failure.
    pub sync_retries: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            poll_interval: 50,
            wait_sleep: Duration::from_millis(10),
            sync_interval: Duration::from_secs(1),
            sync_retries: 3,
        }
    }
}

/// Register, PSW, and per-instruction bookkeeping state. One coarse lock;
/// the execution loop is the only writer during a run.
pub(crate) struct Machine {
    pub(crate) regs: [u16; 8],
    pub(crate) stacks: [u16; 4],
    pub(crate) psw: u16,
    pub(crate) ir: u16,
    /// Set during operand addressing when a kernel SP decrement crossed
    /// the stack limit; serviced after the instruction completes.
    pub(crate) stack_check: bool,
    /// Destination address saved by deferred-store operand resolution.
    pub(crate) saved_address: u16,
}

impl Machine {
    const fn new() -> Self {
        Self {
            regs: [0; 8],
            stacks: [0; 4],
            psw: 0o340,
            ir: 0,
            stack_check: false,
            saved_address: 0,
        }
    }

    pub(crate) fn flag(&self, bit: u16) -> bool {
        self.psw & bit != 0
    }

    pub(crate) fn set_flag(&mut self, bit: u16, on: bool) {
        if on {
            self.psw |= bit;
        } else {
            self.psw &= !bit;
        }
    }

    pub(crate) fn set_nz_word(&mut self, value: u16) {
        self.set_flag(PSW_Z, value == 0);
        self.set_flag(PSW_N, value & 0o100000 != 0);
    }

    pub(crate) fn set_nz_byte(&mut self, value: u8) {
        self.set_flag(PSW_Z, value == 0);
        self.set_flag(PSW_N, value & 0o200 != 0);
    }

    pub(crate) fn current_mode(&self) -> usize {
        usize::from(self.psw >> 14) & 0o3
    }

    pub(crate) fn previous_mode(&self) -> usize {
        usize::from(self.psw >> 12) & 0o3
    }

    pub(crate) fn is_kernel(&self) -> bool {
        self.current_mode() == 0
    }

    pub(crate) fn below_stack_limit(&self) -> bool {
        self.regs[SP] < STACK_LIMIT
    }

    /// Replaces the PSW the way the memory-mapped port does: the trace bit
    /// cannot be set this way, and the stack-pointer shadows swap
    /// atomically with the mode change.
    fn write_psw(&mut self, data: u16) {
        let old_mode = self.current_mode();
        self.psw = data & !PSW_T;
        let new_mode = self.current_mode();
        self.stacks[old_mode] = self.regs[SP];
        self.regs[SP] = self.stacks[new_mode];
    }
}

struct Control {
    run_request: bool,
    run_status: bool,
    single_step: bool,
    last_executed: u64,
}

/// The CPU. Shared as an `Arc`; the execution loop runs on a dedicated
/// thread against the same value.
pub struct Cpu {
    bus: Arc<Bus>,
    mmu: Arc<Mmu>,
    clock: Arc<LineClock>,
    config: CpuConfig,
    machine: Mutex<Machine>,
    control: Mutex<Control>,
    control_cv: Condvar,
}

impl Cpu {
    /// Creates the CPU and binds its PSW port on the bus. The execution
    /// thread is spawned separately (see [`crate::system::System::new`]).
    #[must_use]
    pub fn new(bus: Arc<Bus>, mmu: Arc<Mmu>, clock: Arc<LineClock>, config: CpuConfig) -> Arc<Self> {
        let cpu = Arc::new(Self {
            bus,
            mmu,
            clock,
            config,
            machine: Mutex::new(Machine::new()),
            control: Mutex::new(Control {
                run_request: false,
                run_status: false,
                single_step: false,
                last_executed: 0,
            }),
            control_cv: Condvar::new(),
        });
        let device: Arc<dyn Device> = cpu.clone();
        cpu.bus.register_device(device, PSW_ADDRESS, 1, "PSW", true);
        cpu
    }

    // ---- control surface -------------------------------------------------

    /// Requests a run (or a single step) and waits a bounded number of
    /// retries for the loop to acknowledge. Returns `false` if the CPU was
    /// already running or the handshake window expired; best-effort, not a
    /// guarantee.
    pub fn start_execution(&self, single_step: bool) -> bool {
        let mut ctl = lock(&self.control);
        if ctl.run_status {
            return false;
        }
        ctl.single_step = single_step;
        ctl.last_executed = 0;
        ctl.run_request = true;
        self.control_cv.notify_all();
        for _ in 0..self.config.sync_retries {
            if ctl.run_status || ctl.last_executed > 0 {
                return true;
            }
            let (guard, _) = self
                .control_cv
                .wait_timeout(ctl, self.config.sync_interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            ctl = guard;
        }
        ctl.run_status || ctl.last_executed > 0
    }

    /// Requests a stop and waits a bounded number of retries for the loop
    /// to halt between instructions. Returns `false` if the CPU was not
    /// running or the handshake window expired.
    pub fn stop_execution(&self) -> bool {
        let mut ctl = lock(&self.control);
        if !ctl.run_status {
            return false;
        }
        ctl.run_request = false;
        self.control_cv.notify_all();
        for _ in 0..self.config.sync_retries {
            if !ctl.run_status {
                return true;
            }
            let (guard, _) = self
                .control_cv
                .wait_timeout(ctl, self.config.sync_interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            ctl = guard;
        }
        !ctl.run_status
    }

    /// Non-blocking status query.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        lock(&self.control).run_status
    }

    /// Instructions retired by the most recent span.
    #[must_use]
    pub fn last_executed(&self) -> u64 {
        lock(&self.control).last_executed
    }

    /// Snapshot of the general registers.
    #[must_use]
    pub fn registers(&self) -> [u16; 8] {
        lock(&self.machine).regs
    }

    /// Snapshot of the four per-mode stack-pointer shadows.
    #[must_use]
    pub fn stack_shadows(&self) -> [u16; 4] {
        lock(&self.machine).stacks
    }

    /// Current PSW.
    #[must_use]
    pub fn psw(&self) -> u16 {
        lock(&self.machine).psw
    }

    /// Writes a general register; `index` is taken modulo 8.
    pub fn set_register(&self, index: usize, value: u16) {
        lock(&self.machine).regs[index & 0o7] = value;
    }

    /// Writes the PSW with the port semantics (shadow swap, trace bit
    /// cleared).
    pub fn set_psw(&self, value: u16) {
        lock(&self.machine).write_psw(value);
    }

    /// Writes the stack-pointer shadow for `mode` (taken modulo 4).
    pub fn set_stack_shadow(&self, mode: usize, value: u16) {
        lock(&self.machine).stacks[mode & 0o3] = value;
    }

    // ---- execution loop --------------------------------------------------

    /// Body of the execution thread: park until a run is requested,
    /// execute the span, publish the retired count, repeat.
    pub(crate) fn run_loop(&self) {
        loop {
            let single_step = self.next_run_request();
            let started = Instant::now();
            let executed = self.execute_span(single_step);
            if !single_step {
                info!(
                    "processor halted: {executed} instructions executed in {:?}",
                    started.elapsed()
                );
            }
            let mut ctl = lock(&self.control);
            ctl.last_executed = executed;
            ctl.run_status = false;
            ctl.run_request = false;
            self.control_cv.notify_all();
        }
    }

    fn next_run_request(&self) -> bool {
        let mut ctl = lock(&self.control);
        while !ctl.run_request {
            ctl = self
                .control_cv
                .wait(ctl)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        ctl.run_status = true;
        self.control_cv.notify_all();
        ctl.single_step
    }

    fn priority(&self) -> u8 {
        ((lock(&self.machine).psw >> 5) & 0o7) as u8
    }

    /// One span: instructions until a halt condition, a stop request, or
    /// (single-step) exactly one retirement. Returns the retired count.
    fn execute_span(&self, single_step: bool) -> u64 {
        let mut running = !single_step;
        let mut total: u64 = 0;
        let mut look: u32 = 0;
        loop {
            let mut wait_requested = false;
            {
                let mut m = lock(&self.machine);
                let mut rtt = false;
                m.stack_check = false;
                self.mmu.record_fetch(m.regs[PC]);
                match self.fetch_and_execute(&mut m) {
                    Ok(()) => {}
                    Err(trap) => {
                        if let Some(vector) = trap.vector() {
                            if self.service(&mut m, vector).is_err() {
                                error!("double fault while servicing {trap}");
                                running = false;
                            }
                        } else {
                            match trap {
                                Trap::RttReturn => rtt = true,
                                Trap::Wait => wait_requested = true,
                                Trap::Halt => {
                                    debug!("halt at pc={:06o}", m.regs[PC]);
                                    running = false;
                                }
                                _ => {
                                    debug!(
                                        "{trap} at pc={:06o} ir={:06o}",
                                        m.regs[PC], m.ir
                                    );
                                    running = false;
                                }
                            }
                        }
                    }
                }
                if m.stack_check {
                    m.stack_check = false;
                    if self.service(&mut m, 0o4).is_err() {
                        error!("double fault while servicing stack limit");
                        running = false;
                    }
                }
                if m.flag(PSW_T) && !rtt {
                    if self.service(&mut m, 0o14).is_err() {
                        error!("double fault while servicing trace trap");
                        running = false;
                    } else if m.stack_check {
                        m.stack_check = false;
                        if self.service(&mut m, 0o4).is_err() {
                            error!("double fault while servicing stack limit");
                            running = false;
                        }
                    }
                }
            }
            if wait_requested {
                match self.wait_spin() {
                    Ok(true) => {}
                    Ok(false) => running = false,
                    Err(err) => {
                        error!("scheduler exhausted in wait spin: {err}");
                        running = false;
                    }
                }
                look = self.config.poll_interval;
            }
            total += 1;
            look += 1;
            if look > self.config.poll_interval {
                if let Err(err) = self.clock.poll() {
                    error!("scheduler exhausted polling clock: {err}");
                    running = false;
                }
                self.bus.run_events(i64::from(look));
                if !self.drain_interrupts() {
                    running = false;
                }
                if !lock(&self.control).run_request {
                    running = false;
                }
                look = 0;
            }
            if !running {
                break;
            }
        }
        total
    }

    /// Services every pending interrupt whose level exceeds the PSW
    /// priority. Returns `false` on a double fault.
    fn drain_interrupts(&self) -> bool {
        while let Some(pending) = self.bus.run_interrupts(self.priority()) {
            {
                let mut m = lock(&self.machine);
                if self.service(&mut m, pending.vector).is_err() {
                    error!("double fault while servicing interrupt vector {:o}", pending.vector);
                    return false;
                }
            }
            pending.device.interrupt_service();
            let mut m = lock(&self.machine);
            if m.stack_check {
                m.stack_check = false;
                if self.service(&mut m, 0o4).is_err() {
                    error!("double fault while servicing stack limit");
                    return false;
                }
            }
        }
        true
    }

    /// The WAIT instruction: poll the clock, advance the event clock, and
    /// recheck for a qualifying interrupt or a stop request, sleeping
    /// briefly between rounds. Returns `Ok(false)` when a stop request
    /// ended the wait.
    fn wait_spin(&self) -> Result<bool, ScheduleError> {
        loop {
            if self.bus.waiting_interrupt(self.priority()) {
                return Ok(true);
            }
            self.clock.poll()?;
            self.bus
                .run_events(i64::from(self.config.poll_interval) + 50);
            if !self.bus.waiting_interrupt(self.priority()) {
                std::thread::sleep(self.config.wait_sleep);
            }
            if !lock(&self.control).run_request {
                return Ok(false);
            }
        }
    }

    fn fetch_and_execute(&self, m: &mut Machine) -> Result<(), Trap> {
        let pc = m.regs[PC];
        m.ir = self.logical_read(m, pc)?;
        m.regs[PC] = m.regs[PC].wrapping_add(2);
        self.dispatch(m)
    }

    /// Vectors through kernel space: new PC and PSW come from the two
    /// words at `vector` (read in forced-kernel context), the previous-mode
    /// field of the new PSW records the outgoing mode, the stack-pointer
    /// shadows swap, and the old PSW then PC are pushed onto the incoming
    /// mode's stack.
    fn service(&self, m: &mut Machine, vector: u16) -> Result<(), Trap> {
        let old_mode = m.current_mode();
        let old_psw = m.psw;
        let old_pc = m.regs[PC];
        m.regs[PC] = self.logical_read_kernel(m, vector)?;
        m.psw = self.logical_read_kernel(m, vector.wrapping_add(2))?;
        let new_mode = m.current_mode();
        m.stacks[old_mode] = m.regs[SP];
        m.regs[SP] = m.stacks[new_mode];
        m.psw = (m.psw & 0o147777) | ((old_mode as u16) << 12);
        self.push(m, old_psw)?;
        self.push(m, old_pc)?;
        Ok(())
    }

    // ---- logical-access layer --------------------------------------------

    fn physical_read(&self, m: &Machine, physical: u32) -> Result<u16, Trap> {
        if physical == PSW_ADDRESS {
            return Ok(m.psw);
        }
        self.bus.read(physical)
    }

    fn physical_write(&self, m: &mut Machine, physical: u32, data: u16) -> Result<(), Trap> {
        if physical == PSW_ADDRESS {
            m.write_psw(data);
            return Ok(());
        }
        self.bus.write(physical, data)
    }

    fn physical_write_byte(&self, m: &mut Machine, physical: u32, data: u8) -> Result<(), Trap> {
        if physical & !1 == PSW_ADDRESS {
            let merged = merge_byte(m.psw, physical, data);
            m.write_psw(merged);
            return Ok(());
        }
        self.bus.write_byte(physical, data)
    }

    pub(crate) fn logical_read(&self, m: &mut Machine, addr: u16) -> Result<u16, Trap> {
        if addr & 1 != 0 {
            return Err(Trap::OddAddress);
        }
        let physical = self.mmu.map(addr, Access::Read, Space::Current, m.psw)?;
        self.physical_read(m, physical)
    }

    pub(crate) fn logical_write(&self, m: &mut Machine, addr: u16, data: u16) -> Result<(), Trap> {
        if addr & 1 != 0 {
            return Err(Trap::OddAddress);
        }
        let physical = self.mmu.map(addr, Access::Write, Space::Current, m.psw)?;
        self.physical_write(m, physical, data)
    }

    pub(crate) fn logical_read_byte(&self, m: &mut Machine, addr: u16) -> Result<u8, Trap> {
        let physical = self.mmu.map(addr & !1, Access::Read, Space::Current, m.psw)?;
        let word = self.physical_read(m, physical)?;
        if addr & 1 == 0 {
            Ok(word as u8)
        } else {
            Ok((word >> 8) as u8)
        }
    }

    pub(crate) fn logical_write_byte(&self, m: &mut Machine, addr: u16, data: u8) -> Result<(), Trap> {
        let physical = self.mmu.map(addr, Access::Write, Space::Current, m.psw)?;
        self.physical_write_byte(m, physical, data)
    }

    pub(crate) fn logical_read_previous(&self, m: &mut Machine, addr: u16) -> Result<u16, Trap> {
        if addr & 1 != 0 {
            return Err(Trap::OddAddress);
        }
        let physical = self.mmu.map(addr, Access::Read, Space::Previous, m.psw)?;
        self.physical_read(m, physical)
    }

    pub(crate) fn logical_write_previous(
        &self,
        m: &mut Machine,
        addr: u16,
        data: u16,
    ) -> Result<(), Trap> {
        if addr & 1 != 0 {
            return Err(Trap::OddAddress);
        }
        let physical = self.mmu.map(addr, Access::Write, Space::Previous, m.psw)?;
        self.physical_write(m, physical, data)
    }

    pub(crate) fn logical_read_kernel(&self, m: &mut Machine, addr: u16) -> Result<u16, Trap> {
        if addr & 1 != 0 {
            return Err(Trap::OddAddress);
        }
        let physical = self.mmu.map(addr, Access::Read, Space::Kernel, m.psw)?;
        self.physical_read(m, physical)
    }
}

/// The PSW as a one-word bus device, for external actors. The execution
/// loop never takes this path; its own references short-circuit against
/// the held machine state.
impl Device for Cpu {
    fn reset(&self) {}

    fn read(&self, _addr: u32) -> Result<u16, Trap> {
        Ok(lock(&self.machine).psw)
    }

    fn write(&self, _addr: u32, data: u16) -> Result<(), Trap> {
        lock(&self.machine).write_psw(data);
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        let mut m = lock(&self.machine);
        let merged = merge_byte(m.psw, addr, data);
        m.write_psw(merged);
        Ok(())
    }
}

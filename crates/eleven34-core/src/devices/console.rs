//! KL11-style serial console over TCP.
//!
//! Four registers: receiver status and data, transmitter status and data.
//! A background thread accepts one TCP connection at a time and feeds
//! incoming bytes to the receiver. The receiver holds one character; the
//! feeder parks on a condition variable until the data register is read
//! (or a one-second timeout lapses), so an unattended receiver drops
//! input instead of overrunning it.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info};

use crate::bus::Bus;
use crate::device::Device;
use crate::lock;
use crate::trap::Trap;

/// Base bus address of the register block.
pub const CONSOLE_ADDRESS: u32 = 0o777560;
/// Register block size in words.
pub const CONSOLE_WORDS: u16 = 4;
/// Receiver interrupt vector.
pub const CONSOLE_RECEIVE_VECTOR: u16 = 0o60;
/// Transmitter interrupt vector.
pub const CONSOLE_TRANSMIT_VECTOR: u16 = 0o64;
/// Bus-request level for both directions.
pub const CONSOLE_LEVEL: u8 = 4;

/// Ready bit in both status registers.
pub const CONSOLE_READY: u16 = 0o200;
/// Interrupt-enable bit in both status registers.
pub const CONSOLE_IE: u16 = 0o100;

/// Instructions until the transmitter goes ready again after a send.
const TRANSMIT_DELAY: i64 = 100;

struct ConsoleState {
    rsr: u16,
    rdr: u16,
    tsr: u16,
    tdr: u16,
}

impl ConsoleState {
    const fn idle() -> Self {
        Self {
            rsr: 0,
            rdr: 0o177,
            tsr: CONSOLE_READY,
            tdr: 0,
        }
    }
}

/// The console device.
pub struct Console {
    bus: Arc<Bus>,
    this: Weak<Self>,
    state: Mutex<ConsoleState>,
    /// Signaled when the receiver data register is read.
    drained: Condvar,
    socket: Mutex<Option<TcpStream>>,
}

impl Console {
    /// Creates the console, binds its registers on the bus, and spawns
    /// the TCP acceptor thread on `port`. The thread exits once the
    /// console is dropped.
    #[must_use]
    pub fn new(bus: &Arc<Bus>, port: u16) -> Arc<Self> {
        let console = Arc::new_cyclic(|this| Self {
            bus: bus.clone(),
            this: this.clone(),
            state: Mutex::new(ConsoleState::idle()),
            drained: Condvar::new(),
            socket: Mutex::new(None),
        });
        bus.register_device(console.clone(), CONSOLE_ADDRESS, CONSOLE_WORDS, "KL11", false);
        let weak = console.this.clone();
        std::thread::Builder::new()
            .name("console-acceptor".into())
            .spawn(move || Self::acceptor(&weak, port))
            .ok();
        console
    }

    fn acceptor(weak: &Weak<Self>, port: u16) {
        loop {
            let Some(console) = weak.upgrade() else {
                return;
            };
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(listener) => {
                    drop(console);
                    if let Ok((stream, peer)) = listener.accept() {
                        drop(listener);
                        info!("console connected from {peer}");
                        let Some(console) = weak.upgrade() else {
                            return;
                        };
                        console.serve(stream);
                        info!("console disconnected");
                    }
                }
                Err(err) => {
                    debug!("console cannot listen on port {port}: {err}");
                    drop(console);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Pumps one connection: every byte goes to the receiver, then the
    /// feeder parks until the character is consumed.
    fn serve(&self, stream: TcpStream) {
        *lock(&self.socket) = Some(match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                error!("console cannot clone its stream: {err}");
                return;
            }
        });
        let mut reader = stream;
        let mut buffer = [0_u8; 1];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    self.receive_byte(buffer[0]);
                    self.await_drain();
                }
            }
        }
        *lock(&self.socket) = None;
    }

    /// Offers one byte to the receiver. Dropped silently when a previous
    /// character is still unread.
    pub(crate) fn receive_byte(&self, byte: u8) {
        let fire = {
            let mut state = lock(&self.state);
            if state.rsr & CONSOLE_READY != 0 {
                return;
            }
            state.rsr |= CONSOLE_READY;
            state.rdr = u16::from(byte);
            state.rsr & CONSOLE_IE != 0
        };
        if fire {
            self.request_interrupt(CONSOLE_RECEIVE_VECTOR);
        }
    }

    fn await_drain(&self) {
        let state = lock(&self.state);
        if state.rsr & CONSOLE_READY != 0 {
            let _ = self
                .drained
                .wait_timeout(state, Duration::from_secs(1))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn request_interrupt(&self, vector: u16) {
        if let Some(me) = self.this.upgrade() {
            if let Err(err) = self.bus.schedule_interrupt(me, CONSOLE_LEVEL, vector) {
                error!("console dropped an interrupt on vector {vector:o}: {err}");
            }
        }
    }
}

impl Device for Console {
    fn reset(&self) {
        *lock(&self.state) = ConsoleState::idle();
        if let Some(me) = self.this.upgrade() {
            let device: Arc<dyn Device> = me;
            self.bus
                .cancel_interrupt(&device, CONSOLE_LEVEL, CONSOLE_RECEIVE_VECTOR);
            self.bus
                .cancel_interrupt(&device, CONSOLE_LEVEL, CONSOLE_TRANSMIT_VECTOR);
            self.bus.cancel_events(&device);
        }
        self.drained.notify_all();
    }

    fn read(&self, addr: u32) -> Result<u16, Trap> {
        let mut state = lock(&self.state);
        match addr - CONSOLE_ADDRESS {
            0 => Ok(state.rsr),
            2 => {
                let data = state.rdr;
                state.rsr &= !CONSOLE_READY;
                self.drained.notify_all();
                Ok(data)
            }
            4 => Ok(state.tsr),
            6 => Ok(state.tdr),
            _ => Err(Trap::BusTimeout),
        }
    }

    fn write(&self, addr: u32, data: u16) -> Result<(), Trap> {
        let mut interrupt = None;
        let mut transmit = None;
        {
            let mut state = lock(&self.state);
            match addr - CONSOLE_ADDRESS {
                0 => {
                    if state.rsr & CONSOLE_IE == 0
                        && data & CONSOLE_IE != 0
                        && state.rsr & CONSOLE_READY != 0
                    {
                        interrupt = Some(CONSOLE_RECEIVE_VECTOR);
                    }
                    state.rsr = (state.rsr & !CONSOLE_IE) | (data & CONSOLE_IE);
                }
                2 => {}
                4 => {
                    if state.tsr & CONSOLE_IE == 0
                        && data & CONSOLE_IE != 0
                        && state.tsr & CONSOLE_READY != 0
                    {
                        interrupt = Some(CONSOLE_TRANSMIT_VECTOR);
                    }
                    state.tsr = (state.tsr & !CONSOLE_IE) | (data & CONSOLE_IE);
                }
                6 => {
                    if state.tsr & CONSOLE_READY != 0 {
                        state.tdr = data & 0o177;
                        state.tsr &= !CONSOLE_READY;
                        transmit = Some((data & 0o177) as u8);
                    }
                }
                _ => return Err(Trap::BusTimeout),
            }
        }
        if let Some(byte) = transmit {
            if let Some(stream) = lock(&self.socket).as_mut() {
                // Connection errors surface through the acceptor thread.
                let _ = stream.write_all(&[byte]);
            }
            if let Some(me) = self.this.upgrade() {
                if let Err(err) = self.bus.schedule_event(me, TRANSMIT_DELAY, 0) {
                    error!("console transmitter stuck busy: {err}");
                }
            }
        }
        if let Some(vector) = interrupt {
            self.request_interrupt(vector);
        }
        Ok(())
    }

    fn write_byte(&self, addr: u32, data: u8) -> Result<(), Trap> {
        if addr & 1 != 0 {
            return Ok(());
        }
        self.write(addr, u16::from(data))
    }

    /// Transmit completion: the transmitter goes ready again.
    fn event_service(&self, _data: u16) {
        let fire = {
            let mut state = lock(&self.state);
            state.tsr |= CONSOLE_READY;
            state.tsr & CONSOLE_IE != 0
        };
        if fire {
            self.request_interrupt(CONSOLE_TRANSMIT_VECTOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Console, CONSOLE_ADDRESS, CONSOLE_IE, CONSOLE_READY, CONSOLE_RECEIVE_VECTOR,
        CONSOLE_TRANSMIT_VECTOR,
    };
    use crate::bus::Bus;
    use crate::device::Device;

    fn console() -> (std::sync::Arc<Bus>, std::sync::Arc<Console>) {
        let bus = Bus::new(0o1000);
        // Port 0: the acceptor binds an ephemeral port, irrelevant here.
        let console = Console::new(&bus, 0);
        (bus, console)
    }

    #[test]
    fn received_byte_sets_ready_and_loads_the_data_register() {
        let (bus, console) = console();
        console.receive_byte(b'a');
        assert_eq!(
            bus.read(CONSOLE_ADDRESS).unwrap() & CONSOLE_READY,
            CONSOLE_READY
        );
        assert_eq!(bus.read(CONSOLE_ADDRESS + 2).unwrap(), u16::from(b'a'));
        // Reading the data register clears ready.
        assert_eq!(bus.read(CONSOLE_ADDRESS).unwrap() & CONSOLE_READY, 0);
    }

    #[test]
    fn second_byte_is_dropped_while_the_first_is_unread() {
        let (bus, console) = console();
        console.receive_byte(b'a');
        console.receive_byte(b'b');
        assert_eq!(bus.read(CONSOLE_ADDRESS + 2).unwrap(), u16::from(b'a'));
    }

    #[test]
    fn enabling_receiver_interrupts_with_a_character_waiting_fires_at_once() {
        let (bus, console) = console();
        console.receive_byte(b'a');
        bus.write(CONSOLE_ADDRESS, CONSOLE_IE).unwrap();
        let pending = bus.run_interrupts(0).unwrap();
        assert_eq!(pending.vector, CONSOLE_RECEIVE_VECTOR);
    }

    #[test]
    fn transmit_goes_busy_then_ready_again_after_the_event() {
        let (bus, console) = console();
        bus.write(CONSOLE_ADDRESS + 4, CONSOLE_IE).unwrap();
        bus.write(CONSOLE_ADDRESS + 6, u16::from(b'x')).unwrap();
        assert_eq!(bus.read(CONSOLE_ADDRESS + 4).unwrap() & CONSOLE_READY, 0);
        bus.run_events(100);
        assert_eq!(
            bus.read(CONSOLE_ADDRESS + 4).unwrap() & CONSOLE_READY,
            CONSOLE_READY
        );
        let pending = bus.run_interrupts(0).unwrap();
        assert_eq!(pending.vector, CONSOLE_TRANSMIT_VECTOR);
    }

    #[test]
    fn reset_restores_the_idle_register_images() {
        let (bus, console) = console();
        console.receive_byte(b'a');
        bus.write(CONSOLE_ADDRESS + 6, u16::from(b'x')).unwrap();
        console.reset();
        assert_eq!(bus.read(CONSOLE_ADDRESS).unwrap(), 0);
        assert_eq!(bus.read(CONSOLE_ADDRESS + 2).unwrap(), 0o177);
        assert_eq!(bus.read(CONSOLE_ADDRESS + 4).unwrap(), CONSOLE_READY);
        assert!(!bus.waiting_interrupt(0));
    }
}

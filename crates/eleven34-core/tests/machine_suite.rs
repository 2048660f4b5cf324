//! Whole-machine scenarios: relocation through the management unit, bus
//! timeouts vectoring as faults, the boot ROM, the line clock waking a
//! waiting processor, and the run/stop handshake.

#![allow(clippy::pedantic, clippy::nursery)]

use std::time::{Duration, Instant};

use eleven34_core::{Cpu, CpuConfig, System, SystemConfig};
use log as _;
use proptest as _;
use thiserror as _;
use rstest as _;
use tempfile as _;

const SP: usize = 6;
const PC: usize = 7;

fn system() -> System {
    System::new(SystemConfig {
        memory_words: 0o40000,
        cpu: CpuConfig::default(),
        console_port: 0,
    })
}

fn load(system: &System, addr: u32, words: &[u16]) {
    for (index, &word) in words.iter().enumerate() {
        system.bus().write(addr + 2 * index as u32, word).unwrap();
    }
}

fn step(cpu: &Cpu) {
    assert!(cpu.start_execution(true), "step was not acknowledged");
    let deadline = Instant::now() + Duration::from_secs(5);
    while cpu.is_executing() {
        assert!(Instant::now() < deadline, "step did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn run_to_halt(cpu: &Cpu) {
    assert!(cpu.start_execution(false), "run was not acknowledged");
    let deadline = Instant::now() + Duration::from_secs(5);
    while cpu.is_executing() {
        assert!(Instant::now() < deadline, "program did not halt");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn bus_timeout_during_execution_vectors_through_four() {
    let system = system();
    load(&system, 0o1000, &[0o010037, 0o150000]); // mov r0,@#150000
    load(&system, 0o4, &[0o2000, 0o340]);
    load(&system, 0o2000, &[0o000000]); // halt
    system.cpu().set_register(PC, 0o1000);
    system.cpu().set_register(SP, 0o700);
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn boot_rom_code_fetches_and_faults_on_the_missing_controller() {
    let system = system();
    load(&system, 0o4, &[0o2000, 0o340]);
    load(&system, 0o2000, &[0o000000]);
    system.cpu().set_register(PC, 0o173000);
    system.cpu().set_register(SP, 0o700);
    // The disk loader's first store hits an unfitted controller address
    // and vectors as a bus timeout.
    step(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn relocation_moves_logical_page_zero_and_records_writes() {
    let system = system();
    // Page 0 relocated to physical 0o20000, full length, writable.
    system.bus().write(0o772340, 0o200).unwrap();
    system.bus().write(0o772300, 0o77406).unwrap();
    // Program lives at the physical home of logical 0o1000.
    load(&system, 0o21000, &[0o012701, 0o000123, 0o010137, 0o002000, 0o000000]);
    system.cpu().set_register(PC, 0o1000);
    system.cpu().set_register(SP, 0o700);
    system.bus().write(0o777572, 1).unwrap(); // enable relocation
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o123);
    // The store to logical 0o2000 landed at physical 0o22000.
    assert_eq!(system.bus().read(0o22000).unwrap(), 0o123);
    // And the page now shows as written.
    assert_eq!(system.bus().read(0o772300).unwrap() & 0o100, 0o100);
}

#[test]
fn nonresident_page_aborts_and_latches_the_fault_status() {
    let system = system();
    system.bus().write(0o772340, 0o200).unwrap();
    system.bus().write(0o772300, 0o77406).unwrap();
    // Vector 0o250 and the handler live in relocated page 0.
    load(&system, 0o20250, &[0o1200, 0o340]);
    load(&system, 0o21200, &[0o000000]); // halt
    // The faulting program touches logical page 1, left nonresident.
    load(&system, 0o21000, &[0o010037, 0o020000]); // mov r0,@#20000
    system.cpu().set_register(PC, 0o1000);
    system.cpu().set_register(SP, 0o700);
    system.bus().write(0o777572, 1).unwrap();
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o1202);
    let mmr0 = system.bus().read(0o777572).unwrap();
    assert_ne!(mmr0 & 0o100000, 0, "abort-nonresident must be latched");
    assert_eq!((mmr0 >> 1) & 0o7, 1, "fault page");
    // The frozen fetch address names the faulting instruction.
    assert_eq!(system.bus().read(0o777576).unwrap(), 0o1000);
}

#[test]
fn wait_parks_until_the_line_clock_interrupts() {
    let system = system();
    load(&system, 0o100, &[0o2000, 0o340]);
    load(&system, 0o2000, &[0o000000]); // halt
    // mov #100,@#177546 (enable clock interrupts); wait
    load(&system, 0o1000, &[0o012737, 0o000100, 0o177546, 0o000001]);
    system.cpu().set_register(PC, 0o1000);
    system.cpu().set_register(SP, 0o700);
    system.cpu().set_psw(0o000000); // kernel, priority 0
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn run_requests_are_refused_while_running_and_stop_is_honored() {
    let system = system();
    load(&system, 0o1000, &[0o000777]); // br .
    system.cpu().set_register(PC, 0o1000);
    assert!(system.cpu().start_execution(false));
    assert!(system.cpu().is_executing());
    assert!(!system.cpu().start_execution(false));
    assert!(system.cpu().stop_execution());
    let deadline = Instant::now() + Duration::from_secs(5);
    while system.cpu().is_executing() {
        assert!(Instant::now() < deadline, "stop was not honored");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(system.cpu().last_executed() > 0);
    assert!(!system.cpu().stop_execution());
}

#[test]
fn device_table_names_the_standard_fit() {
    let system = system();
    let names: Vec<String> = system
        .bus()
        .device_table()
        .into_iter()
        .map(|info| info.name)
        .collect();
    for expected in ["KW11L", "PSW", "BOOTROMS", "SCRATCH"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
}

//! Instruction semantics driven through the public control surface: each
//! test assembles a few words into memory, single-steps the processor
//! thread, and inspects registers, flags, and memory.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use std::time::{Duration, Instant};

use eleven34_core::{Cpu, CpuConfig, System, SystemConfig};
use log as _;
use proptest::prelude::*;
use thiserror as _;
use rstest::rstest;
use tempfile as _;

const SP: usize = 6;
const PC: usize = 7;

const FLAG_C: u16 = 0o1;
const FLAG_V: u16 = 0o2;
const FLAG_Z: u16 = 0o4;
const FLAG_N: u16 = 0o10;

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

/// Single-steps and waits for the instruction to retire.
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

/// Fresh machine with PC at `0o1000`, SP at `0o700`, and `words` loaded
/// at the PC.
fn ready(words: &[u16]) -> System {
    let system = system();
    load(&system, 0o1000, words);
    system.cpu().set_register(PC, 0o1000);
    system.cpu().set_register(SP, 0o700);
    system
}

fn flags(cpu: &Cpu) -> u16 {
    cpu.psw() & 0o17
}

// ---- data movement and flags ------------------------------------------

#[test]
fn mov_of_zero_sets_only_the_zero_flag() {
    let system = ready(&[0o012701, 0o000000]); // mov #0,r1
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0);
    assert_eq!(flags(system.cpu()), FLAG_Z);
}

#[test]
fn movb_into_a_register_sign_extends() {
    let system = ready(&[0o112701, 0o000377]); // movb #377,r1
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o177777);
    assert_eq!(flags(system.cpu()), FLAG_N);
}

#[test]
fn swab_exchanges_bytes_and_judges_the_low_byte() {
    let system = ready(&[0o012701, 0o177400, 0o000301]); // mov #177400,r1; swab r1
    step(system.cpu());
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o000777);
    assert_eq!(flags(system.cpu()), FLAG_N); // low byte 0o377 is negative
}

// ---- addressing modes --------------------------------------------------

#[test]
fn word_autoincrement_steps_the_register_by_two() {
    let system = ready(&[0o012100]); // mov (r1)+,r0
    load(&system, 0o2000, &[0o054321]);
    system.cpu().set_register(1, 0o2000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[0], 0o054321);
    assert_eq!(system.cpu().registers()[1], 0o2002);
}

#[test]
fn byte_autoincrement_steps_low_registers_by_one() {
    let system = ready(&[0o112100]); // movb (r1)+,r0
    load(&system, 0o2000, &[0o000105]);
    system.cpu().set_register(1, 0o2000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[0], 0o105);
    assert_eq!(system.cpu().registers()[1], 0o2001);
}

#[test]
fn byte_autoincrement_steps_the_stack_pointer_by_two() {
    let system = ready(&[0o112600]); // movb (sp)+,r0
    load(&system, 0o700, &[0o000104]);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[0], 0o104);
    assert_eq!(system.cpu().registers()[SP], 0o702);
}

#[test]
fn autodecrement_predecrements_before_the_access() {
    let system = ready(&[0o010041]); // mov r0,-(r1)
    system.cpu().set_register(0, 0o031415);
    system.cpu().set_register(1, 0o2002);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o2000);
    assert_eq!(system.bus().read(0o2000).unwrap(), 0o031415);
}

#[test]
fn index_mode_adds_the_fetched_offset_to_the_register() {
    let system = ready(&[0o016102, 0o000010]); // mov 10(r1),r2
    load(&system, 0o2010, &[0o042042]);
    system.cpu().set_register(1, 0o2000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[2], 0o042042);
}

#[test]
fn deferred_autoincrement_follows_the_pointer_word() {
    let system = ready(&[0o013102]); // mov @(r1)+,r2
    load(&system, 0o2000, &[0o003000]);
    load(&system, 0o3000, &[0o060606]);
    system.cpu().set_register(1, 0o2000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[2], 0o060606);
    assert_eq!(system.cpu().registers()[1], 0o2002);
}

#[test]
fn absolute_mode_writes_through_the_fetched_address() {
    let system = ready(&[0o010137, 0o004000]); // mov r1,@#4000
    system.cpu().set_register(1, 0o123456);
    step(system.cpu());
    assert_eq!(system.bus().read(0o4000).unwrap(), 0o123456);
}

// ---- arithmetic boundaries ---------------------------------------------

#[test]
fn add_at_the_positive_limit_overflows_without_carry() {
    let system = ready(&[0o062701, 0o000001]); // add #1,r1
    system.cpu().set_register(1, 0o077777);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o100000);
    assert_eq!(flags(system.cpu()), FLAG_N | FLAG_V);
}

#[test]
fn add_wrapping_to_zero_carries() {
    let system = ready(&[0o062701, 0o000001]); // add #1,r1
    system.cpu().set_register(1, 0o177777);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0);
    assert_eq!(flags(system.cpu()), FLAG_Z | FLAG_C);
}

#[test]
fn cmp_of_a_smaller_value_borrows() {
    let system = ready(&[0o022701, 0o000001]); // cmp #1,r1
    system.cpu().set_register(1, 0o000002);
    step(system.cpu());
    // 1 - 2: negative result with a borrow.
    assert_eq!(flags(system.cpu()), FLAG_N | FLAG_C);
}

#[test]
fn sub_stores_the_difference_and_borrow() {
    let system = ready(&[0o162701, 0o000001]); // sub #1,r1
    system.cpu().set_register(1, 0o000000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o177777);
    assert_eq!(flags(system.cpu()), FLAG_N | FLAG_C);
}

#[test]
fn inc_overflows_only_at_the_positive_limit() {
    let system = ready(&[0o005201, 0o005201]); // inc r1; inc r1
    system.cpu().set_register(1, 0o077776);
    step(system.cpu());
    assert_eq!(flags(system.cpu()) & FLAG_V, 0);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o100000);
    assert_eq!(flags(system.cpu()), FLAG_N | FLAG_V);
}

#[test]
fn neg_of_zero_clears_carry() {
    let system = ready(&[0o005401]); // neg r1
    system.cpu().set_register(1, 0);
    step(system.cpu());
    assert_eq!(flags(system.cpu()), FLAG_Z);
}

#[test]
fn adc_propagates_a_carry_into_the_destination() {
    let system = ready(&[0o062701, 0o000001, 0o005502]); // add #1,r1; adc r2
    system.cpu().set_register(1, 0o177777);
    system.cpu().set_register(2, 0o000005);
    step(system.cpu());
    step(system.cpu());
    assert_eq!(system.cpu().registers()[2], 0o000006);
}

// ---- extended arithmetic -----------------------------------------------

#[test]
fn mul_splits_the_product_across_the_register_pair() {
    let system = ready(&[0o070201]); // mul r1,r2
    system.cpu().set_register(1, 0o001000);
    system.cpu().set_register(2, 0o001000);
    step(system.cpu());
    // 512 * 512 = 262144 = 0o1000000.
    assert_eq!(system.cpu().registers()[2], 0o000004);
    assert_eq!(system.cpu().registers()[3], 0o000000);
    assert_eq!(flags(system.cpu()), FLAG_C); // out of 16-bit range
}

#[test]
fn div_leaves_quotient_and_remainder() {
    let system = ready(&[0o071201]); // div r1,r2
    system.cpu().set_register(2, 0); // high
    system.cpu().set_register(3, 17); // low
    system.cpu().set_register(1, 5);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[2], 3);
    assert_eq!(system.cpu().registers()[3], 2);
}

#[test]
fn div_by_zero_sets_overflow_and_carry_only() {
    let system = ready(&[0o071201]); // div r1,r2
    system.cpu().set_register(1, 0);
    system.cpu().set_register(2, 0);
    system.cpu().set_register(3, 10);
    step(system.cpu());
    assert_eq!(flags(system.cpu()) & (FLAG_V | FLAG_C), FLAG_V | FLAG_C);
    assert_eq!(system.cpu().registers()[3], 10); // untouched
}

#[test]
fn ash_left_latches_overflow_on_a_sign_change() {
    let system = ready(&[0o072127, 0o000002]); // ash #2,r1
    system.cpu().set_register(1, 0o040000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0);
    let f = flags(system.cpu());
    assert_ne!(f & FLAG_V, 0);
    assert_ne!(f & FLAG_Z, 0);
}

#[test]
fn ash_right_replicates_the_sign() {
    let system = ready(&[0o072127, 0o000076]); // ash #-2,r1
    system.cpu().set_register(1, 0o100000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o160000);
    assert_ne!(flags(system.cpu()) & FLAG_N, 0);
}

// ---- shifts and rotates ------------------------------------------------

#[test]
fn ror_feeds_carry_into_the_sign_bit() {
    let system = ready(&[0o000261, 0o006001]); // sec; ror r1
    system.cpu().set_register(1, 0o000002);
    step(system.cpu());
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o100001);
    assert_eq!(flags(system.cpu()) & FLAG_C, 0);
}

#[test]
fn asr_keeps_the_sign_and_reports_the_dropped_bit() {
    let system = ready(&[0o006201]); // asr r1
    system.cpu().set_register(1, 0o100001);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 0o140000);
    assert_ne!(flags(system.cpu()) & FLAG_C, 0);
}

// ---- branches and loops ------------------------------------------------

#[rstest]
#[case::beq_taken(0o001401, FLAG_Z, true)]
#[case::beq_not_taken(0o001401, 0, false)]
#[case::bne_taken(0o001001, 0, true)]
#[case::bmi_taken(0o100401, FLAG_N, true)]
#[case::bpl_not_taken(0o100001, FLAG_N, false)]
#[case::bcs_taken(0o103401, FLAG_C, true)]
#[case::bvs_taken(0o102401, FLAG_V, true)]
#[case::blt_taken(0o002401, FLAG_N, true)]
#[case::blt_on_overflow(0o002401, FLAG_V, true)]
#[case::bgt_not_taken_on_zero(0o003001, FLAG_Z, false)]
fn conditional_branches_follow_their_flags(
    #[case] opcode: u16,
    #[case] set_flags: u16,
    #[case] taken: bool,
) {
    let system = ready(&[opcode]);
    system.cpu().set_psw(0o340 | set_flags);
    step(system.cpu());
    let expected = if taken { 0o1004 } else { 0o1002 };
    assert_eq!(system.cpu().registers()[PC], expected);
}

#[test]
fn sob_loops_until_the_register_drains() {
    // mov #3,r1; inc r2; sob r1,.-2; halt
    let system = ready(&[0o012701, 0o000003, 0o005202, 0o077102, 0o000000]);
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[2], 3);
    assert_eq!(system.cpu().registers()[1], 0);
}

#[test]
fn jsr_pushes_the_linkage_and_rts_returns() {
    // jsr pc,@#2000 ... at 2000: rts pc
    let system = ready(&[0o004737, 0o002000, 0o000000]);
    load(&system, 0o2000, &[0o000207]);
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o1006); // halted past the halt
    assert_eq!(system.cpu().registers()[SP], 0o700); // balanced
}

// ---- traps and mode transitions ----------------------------------------

fn install_vector(system: &System, vector: u32, handler: u16, psw: u16) {
    load(system, vector, &[handler, psw]);
}

#[test]
fn emt_vectors_with_the_old_context_on_the_new_stack() {
    let system = ready(&[0o104000]); // emt
    install_vector(&system, 0o30, 0o2000, 0o340);
    load(&system, 0o2000, &[0o000000]); // halt
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
    let sp = system.cpu().registers()[SP];
    assert_eq!(sp, 0o674);
    assert_eq!(system.bus().read(u32::from(sp)).unwrap(), 0o1002); // old PC
    assert_eq!(system.bus().read(u32::from(sp) + 2).unwrap(), 0o340); // old PSW
}

#[test]
fn trap_and_emt_use_distinct_vectors() {
    let system = ready(&[0o104400]); // trap
    install_vector(&system, 0o34, 0o2000, 0o340);
    load(&system, 0o2000, &[0o000000]);
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn halt_outside_kernel_mode_is_a_reserved_instruction() {
    let system = ready(&[0o000000]); // halt, but in user mode
    install_vector(&system, 0o10, 0o2000, 0o340);
    load(&system, 0o2000, &[0o000000]);
    system.cpu().set_stack_shadow(0, 0o700);
    system.cpu().set_psw(0o140000); // user, priority 0
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o2002);
    // Previous-mode field of the handler PSW records the outgoing user
    // mode.
    assert_eq!(system.cpu().psw() & 0o030000, 0o030000);
}

#[test]
fn wait_outside_kernel_mode_does_nothing() {
    let system = ready(&[0o000001, 0o005201]); // wait; inc r1
    system.cpu().set_psw(0o140000);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[PC], 0o1002);
    step(system.cpu());
    assert_eq!(system.cpu().registers()[1], 1);
}

#[test]
fn rti_that_sets_the_trace_bit_traps_before_the_next_instruction() {
    // mov #20,-(sp); mov #1014,-(sp); rti; (1014) inc r3
    let system = ready(&[
        0o012746, 0o000020, 0o012746, 0o001014, 0o000002,
    ]);
    install_vector(&system, 0o14, 0o2000, 0o340);
    load(&system, 0o1014, &[0o005203]);
    load(&system, 0o2000, &[0o000000]); // halt
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[3], 0, "trace must fire before inc");
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn rtt_defers_the_trace_trap_past_one_instruction() {
    let system = ready(&[
        0o012746, 0o000020, 0o012746, 0o001014, 0o000006,
    ]);
    install_vector(&system, 0o14, 0o2000, 0o340);
    load(&system, 0o1014, &[0o005203]);
    load(&system, 0o2000, &[0o000000]);
    run_to_halt(system.cpu());
    assert_eq!(system.cpu().registers()[3], 1, "inc must run before the trap");
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

#[test]
fn kernel_stack_below_the_limit_faults_once_after_the_instruction() {
    let system = ready(&[0o010046]); // mov r0,-(sp)
    install_vector(&system, 0o4, 0o2000, 0o340);
    load(&system, 0o2000, &[0o000000]);
    system.cpu().set_register(SP, 0o400);
    run_to_halt(system.cpu());
    // The push itself completed, then the limit fault vectored.
    assert_eq!(system.cpu().registers()[PC], 0o2002);
}

// ---- property checks ---------------------------------------------------

proptest! {
    // Each case assembles a whole machine; keep the case count modest.
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn add_matches_the_wide_model(a: u16, b: u16) {
        let system = ready(&[0o060001]); // add r0,r1
        system.cpu().set_register(0, a);
        system.cpu().set_register(1, b);
        step(system.cpu());
        let wide = u32::from(a) + u32::from(b);
        prop_assert_eq!(system.cpu().registers()[1], wide as u16);
        let f = flags(system.cpu());
        prop_assert_eq!(f & FLAG_C != 0, wide > 0o177777);
        prop_assert_eq!(f & FLAG_Z != 0, wide as u16 == 0);
        let signed = i32::from(a as i16) + i32::from(b as i16);
        prop_assert_eq!(f & FLAG_V != 0, !(-32768..=32767).contains(&signed));
    }

    #[test]
    fn cmp_carry_is_the_borrow_indicator(a: u16, b: u16) {
        let system = ready(&[0o020001]); // cmp r0,r1
        system.cpu().set_register(0, a);
        system.cpu().set_register(1, b);
        step(system.cpu());
        prop_assert_eq!(flags(system.cpu()) & FLAG_C != 0, a < b);
    }
}

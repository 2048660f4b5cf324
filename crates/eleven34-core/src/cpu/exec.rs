//! Instruction decode and execution.
//!
//! The decoder is a nested match over the opcode fields, widest group
//! first. Handlers work in `u32`/`i32` where an operation needs the carry
//! bit or a 32-bit intermediate, and truncate back to 16 bits on store.
//! Read-modify-write destinations resolve once and store through the
//! deferred path; write-only destinations resolve at store time.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

use super::{Cpu, Machine, PC, PSW_C, PSW_N, PSW_V, PSW_Z, R5, SP};
use crate::trap::Trap;

const WORD_SIGN: u32 = 0o100000;
const WORD_MASK: u32 = 0o177777;
const WORD_CARRY: u32 = 0o200000;
const BYTE_SIGN: u32 = 0o200;
const BYTE_MASK: u32 = 0o377;
const BYTE_CARRY: u32 = 0o400;

impl Cpu {
    pub(super) fn dispatch(&self, m: &mut Machine) -> Result<(), Trap> {
        let ir = m.ir;
        let (n, z, v, c) = (
            m.flag(PSW_N),
            m.flag(PSW_Z),
            m.flag(PSW_V),
            m.flag(PSW_C),
        );
        match ir >> 12 {
            0o00 => match (ir >> 9) & 0o7 {
                0 => match (ir >> 6) & 0o7 {
                    0 => match ir {
                        0o000000 => Self::op_halt(m),
                        0o000001 => Self::op_wait(m),
                        0o000002 | 0o000006 => self.op_rti(m),
                        0o000003 => Err(Trap::Breakpoint),
                        0o000004 => Err(Trap::IoTrap),
                        0o000005 => self.op_reset(m),
                        _ => Err(Trap::ReservedInstruction),
                    },
                    1 => self.op_jmp(m),
                    2 => match (ir >> 3) & 0o7 {
                        0 => self.op_rts(m),
                        1..=3 => Err(Trap::ReservedInstruction),
                        _ => Self::op_cc(m),
                    },
                    3 => self.op_swab(m),
                    _ => Self::op_br(m),
                },
                1 => Self::op_branch_on(m, z),
                2 => Self::op_branch_on(m, n ^ v),
                3 => Self::op_branch_on(m, (n ^ v) | z),
                4 => self.op_jsr(m),
                5 => match (ir >> 6) & 0o7 {
                    0 => self.op_clr(m),
                    1 => self.op_com(m),
                    2 => self.op_inc(m),
                    3 => self.op_dec(m),
                    4 => self.op_neg(m),
                    5 => self.op_adc(m),
                    6 => self.op_sbc(m),
                    _ => self.op_tst(m),
                },
                6 => match (ir >> 6) & 0o7 {
                    0 => self.op_ror(m),
                    1 => self.op_rol(m),
                    2 => self.op_asr(m),
                    3 => self.op_asl(m),
                    4 => self.op_mark(m),
                    5 => self.op_mfpi(m),
                    6 => self.op_mtpi(m),
                    _ => self.op_sxt(m),
                },
                _ => Err(Trap::ReservedInstruction),
            },
            0o01 => self.op_mov(m),
            0o02 => self.op_cmp(m),
            0o03 => self.op_bit(m),
            0o04 => self.op_bic(m),
            0o05 => self.op_bis(m),
            0o06 => self.op_add(m),
            0o07 => match (ir >> 9) & 0o7 {
                0 => self.op_mul(m),
                1 => self.op_div(m),
                2 => self.op_ash(m),
                3 => self.op_ashc(m),
                4 => self.op_xor(m),
                7 => Self::op_sob(m),
                _ => Err(Trap::ReservedInstruction),
            },
            0o10 => match (ir >> 9) & 0o7 {
                0 => Self::op_branch_on(m, n),
                1 => Self::op_branch_on(m, z | c),
                2 => Self::op_branch_on(m, v),
                3 => Self::op_branch_on(m, c),
                4 => {
                    if ir <= 0o104377 {
                        Err(Trap::Emt)
                    } else {
                        Err(Trap::TrapInstruction)
                    }
                }
                5 => match (ir >> 6) & 0o7 {
                    0 => self.op_clrb(m),
                    1 => self.op_comb(m),
                    2 => self.op_incb(m),
                    3 => self.op_decb(m),
                    4 => self.op_negb(m),
                    5 => self.op_adcb(m),
                    6 => self.op_sbcb(m),
                    _ => self.op_tstb(m),
                },
                6 => match (ir >> 6) & 0o7 {
                    0 => self.op_rorb(m),
                    1 => self.op_rolb(m),
                    2 => self.op_asrb(m),
                    3 => self.op_aslb(m),
                    4 => self.op_mtps(m),
                    5 => self.op_mfpi(m),
                    6 => self.op_mtpi(m),
                    _ => self.op_mfps(m),
                },
                _ => Err(Trap::ReservedInstruction),
            },
            0o11 => self.op_movb(m),
            0o12 => self.op_cmpb(m),
            0o13 => self.op_bitb(m),
            0o14 => self.op_bicb(m),
            0o15 => self.op_bisb(m),
            0o16 => self.op_sub(m),
            // No floating-point option fitted.
            _ => Err(Trap::ReservedInstruction),
        }
    }

    // ---- control-flow and system ----------------------------------------

    fn op_halt(m: &Machine) -> Result<(), Trap> {
        if m.is_kernel() {
            Err(Trap::Halt)
        } else {
            Err(Trap::ReservedInstruction)
        }
    }

    fn op_wait(m: &Machine) -> Result<(), Trap> {
        if m.is_kernel() {
            Err(Trap::Wait)
        } else {
            Ok(())
        }
    }

    fn op_reset(&self, m: &mut Machine) -> Result<(), Trap> {
        if m.is_kernel() {
            self.bus.reset();
        }
        Ok(())
    }

    /// RTI and RTT. Outside kernel mode the popped PSW cannot lower the
    /// priority or change the mode fields. RTT suppresses the trace trap
    /// for the instruction that follows.
    fn op_rti(&self, m: &mut Machine) -> Result<(), Trap> {
        let old_mode = m.current_mode();
        let new_pc = self.pop(m)?;
        let mut new_psw = self.pop(m)?;
        if m.is_kernel() {
            m.psw = new_psw;
        } else {
            new_psw &= !0o340;
            new_psw |= m.psw & 0o340;
            m.psw = (new_psw & !0o170000) | (m.psw & 0o170000);
        }
        let new_mode = m.current_mode();
        m.regs[PC] = new_pc;
        m.stacks[old_mode] = m.regs[SP];
        m.regs[SP] = m.stacks[new_mode];
        if m.ir == 0o000006 {
            Err(Trap::RttReturn)
        } else {
            Ok(())
        }
    }

    fn op_jmp(&self, m: &mut Machine) -> Result<(), Trap> {
        m.regs[PC] = self.load_effective_address(m, m.ir & 0o77)?;
        Ok(())
    }

    fn op_rts(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir) & 0o7;
        m.regs[PC] = m.regs[reg];
        m.regs[reg] = self.pop(m)?;
        Ok(())
    }

    fn op_cc(m: &mut Machine) -> Result<(), Trap> {
        if m.ir & 0o20 == 0 {
            m.psw &= !(m.ir & 0o17);
        } else {
            m.psw |= m.ir & 0o17;
        }
        Ok(())
    }

    fn op_jsr(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let target = self.load_effective_address(m, m.ir & 0o77)?;
        let saved = m.regs[reg];
        self.push(m, saved)?;
        m.regs[reg] = m.regs[PC];
        m.regs[PC] = target;
        Ok(())
    }

    fn op_mark(&self, m: &mut Machine) -> Result<(), Trap> {
        let count = (m.ir & 0o77).wrapping_mul(2);
        m.regs[SP] = m.regs[PC].wrapping_add(count);
        m.regs[PC] = m.regs[R5];
        m.regs[R5] = self.pop(m)?;
        Ok(())
    }

    fn op_sob(m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        m.regs[reg] = m.regs[reg].wrapping_sub(1);
        if m.regs[reg] != 0 {
            m.regs[PC] = m.regs[PC].wrapping_sub((m.ir & 0o77).wrapping_mul(2));
        }
        Ok(())
    }

    /// Unconditional branch: the offset is the sign-extended low byte,
    /// in words, relative to the updated PC.
    fn op_br(m: &mut Machine) -> Result<(), Trap> {
        let offset = i16::from(m.ir as i8) as u16;
        m.regs[PC] = m.regs[PC].wrapping_add(offset.wrapping_mul(2));
        Ok(())
    }

    /// Conditional branches come in complementary pairs selected by bit 8:
    /// clear branches when the predicate is false, set when true.
    fn op_branch_on(m: &mut Machine, predicate: bool) -> Result<(), Trap> {
        if predicate == ((m.ir >> 8) & 1 != 0) {
            Self::op_br(m)?;
        }
        Ok(())
    }

    // ---- word single-operand ---------------------------------------------

    fn op_clr(&self, m: &mut Machine) -> Result<(), Trap> {
        m.set_flag(PSW_C, false);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_Z, true);
        m.set_flag(PSW_N, false);
        self.store_dest(m, m.ir, 0)
    }

    fn op_com(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = !self.load_dest(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_C, true);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_inc(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o077777);
        let data = data.wrapping_add(1);
        m.set_nz_word(data);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_dec(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o100000);
        let data = data.wrapping_sub(1);
        m.set_nz_word(data);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_neg(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?.wrapping_neg();
        m.set_nz_word(data);
        m.set_flag(PSW_V, data == 0o100000);
        m.set_flag(PSW_C, data != 0);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_adc(&self, m: &mut Machine) -> Result<(), Trap> {
        let mut data = self.load_dest(m, m.ir)?;
        if m.flag(PSW_C) {
            m.set_flag(PSW_V, data == 0o077777);
            m.set_flag(PSW_C, data == 0o177777);
            data = data.wrapping_add(1);
        } else {
            m.set_flag(PSW_V, false);
            m.set_flag(PSW_C, false);
        }
        m.set_nz_word(data);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_sbc(&self, m: &mut Machine) -> Result<(), Trap> {
        let mut data = self.load_dest(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o100000);
        if m.flag(PSW_C) {
            m.set_flag(PSW_C, data == 0);
            data = data.wrapping_sub(1);
        } else {
            m.set_flag(PSW_C, false);
        }
        m.set_nz_word(data);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_tst(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_C, false);
        Ok(())
    }

    fn op_sxt(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = if m.flag(PSW_N) {
            m.set_flag(PSW_Z, false);
            0o177777
        } else {
            m.set_flag(PSW_Z, true);
            0
        };
        m.set_flag(PSW_V, false);
        self.store_dest(m, m.ir, data)
    }

    fn op_swab(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        let data = data.rotate_right(8);
        m.set_flag(PSW_C, false);
        m.set_flag(PSW_V, false);
        m.set_nz_byte(data as u8);
        self.store_dest_deferred(m, m.ir, data)
    }

    // ---- word shifts and rotates -----------------------------------------

    fn set_v_from_nc(m: &mut Machine) {
        let v = m.flag(PSW_N) ^ m.flag(PSW_C);
        m.set_flag(PSW_V, v);
    }

    fn op_ror(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        let carry_in = u16::from(m.flag(PSW_C)) << 15;
        m.set_flag(PSW_C, data & 1 != 0);
        let data = (data >> 1) | carry_in;
        m.set_nz_word(data);
        Self::set_v_from_nc(m);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_rol(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        let carry_in = u16::from(m.flag(PSW_C));
        m.set_flag(PSW_C, data & 0o100000 != 0);
        let data = (data << 1) | carry_in;
        m.set_nz_word(data);
        Self::set_v_from_nc(m);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_asr(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        m.set_flag(PSW_C, data & 1 != 0);
        let data = (data >> 1) | (data & 0o100000);
        m.set_nz_word(data);
        Self::set_v_from_nc(m);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_asl(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest(m, m.ir)?;
        m.set_flag(PSW_C, data & 0o100000 != 0);
        let data = data << 1;
        m.set_nz_word(data);
        Self::set_v_from_nc(m);
        self.store_dest_deferred(m, m.ir, data)
    }

    // ---- word double-operand ---------------------------------------------

    fn op_mov(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_source(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        self.store_dest(m, m.ir, data)
    }

    fn op_cmp(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = u32::from(self.load_source(m, m.ir)?);
        let dst = u32::from(self.load_dest(m, m.ir)?);
        let result = src + (!dst & WORD_MASK) + 1;
        m.set_nz_word(result as u16);
        m.set_flag(
            PSW_V,
            (src & WORD_SIGN) != (dst & WORD_SIGN) && (dst & WORD_SIGN) == (result & WORD_SIGN),
        );
        m.set_flag(PSW_C, result & WORD_CARRY == 0);
        Ok(())
    }

    fn op_bit(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source(m, m.ir)?;
        let dst = self.load_dest(m, m.ir)?;
        m.set_nz_word(src & dst);
        m.set_flag(PSW_V, false);
        Ok(())
    }

    fn op_bic(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source(m, m.ir)?;
        let data = !src & self.load_dest(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_bis(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source(m, m.ir)?;
        let data = src | self.load_dest(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        self.store_dest_deferred(m, m.ir, data)
    }

    fn op_add(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = u32::from(self.load_source(m, m.ir)?);
        let dst = u32::from(self.load_dest(m, m.ir)?);
        let result = src + dst;
        m.set_nz_word(result as u16);
        m.set_flag(
            PSW_V,
            (src & WORD_SIGN) == (dst & WORD_SIGN) && (src & WORD_SIGN) != (result & WORD_SIGN),
        );
        m.set_flag(PSW_C, result & WORD_CARRY != 0);
        self.store_dest_deferred(m, m.ir, result as u16)
    }

    fn op_sub(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = u32::from(self.load_source(m, m.ir)?);
        let dst = u32::from(self.load_dest(m, m.ir)?);
        let result = dst + (!src & WORD_MASK) + 1;
        m.set_nz_word(result as u16);
        m.set_flag(
            PSW_V,
            (src & WORD_SIGN) != (dst & WORD_SIGN) && (src & WORD_SIGN) == (result & WORD_SIGN),
        );
        m.set_flag(PSW_C, result & WORD_CARRY == 0);
        self.store_dest_deferred(m, m.ir, result as u16)
    }

    fn op_xor(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let data = m.regs[reg] ^ self.load_dest(m, m.ir)?;
        m.set_nz_word(data);
        m.set_flag(PSW_V, false);
        self.store_dest_deferred(m, m.ir, data)
    }

    // ---- extended arithmetic ---------------------------------------------

    fn op_mul(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let multiplier = i32::from(m.regs[reg] as i16);
        let multiplicand = i32::from(self.load_dest(m, m.ir)? as i16);
        let product = multiplier * multiplicand;
        m.regs[reg] = (product >> 16) as u16;
        m.regs[reg | 1] = product as u16;
        m.set_flag(PSW_Z, product == 0);
        m.set_flag(PSW_N, product < 0);
        m.set_flag(PSW_C, !(-32768..=32767).contains(&product));
        m.set_flag(PSW_V, false);
        Ok(())
    }

    fn op_div(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let dividend = ((u32::from(m.regs[reg]) << 16) | u32::from(m.regs[reg | 1])) as i32;
        let divisor = i32::from(self.load_dest(m, m.ir)? as i16);
        if divisor == 0 {
            m.set_flag(PSW_V, true);
            m.set_flag(PSW_C, true);
            return Ok(());
        }
        m.set_flag(PSW_C, false);
        let quotient = dividend.wrapping_div(divisor);
        m.regs[reg] = quotient as u16;
        m.set_flag(PSW_V, !(-0o100000..=0o077777).contains(&quotient));
        m.set_flag(PSW_N, quotient < 0);
        m.set_flag(PSW_Z, quotient == 0);
        m.regs[reg | 1] = dividend.wrapping_rem(divisor) as u16;
        Ok(())
    }

    /// ASH shifts one register by a signed six-bit count, one bit at a
    /// time so the carry tracks the last bit shifted out and the overflow
    /// flag latches any sign change.
    fn op_ash(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let old = u32::from(m.regs[reg]);
        let mut data = old;
        let count = self.load_dest(m, m.ir)?;
        if count & 0o77 == 0 {
            m.set_nz_word(data as u16);
            m.set_flag(PSW_V, false);
            m.set_flag(PSW_C, false);
            return Ok(());
        }
        if count & 0o40 == 0 {
            m.set_flag(PSW_V, false);
            for _ in 0..(count & 0o37) {
                m.set_flag(PSW_C, data & WORD_SIGN != 0);
                data <<= 1;
                if (data & WORD_SIGN) != (old & WORD_SIGN) {
                    m.set_flag(PSW_V, true);
                }
            }
        } else {
            let sign = data & WORD_SIGN;
            for _ in 0..(0o100 - (count & 0o77)) {
                m.set_flag(PSW_C, data & 1 != 0);
                data = (data >> 1) | sign;
            }
            m.set_flag(PSW_V, false);
        }
        m.regs[reg] = data as u16;
        m.set_nz_word(data as u16);
        Ok(())
    }

    /// ASHC: the 32-bit form of [`Self::op_ash`], over an even/odd
    /// register pair.
    fn op_ashc(&self, m: &mut Machine) -> Result<(), Trap> {
        let reg = usize::from(m.ir >> 6) & 0o7;
        let old = (u32::from(m.regs[reg]) << 16) | u32::from(m.regs[reg | 1]);
        let mut data = old;
        let count = self.load_dest(m, m.ir)?;
        if count & 0o77 == 0 {
            m.set_flag(PSW_N, data & 0x8000_0000 != 0);
            m.set_flag(PSW_Z, data == 0);
            m.set_flag(PSW_V, false);
            m.set_flag(PSW_C, false);
            return Ok(());
        }
        if count & 0o40 == 0 {
            m.set_flag(PSW_V, false);
            for _ in 0..(count & 0o37) {
                m.set_flag(PSW_C, data & 0x8000_0000 != 0);
                data <<= 1;
                if (data & 0x8000_0000) != (old & 0x8000_0000) {
                    m.set_flag(PSW_V, true);
                }
            }
        } else {
            let sign = data & 0x8000_0000;
            for _ in 0..(0o100 - (count & 0o77)) {
                m.set_flag(PSW_C, data & 1 != 0);
                data = (data >> 1) | sign;
            }
            m.set_flag(PSW_V, false);
        }
        m.set_flag(PSW_N, data & 0x8000_0000 != 0);
        m.set_flag(PSW_Z, data == 0);
        m.regs[reg] = (data >> 16) as u16;
        m.regs[reg | 1] = data as u16;
        Ok(())
    }

    // ---- previous-space and PSW moves ------------------------------------

    fn op_mfpi(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_previous(m, m.ir)?;
        self.push(m, data)
    }

    fn op_mtpi(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.pop(m)?;
        self.store_dest_previous(m, m.ir, data)
    }

    /// MTPS. Outside kernel mode only the condition codes are writable;
    /// the trace bit never is.
    fn op_mtps(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = u16::from(self.load_dest_byte(m, m.ir)?);
        let mask = if m.is_kernel() { 0o357 } else { 0o017 };
        m.psw = (m.psw & !mask) | (data & mask);
        Ok(())
    }

    fn op_mfps(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = m.psw as u8;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        self.store_dest_byte_ext(m, m.ir, data)
    }

    // ---- byte single-operand ---------------------------------------------

    fn op_clrb(&self, m: &mut Machine) -> Result<(), Trap> {
        m.set_flag(PSW_C, false);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_Z, true);
        m.set_flag(PSW_N, false);
        self.store_dest_byte(m, m.ir, 0)
    }

    fn op_comb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = !self.load_dest_byte(m, m.ir)?;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_C, true);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_incb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o177);
        let data = data.wrapping_add(1);
        m.set_nz_byte(data);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_decb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o200);
        let data = data.wrapping_sub(1);
        m.set_nz_byte(data);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_negb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?.wrapping_neg();
        m.set_nz_byte(data);
        m.set_flag(PSW_V, data == 0o200);
        m.set_flag(PSW_C, data != 0);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_adcb(&self, m: &mut Machine) -> Result<(), Trap> {
        let mut data = self.load_dest_byte(m, m.ir)?;
        if m.flag(PSW_C) {
            m.set_flag(PSW_V, data == 0o177);
            m.set_flag(PSW_C, data == 0o377);
            data = data.wrapping_add(1);
        } else {
            m.set_flag(PSW_V, false);
            m.set_flag(PSW_C, false);
        }
        m.set_nz_byte(data);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_sbcb(&self, m: &mut Machine) -> Result<(), Trap> {
        let mut data = self.load_dest_byte(m, m.ir)?;
        m.set_flag(PSW_V, data == 0o200);
        if m.flag(PSW_C) {
            m.set_flag(PSW_C, data == 0);
            data = data.wrapping_sub(1);
        } else {
            m.set_flag(PSW_C, false);
        }
        m.set_nz_byte(data);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_tstb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        m.set_flag(PSW_C, false);
        Ok(())
    }

    fn op_rorb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        let carry_in = u8::from(m.flag(PSW_C)) << 7;
        m.set_flag(PSW_C, data & 1 != 0);
        let data = (data >> 1) | carry_in;
        m.set_nz_byte(data);
        Self::set_v_from_nc(m);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_rolb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        let carry_in = u8::from(m.flag(PSW_C));
        m.set_flag(PSW_C, data & 0o200 != 0);
        let data = (data << 1) | carry_in;
        m.set_nz_byte(data);
        Self::set_v_from_nc(m);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_asrb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        m.set_flag(PSW_C, data & 1 != 0);
        let data = (data >> 1) | (data & 0o200);
        m.set_nz_byte(data);
        Self::set_v_from_nc(m);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_aslb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_dest_byte(m, m.ir)?;
        m.set_flag(PSW_C, data & 0o200 != 0);
        let data = data << 1;
        m.set_nz_byte(data);
        Self::set_v_from_nc(m);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    // ---- byte double-operand ---------------------------------------------

    fn op_movb(&self, m: &mut Machine) -> Result<(), Trap> {
        let data = self.load_source_byte(m, m.ir)?;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        self.store_dest_byte_ext(m, m.ir, data)
    }

    fn op_cmpb(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = u32::from(self.load_source_byte(m, m.ir)?);
        let dst = u32::from(self.load_dest_byte(m, m.ir)?);
        let result = src + (!dst & BYTE_MASK) + 1;
        m.set_nz_byte(result as u8);
        m.set_flag(
            PSW_V,
            (src & BYTE_SIGN) != (dst & BYTE_SIGN) && (dst & BYTE_SIGN) == (result & BYTE_SIGN),
        );
        m.set_flag(PSW_C, result & BYTE_CARRY == 0);
        Ok(())
    }

    fn op_bitb(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source_byte(m, m.ir)?;
        let dst = self.load_dest_byte(m, m.ir)?;
        m.set_nz_byte(src & dst);
        m.set_flag(PSW_V, false);
        Ok(())
    }

    fn op_bicb(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source_byte(m, m.ir)?;
        let data = !src & self.load_dest_byte(m, m.ir)?;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        self.store_dest_byte_deferred(m, m.ir, data)
    }

    fn op_bisb(&self, m: &mut Machine) -> Result<(), Trap> {
        let src = self.load_source_byte(m, m.ir)?;
        let data = src | self.load_dest_byte(m, m.ir)?;
        m.set_nz_byte(data);
        m.set_flag(PSW_V, false);
        self.store_dest_byte_deferred(m, m.ir, data)
    }
}

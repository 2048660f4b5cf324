//! Operand addressing: the eight mode/register specifier forms, with their
//! auto-increment/decrement side effects and the deferred-store address
//! latch for read-modify-write instructions.
//!
//! Byte accesses step registers by one except for SP and PC, which always
//! step by two, and the deferred modes, which fetch a word pointer. A
//! kernel-mode auto-decrement of SP that lands below the stack limit arms
//! the post-instruction stack check rather than faulting immediately.

use super::{Cpu, Machine, PC, SP, STACK_LIMIT};
use crate::trap::Trap;

const fn byte_step(reg: usize) -> u16 {
    if reg >= SP {
        2
    } else {
        1
    }
}

impl Cpu {
    /// Resolves a memory operand address for `spec` (modes 1..=7),
    /// applying register side effects. `step` is the auto-modify stride
    /// for the direct modes.
    fn operand_address(&self, m: &mut Machine, spec: u16, step: u16) -> Result<u16, Trap> {
        let mode = (spec >> 3) & 0o7;
        let reg = usize::from(spec) & 0o7;
        match mode {
            1 => Ok(m.regs[reg]),
            2 => {
                let addr = m.regs[reg];
                m.regs[reg] = m.regs[reg].wrapping_add(step);
                Ok(addr)
            }
            3 => {
                let pointer = m.regs[reg];
                m.regs[reg] = m.regs[reg].wrapping_add(2);
                self.logical_read(m, pointer)
            }
            4 => {
                m.regs[reg] = m.regs[reg].wrapping_sub(step);
                if reg == SP && m.is_kernel() && m.regs[SP] < STACK_LIMIT {
                    m.stack_check = true;
                }
                Ok(m.regs[reg])
            }
            5 => {
                m.regs[reg] = m.regs[reg].wrapping_sub(2);
                if reg == SP && m.is_kernel() && m.regs[SP] < STACK_LIMIT {
                    m.stack_check = true;
                }
                let pointer = m.regs[reg];
                self.logical_read(m, pointer)
            }
            6 => {
                let pc = m.regs[PC];
                let index = self.logical_read(m, pc)?;
                m.regs[PC] = m.regs[PC].wrapping_add(2);
                Ok(m.regs[reg].wrapping_add(index))
            }
            _ => {
                let pc = m.regs[PC];
                let index = self.logical_read(m, pc)?;
                m.regs[PC] = m.regs[PC].wrapping_add(2);
                let pointer = m.regs[reg].wrapping_add(index);
                self.logical_read(m, pointer)
            }
        }
    }

    /// Effective address for JMP and JSR. Register mode has no address
    /// and is illegal.
    pub(super) fn load_effective_address(&self, m: &mut Machine, spec: u16) -> Result<u16, Trap> {
        if spec & 0o70 == 0 {
            return Err(Trap::IllegalInstruction);
        }
        self.operand_address(m, spec, 2)
    }

    pub(super) fn load_source(&self, m: &mut Machine, ir: u16) -> Result<u16, Trap> {
        let spec = (ir >> 6) & 0o77;
        if spec & 0o70 == 0 {
            return Ok(m.regs[usize::from(spec) & 0o7]);
        }
        let addr = self.operand_address(m, spec, 2)?;
        self.logical_read(m, addr)
    }

    pub(super) fn load_source_byte(&self, m: &mut Machine, ir: u16) -> Result<u8, Trap> {
        let spec = (ir >> 6) & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            return Ok(m.regs[reg] as u8);
        }
        let addr = self.operand_address(m, spec, byte_step(reg))?;
        self.logical_read_byte(m, addr)
    }

    /// Reads the destination operand and latches its address for a
    /// deferred store.
    pub(super) fn load_dest(&self, m: &mut Machine, ir: u16) -> Result<u16, Trap> {
        let spec = ir & 0o77;
        if spec & 0o70 == 0 {
            return Ok(m.regs[usize::from(spec) & 0o7]);
        }
        let addr = self.operand_address(m, spec, 2)?;
        m.saved_address = addr;
        self.logical_read(m, addr)
    }

    pub(super) fn load_dest_byte(&self, m: &mut Machine, ir: u16) -> Result<u8, Trap> {
        let spec = ir & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            return Ok(m.regs[reg] as u8);
        }
        let addr = self.operand_address(m, spec, byte_step(reg))?;
        m.saved_address = addr;
        self.logical_read_byte(m, addr)
    }

    /// Write-only destination store: resolves the specifier fresh, with
    /// its side effects.
    pub(super) fn store_dest(&self, m: &mut Machine, ir: u16, data: u16) -> Result<(), Trap> {
        let spec = ir & 0o77;
        if spec & 0o70 == 0 {
            m.regs[usize::from(spec) & 0o7] = data;
            return Ok(());
        }
        let addr = self.operand_address(m, spec, 2)?;
        self.logical_write(m, addr, data)
    }

    /// Read-modify-write store: reuses the address latched by
    /// [`Self::load_dest`].
    pub(super) fn store_dest_deferred(
        &self,
        m: &mut Machine,
        ir: u16,
        data: u16,
    ) -> Result<(), Trap> {
        if ir & 0o70 == 0 {
            m.regs[usize::from(ir) & 0o7] = data;
            return Ok(());
        }
        let addr = m.saved_address;
        self.logical_write(m, addr, data)
    }

    pub(super) fn store_dest_byte(&self, m: &mut Machine, ir: u16, data: u8) -> Result<(), Trap> {
        let spec = ir & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            m.regs[reg] = (m.regs[reg] & 0o177400) | u16::from(data);
            return Ok(());
        }
        let addr = self.operand_address(m, spec, byte_step(reg))?;
        self.logical_write_byte(m, addr, data)
    }

    pub(super) fn store_dest_byte_deferred(
        &self,
        m: &mut Machine,
        ir: u16,
        data: u8,
    ) -> Result<(), Trap> {
        let reg = usize::from(ir) & 0o7;
        if ir & 0o70 == 0 {
            m.regs[reg] = (m.regs[reg] & 0o177400) | u16::from(data);
            return Ok(());
        }
        let addr = m.saved_address;
        self.logical_write_byte(m, addr, data)
    }

    /// MOVB's register-destination quirk: the byte sign-extends across
    /// the whole register.
    pub(super) fn store_dest_byte_ext(&self, m: &mut Machine, ir: u16, data: u8) -> Result<(), Trap> {
        let spec = ir & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            m.regs[reg] = i16::from(data as i8) as u16;
            return Ok(());
        }
        let addr = self.operand_address(m, spec, byte_step(reg))?;
        self.logical_write_byte(m, addr, data)
    }

    /// MFPI's destination read: register mode with SP yields the
    /// previous mode's shadow; memory operands translate through the
    /// previous address space.
    pub(super) fn load_dest_previous(&self, m: &mut Machine, ir: u16) -> Result<u16, Trap> {
        let spec = ir & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            if reg == SP {
                return Ok(m.stacks[m.previous_mode()]);
            }
            return Ok(m.regs[reg]);
        }
        let addr = self.operand_address(m, spec, 2)?;
        self.logical_read_previous(m, addr)
    }

    /// MTPI's destination store, the mirror of [`Self::load_dest_previous`].
    pub(super) fn store_dest_previous(
        &self,
        m: &mut Machine,
        ir: u16,
        data: u16,
    ) -> Result<(), Trap> {
        let spec = ir & 0o77;
        let reg = usize::from(spec) & 0o7;
        if spec & 0o70 == 0 {
            if reg == SP {
                m.stacks[m.previous_mode()] = data;
            } else {
                m.regs[reg] = data;
            }
            return Ok(());
        }
        let addr = self.operand_address(m, spec, 2)?;
        self.logical_write_previous(m, addr, data)
    }

    pub(super) fn push(&self, m: &mut Machine, data: u16) -> Result<(), Trap> {
        m.regs[SP] = m.regs[SP].wrapping_sub(2);
        if m.is_kernel() && m.regs[SP] < STACK_LIMIT {
            m.stack_check = true;
        }
        let sp = m.regs[SP];
        self.logical_write(m, sp, data)
    }

    pub(super) fn pop(&self, m: &mut Machine) -> Result<u16, Trap> {
        let sp = m.regs[SP];
        let data = self.logical_read(m, sp)?;
        m.regs[SP] = m.regs[SP].wrapping_add(2);
        Ok(data)
    }
}

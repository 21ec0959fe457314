//! The fetch/decode/execute loop and the ALU/addressing semantics behind each instruction family.

use crate::encoding::{self, AddrMode, Instruction, MemOperand, Opcode, Operand2, ShiftAmount, ShiftType};
use crate::regs::{Nzcv, RegisterFile};
use basm_memory::bus::SystemBus;

/// The single fallible channel the run loop reports through, replacing the source toolchain's
/// out-parameter style with one sticky field on [`Cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Ok,
    Decode,
    Bus,
    Vm,
    Divide,
    Halt,
}

/// Owns register state only; a `SystemBus` is borrowed for the duration of [`run`](Cpu::run)
/// rather than stored, so one `Cpu` can drive different buses across calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cpu {
    pub regs: RegisterFile,
    pub exception: Exception,
}

impl Default for Exception {
    fn default() -> Self {
        Exception::Ok
    }
}

fn apply_shift(value: u32, shift_type: ShiftType, amount: u8) -> (u32, bool) {
    match shift_type {
        ShiftType::Lsl => {
            if amount == 0 {
                (value, false)
            } else if amount >= 32 {
                (0, amount == 32 && (value & 1) != 0)
            } else {
                (value << amount, (value >> (32 - amount)) & 1 != 0)
            }
        }
        ShiftType::Lsr => {
            let amount = if amount == 0 { 32 } else { amount };
            if amount >= 32 {
                (0, amount == 32 && (value >> 31) & 1 != 0)
            } else {
                (value >> amount, (value >> (amount - 1)) & 1 != 0)
            }
        }
        ShiftType::Asr => {
            let amount = if amount == 0 { 32 } else { amount };
            let signed = value as i32;
            if amount >= 32 {
                let result = if signed < 0 { u32::MAX } else { 0 };
                (result, signed < 0)
            } else {
                ((signed >> amount) as u32, (value >> (amount - 1)) & 1 != 0)
            }
        }
        ShiftType::Ror => {
            let amount = amount % 32;
            if amount == 0 {
                (value, (value >> 31) & 1 != 0)
            } else {
                (value.rotate_right(amount as u32), (value >> (amount - 1)) & 1 != 0)
            }
        }
    }
}

/// Resolves an [`Operand2`] to its value and the carry it produces (used by shifted data
/// processing; `TST`-family barrel-shift carry feeds into the flag update on `S` forms).
fn resolve_operand2(regs: &RegisterFile, operand2: Operand2) -> (u32, bool) {
    match operand2 {
        Operand2::Imm(imm) => (imm as u32, false),
        Operand2::Reg { rm, shift_type, shift_amt } => apply_shift(regs.read_reg(rm), shift_type, shift_amt),
    }
}

fn resolve_shift_amount(regs: &RegisterFile, amount: ShiftAmount) -> u8 {
    match amount {
        ShiftAmount::Imm(amt) => amt,
        ShiftAmount::Reg(rm) => (regs.read_reg(rm) & 0xFF) as u8,
    }
}

struct AddResult {
    value: u32,
    carry: bool,
    overflow: bool,
}

fn add_with_carry(a: u32, b: u32, carry_in: bool) -> AddResult {
    // Folds the carry into `a` before adding `b`, then ORs the per-stage signed-overflow checks
    // rather than applying the two-operand formula once to `a`/`b`/final result: matching the
    // original's own add-with-carry, which under- or over-reports V against a single combined
    // check whenever the carry-in flips a stage's sign on its own (e.g. INT_MAX + 1 + INT_MIN).
    let c = carry_in as u32;
    let (r1, c1) = a.overflowing_add(c);
    let ovf1 = ((a ^ r1) & (c ^ r1)) >> 31 != 0;
    let (r2, c2) = r1.overflowing_add(b);
    let ovf2 = ((r1 ^ r2) & (b ^ r2)) >> 31 != 0;
    AddResult { value: r2, carry: c1 | c2, overflow: ovf1 | ovf2 }
}

fn sub_with_borrow(a: u32, b: u32, borrow_in_clear: bool) -> AddResult {
    // Subtraction modeled as addition of the bitwise complement, matching the "C = no borrow"
    // convention from the flag rules: `A - B - !Cin` where `Cin` starts the chain as "no borrow".
    add_with_carry(a, !b, borrow_in_clear)
}

impl Cpu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update_nzcv(&mut self, s: bool, result: u32, carry: bool, overflow: bool) {
        if s {
            self.regs.nzcv = Nzcv::from_bits_individual(result >> 31 != 0, result == 0, carry, overflow);
        }
    }

    /// Executes up to `max_instructions`, fetching each word memory-mapped at `pc`, pre-incrementing
    /// `pc` by 4 before dispatch (branch offsets are relative to the next instruction). Returns the
    /// exception that stopped execution (`Exception::Ok` only if `max_instructions` is exhausted
    /// cleanly without fault).
    pub fn run(&mut self, bus: &mut SystemBus, max_instructions: u64) -> Exception {
        for _ in 0..max_instructions {
            let pc = self.regs.pc;
            let word = match bus.read_word(pc, true) {
                Ok(word) => word,
                Err(_) => {
                    self.exception = Exception::Vm;
                    return self.exception;
                }
            };
            self.regs.pc = pc.wrapping_add(4);

            let instruction = match encoding::decode(word) {
                Ok(instruction) => instruction,
                Err(_) => {
                    self.exception = Exception::Decode;
                    return self.exception;
                }
            };
            log::trace!("{pc:#010x}: {word:#010x} {instruction:?}");

            if let Some(exception) = self.dispatch(bus, instruction) {
                self.exception = exception;
                return exception;
            }
        }
        self.exception = Exception::Ok;
        Exception::Ok
    }

    /// Dispatches one decoded instruction. Returns `Some(exception)` to stop the loop, `None` to
    /// continue to the next instruction.
    fn dispatch(&mut self, bus: &mut SystemBus, instruction: Instruction) -> Option<Exception> {
        match instruction {
            Instruction::Halt => return Some(Exception::Halt),
            Instruction::DataProcessing { op, s, rd, rn, operand2 } => self.exec_data_processing(op, s, rd, rn, operand2),
            Instruction::Shift { op, s, rd, rn, amount } => self.exec_shift(op, s, rd, rn, amount),
            Instruction::Multiply { op, s, rd, rd_hi, rn, rm } => self.exec_multiply(op, s, rd, rd_hi, rn, rm),
            Instruction::Memory { op, rd, rn, offset, mode } => {
                if let Err(exception) = self.exec_memory(bus, op, rd, rn, offset, mode) {
                    return Some(exception);
                }
            }
            Instruction::Branch { op, offset } => self.exec_branch(op, offset),
        }
        None
    }

    fn exec_data_processing(&mut self, op: Opcode, s: bool, rd: u8, rn: u8, operand2: Operand2) {
        let a = self.regs.read_reg(rn);
        let (b, shift_carry) = resolve_operand2(&self.regs, operand2);
        let carry_in = self.regs.nzcv.contains(Nzcv::C);

        use Opcode::*;
        match op {
            Add | Cmn => {
                let r = add_with_carry(a, b, false);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                if op == Add {
                    self.regs.write_reg(rd, r.value);
                }
            }
            Adc => {
                let r = add_with_carry(a, b, carry_in);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                self.regs.write_reg(rd, r.value);
            }
            Sub | Cmp => {
                let r = sub_with_borrow(a, b, true);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                if op == Sub {
                    self.regs.write_reg(rd, r.value);
                }
            }
            Sbc => {
                // Cin here is consumed as a borrow (result = a - b - Cin), the opposite polarity
                // from the "no borrow" convention sub_with_borrow's second argument expects.
                let r = sub_with_borrow(a, b, !carry_in);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                self.regs.write_reg(rd, r.value);
            }
            Rsb => {
                let r = sub_with_borrow(b, a, true);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                self.regs.write_reg(rd, r.value);
            }
            Rsc => {
                let r = sub_with_borrow(b, a, !carry_in);
                self.update_nzcv(s, r.value, r.carry, r.overflow);
                self.regs.write_reg(rd, r.value);
            }
            And | Tst => {
                let r = a & b;
                self.update_nzcv(s, r, shift_carry, self.regs.nzcv.contains(Nzcv::V));
                if op == And {
                    self.regs.write_reg(rd, r);
                }
            }
            Orr => {
                let r = a | b;
                self.update_nzcv(s, r, shift_carry, self.regs.nzcv.contains(Nzcv::V));
                self.regs.write_reg(rd, r);
            }
            Eor | Teq => {
                let r = a ^ b;
                self.update_nzcv(s, r, shift_carry, self.regs.nzcv.contains(Nzcv::V));
                if op == Eor {
                    self.regs.write_reg(rd, r);
                }
            }
            Bic => {
                let r = a & !b;
                self.update_nzcv(s, r, shift_carry, self.regs.nzcv.contains(Nzcv::V));
                self.regs.write_reg(rd, r);
            }
            _ => unreachable!("exec_data_processing only dispatched for O-format opcodes"),
        }
    }

    fn exec_shift(&mut self, op: Opcode, s: bool, rd: u8, rn: u8, amount: ShiftAmount) {
        let value = self.regs.read_reg(rn);
        let amt = resolve_shift_amount(&self.regs, amount);
        let shift_type = match op {
            Opcode::Lsl => ShiftType::Lsl,
            Opcode::Lsr => ShiftType::Lsr,
            Opcode::Asr => ShiftType::Asr,
            Opcode::Ror => ShiftType::Ror,
            _ => unreachable!("exec_shift only dispatched for shift opcodes"),
        };
        let (result, carry) = apply_shift(value, shift_type, amt);
        self.update_nzcv(s, result, carry, self.regs.nzcv.contains(Nzcv::V));
        self.regs.write_reg(rd, result);
    }

    fn exec_multiply(&mut self, op: Opcode, s: bool, rd: u8, rd_hi: u8, rn: u8, rm: u8) {
        let a = self.regs.read_reg(rn);
        let b = self.regs.read_reg(rm);
        match op {
            Opcode::Mul => {
                let result = a.wrapping_mul(b);
                self.update_nzcv(s, result, self.regs.nzcv.contains(Nzcv::C), self.regs.nzcv.contains(Nzcv::V));
                self.regs.write_reg(rd, result);
            }
            Opcode::Umull => {
                let result = (a as u64) * (b as u64);
                self.regs.write_reg(rd, result as u32);
                self.regs.write_reg(rd_hi, (result >> 32) as u32);
                if s {
                    self.regs.nzcv = Nzcv::from_bits_individual((result >> 63) & 1 != 0, result == 0, false, false);
                }
            }
            Opcode::Smull => {
                let result = (a as i32 as i64) * (b as i32 as i64);
                self.regs.write_reg(rd, result as u32);
                self.regs.write_reg(rd_hi, (result >> 32) as u32);
                if s {
                    self.regs.nzcv = Nzcv::from_bits_individual(result < 0, result == 0, false, false);
                }
            }
            _ => unreachable!("exec_multiply only dispatched for multiply opcodes"),
        }
    }

    fn exec_memory(
        &mut self,
        bus: &mut SystemBus,
        op: Opcode,
        rd: u8,
        rn: u8,
        offset: MemOperand,
        mode: AddrMode,
    ) -> Result<(), Exception> {
        let base = self.regs.read_reg(rn);
        let delta = match offset {
            MemOperand::Imm(imm) => imm as i32,
            MemOperand::Reg(rm) => self.regs.read_reg(rm) as i32,
        };
        let indexed = base.wrapping_add(delta as u32);
        let effective = if mode == AddrMode::PostIndexed { base } else { indexed };

        let result = match op {
            Opcode::Ldr => bus.read_word(effective, true).map(|w| self.regs.write_reg(rd, w)),
            Opcode::Str => bus.write_word(effective, self.regs.read_reg(rd), true),
            Opcode::Ldrb => bus.read_byte(effective, true).map(|b| self.regs.write_reg(rd, b as u32)),
            Opcode::Strb => bus.write_byte(effective, self.regs.read_reg(rd) as u8, true),
            Opcode::Ldrh => bus.read_hword(effective, true).map(|h| self.regs.write_reg(rd, h as u32)),
            Opcode::Strh => bus.write_hword(effective, self.regs.read_reg(rd) as u16, true),
            _ => unreachable!("exec_memory only dispatched for memory opcodes"),
        };
        result.map_err(|_| Exception::Vm)?;

        // Writeback commits after the memory effect, before flags/PC per the ordering guarantee;
        // this family never touches flags, so writeback is simply the last step.
        if mode != AddrMode::Offset {
            self.regs.write_reg(rn, indexed);
        }
        Ok(())
    }

    fn exec_branch(&mut self, op: Opcode, offset: i32) {
        let target = (self.regs.pc as i64 + (offset as i64 * 4)) as u32;
        match op {
            Opcode::Branch | Opcode::Call => self.regs.pc = target,
            Opcode::Ret => self.regs.pc = target,
            _ => unreachable!("exec_branch only dispatched for control-transfer opcodes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{format_halt, format_m, format_o_imm, format_o_reg};

    fn bus_with_ram() -> SystemBus {
        SystemBus::new(64)
    }

    #[test]
    fn adc_immediate_with_carry_in() {
        let mut bus = bus_with_ram();
        bus.write_word(0, format_o_imm(Opcode::Adc, false, 0, 1, 9), true).unwrap();
        bus.write_word(4, format_halt(), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.regs.write_reg(1, 1);
        cpu.regs.nzcv = Nzcv::C;
        cpu.run(&mut bus, 10);
        assert_eq!(cpu.regs.read_reg(0), 11);
        assert_eq!(cpu.regs.read_reg(1), 1);
        assert!(!cpu.regs.nzcv.contains(Nzcv::N));
        assert!(!cpu.regs.nzcv.contains(Nzcv::Z));
        // S form wasn't requested, so C must be left untouched from before the instruction.
        assert!(cpu.regs.nzcv.contains(Nzcv::C));
    }

    #[test]
    fn adc_register_overflow_sets_flags() {
        let mut bus = bus_with_ram();
        bus.write_word(0, format_o_reg(Opcode::Adc, true, 0, 1, 2, ShiftType::Lsl, 0), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.regs.write_reg(1, 0x7FFF_FFFF);
        cpu.regs.write_reg(2, 0x8000_0000);
        cpu.regs.nzcv = Nzcv::C;
        cpu.run(&mut bus, 1);
        assert_eq!(cpu.regs.read_reg(0), 0);
        assert!(!cpu.regs.nzcv.contains(Nzcv::N));
        assert!(cpu.regs.nzcv.contains(Nzcv::Z));
        assert!(cpu.regs.nzcv.contains(Nzcv::C));
        assert!(cpu.regs.nzcv.contains(Nzcv::V));
    }

    #[test]
    fn ldr_positive_offset() {
        let mut bus = bus_with_ram();
        bus.write_word(0x40, 0xCAFEBABE, true).unwrap();
        bus.write_word(0, format_m(Opcode::Ldr, 0, 1, MemOperand::Imm(0x40), AddrMode::Offset), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.run(&mut bus, 1);
        assert_eq!(cpu.regs.read_reg(0), 0xCAFEBABE);
        assert_eq!(cpu.regs.read_reg(1), 0);
    }

    #[test]
    fn ldr_pre_indexed_writes_back_base() {
        let mut bus = bus_with_ram();
        bus.write_word(0x40, 0x1234, true).unwrap();
        bus.write_word(0, format_m(Opcode::Ldr, 0, 1, MemOperand::Imm(0x40), AddrMode::PreIndexed), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.run(&mut bus, 1);
        assert_eq!(cpu.regs.read_reg(0), 0x1234);
        assert_eq!(cpu.regs.read_reg(1), 0x40);
    }

    #[test]
    fn str_post_indexed_uses_original_base_then_writes_back() {
        let mut bus = bus_with_ram();
        bus.write_word(0, format_m(Opcode::Str, 2, 1, MemOperand::Imm(0x10), AddrMode::PostIndexed), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.regs.write_reg(1, 0x100);
        cpu.regs.write_reg(2, 0xFEED);
        cpu.run(&mut bus, 1);
        assert_eq!(bus.read_word(0x100, true).unwrap(), 0xFEED);
        assert_eq!(cpu.regs.read_reg(1), 0x110);
    }

    #[test]
    fn halt_stops_the_loop() {
        let mut bus = bus_with_ram();
        bus.write_word(0, format_halt(), true).unwrap();
        let mut cpu = Cpu::new();
        let exception = cpu.run(&mut bus, 10);
        assert_eq!(exception, Exception::Halt);
        assert_eq!(cpu.regs.pc, 4);
    }

    #[test]
    fn lsr_shift_by_32_encoded_as_zero() {
        let mut bus = bus_with_ram();
        bus.write_word(0, crate::encoding::format_o1(Opcode::Lsr, true, 0, 1, ShiftAmount::Imm(0)), true).unwrap();
        let mut cpu = Cpu::new();
        cpu.regs.write_reg(1, 0x8000_0000);
        cpu.run(&mut bus, 1);
        assert_eq!(cpu.regs.read_reg(0), 0);
        assert!(cpu.regs.nzcv.contains(Nzcv::C));
    }
}

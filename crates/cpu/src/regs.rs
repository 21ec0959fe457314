//! The register file: 16 general-purpose registers plus the program counter and NZCV flags.
//!
//! Register 0 is hardwired to zero (spec: "writes to register 0 are silently dropped; reads
//! yield 0"). Every access goes through [`RegisterFile::read_reg`]/[`write_reg`](RegisterFile::write_reg)
//! so that rule lives in exactly one place instead of being re-checked at every call site.

use bitflags::bitflags;

bitflags! {
    /// Condition flags set by the `S` form of arithmetic/logical instructions.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Nzcv: u8 {
        const N = 0b1000;
        const Z = 0b0100;
        const C = 0b0010;
        const V = 0b0001;
    }
}

impl Nzcv {
    /// Builds flags from individual booleans, matching the order N, Z, C, V.
    #[must_use]
    pub fn from_bits_individual(n: bool, z: bool, c: bool, v: bool) -> Self {
        let mut flags = Nzcv::empty();
        flags.set(Nzcv::N, n);
        flags.set(Nzcv::Z, z);
        flags.set(Nzcv::C, c);
        flags.set(Nzcv::V, v);
        flags
    }
}

pub const REGISTER_COUNT: usize = 16;

/// 16 general-purpose registers, program counter, and condition flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterFile {
    gpr: [u32; REGISTER_COUNT],
    pub pc: u32,
    pub nzcv: Nzcv,
}

impl RegisterFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads register `n`. Register 0 always reads as 0.
    #[must_use]
    pub fn read_reg(&self, n: u8) -> u32 {
        if n == 0 { 0 } else { self.gpr[n as usize] }
    }

    /// Writes register `n`. Writes to register 0 are silently dropped.
    pub fn write_reg(&mut self, n: u8, value: u32) {
        if n != 0 {
            self.gpr[n as usize] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_zero_is_hardwired() {
        let mut regs = RegisterFile::new();
        regs.write_reg(0, 0xDEAD_BEEF);
        assert_eq!(regs.read_reg(0), 0);
    }

    #[test]
    fn other_registers_round_trip() {
        let mut regs = RegisterFile::new();
        regs.write_reg(5, 123);
        assert_eq!(regs.read_reg(5), 123);
    }

    #[test]
    fn nzcv_bit_order() {
        let flags = Nzcv::from_bits_individual(true, false, true, false);
        assert!(flags.contains(Nzcv::N));
        assert!(!flags.contains(Nzcv::Z));
        assert!(flags.contains(Nzcv::C));
        assert!(!flags.contains(Nzcv::V));
    }
}

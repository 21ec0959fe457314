//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_cpu::prelude::*;
//! ```

#[doc(inline)]
pub use crate::encoding::{
    AddrMode, Instruction, MemOperand, Opcode, Operand2, ShiftAmount, ShiftType, decode, format_branch,
    format_halt, format_m, format_o1, format_o2, format_o_imm, format_o_reg,
};
#[doc(inline)]
pub use crate::exec::{Cpu, Exception};
#[doc(inline)]
pub use crate::regs::{Nzcv, RegisterFile};

pub mod encoding {
    pub use crate::encoding::Error;
}

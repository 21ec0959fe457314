//! Register file, instruction encoding, and the fetch/decode/execute loop for the `basm` CPU.

pub mod encoding;
pub mod exec;
pub mod prelude;
pub mod regs;
